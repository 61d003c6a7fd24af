mod stream;
mod transactional;

pub use stream::StreamWriter;
pub use transactional::TransactionalWriter;

use crate::error::WriteError;
use crate::model::{Feature, Geometry};
use crate::statement::StatementBuilder;
use crate::store::{BatchRow, OpKind, RowBatch, WriteConnection};
use crate::write::context::RequestContext;
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Parameters shared by every statement of one request.
pub struct WriteJob<'a> {
    pub table: &'a str,
    pub handle_uuid: bool,
    pub version: Option<i64>,
    pub extending: bool,
    pub builder: &'a dyn StatementBuilder,
    pub ctx: &'a RequestContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    MissingId,
    MissingPuuid,
    /// Any other failure; reported with the opaque general message.
    Generic,
}

/// A row that failed before or outside a batch result.
#[derive(Debug, Clone, PartialEq)]
pub struct RowRejection {
    pub position: usize,
    pub id: Option<String>,
    pub reason: RejectReason,
}

/// One executed batch: the result row plus, index-aligned with it, the
/// submitted rows' positions in the source list.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    pub positions: Vec<usize>,
    pub ids: Vec<String>,
    /// Whether an optimistic uuid check applied to the row.
    pub uuid_checked: Vec<bool>,
    pub row: BatchRow,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationOutcome {
    pub kind: OpKind,
    pub batches: Vec<BatchOutcome>,
    pub rejected: Vec<RowRejection>,
}

impl OperationOutcome {
    pub fn new(kind: OpKind) -> Self {
        Self {
            kind,
            batches: Vec::new(),
            rejected: Vec::new(),
        }
    }

    pub fn reject(&mut self, position: usize, id: Option<String>, reason: RejectReason) {
        self.rejected.push(RowRejection {
            position,
            id,
            reason,
        });
    }
}

/// Executes one operation kind of a request against the store.
///
/// Per-row failures are reported in the outcome; an `Err` aborts the request.
pub trait BatchWriteStrategy {
    fn name(&self) -> &'static str;

    fn delete(
        &self,
        conn: &mut dyn WriteConnection,
        job: &WriteJob<'_>,
        deletes: &[(String, Option<String>)],
    ) -> Result<OperationOutcome, WriteError>;

    fn insert(
        &self,
        conn: &mut dyn WriteConnection,
        job: &WriteJob<'_>,
        inserts: &[Feature],
    ) -> Result<OperationOutcome, WriteError>;

    fn update(
        &self,
        conn: &mut dyn WriteConnection,
        job: &WriteJob<'_>,
        updates: &[Feature],
    ) -> Result<OperationOutcome, WriteError>;
}

static STREAM: StreamWriter = StreamWriter;
static TRANSACTIONAL: TransactionalWriter = TransactionalWriter;

pub fn strategy_for(transactional: bool) -> &'static dyn BatchWriteStrategy {
    if transactional {
        &TRANSACTIONAL
    } else {
        &STREAM
    }
}

/// Column values of one feature: json without geometry, sanitized geometry.
pub(crate) fn bind_feature(
    feature: &Feature,
    version: Option<i64>,
) -> Result<(Value, Option<Geometry>), WriteError> {
    let geometry = feature.geometry.as_ref().map(Geometry::sanitized).transpose()?;
    Ok((feature.to_jsondata(version)?, geometry))
}

/// Client updates need an id, and a prior uuid when the concurrency check is
/// on. Tombstones may carry none: a delete without puuid is unchecked.
pub(crate) fn check_update(feature: &Feature, handle_uuid: bool) -> Result<&str, RejectReason> {
    let id = feature.id().ok_or(RejectReason::MissingId)?;
    if handle_uuid && feature.puuid().is_none() && !feature.is_tombstone() {
        return Err(RejectReason::MissingPuuid);
    }
    Ok(id)
}

/// The uuid bound for an update row, `None` when unchecked.
pub(crate) fn update_puuid(feature: &Feature, handle_uuid: bool) -> Option<String> {
    if handle_uuid {
        feature.puuid().map(str::to_string)
    } else {
        None
    }
}

/// Positions of deletes checked against a prior uuid, and of the rest.
/// Without the concurrency check everything lands in the first bucket.
pub(crate) fn delete_buckets(
    deletes: &[(String, Option<String>)],
    handle_uuid: bool,
) -> (Vec<usize>, Vec<usize>) {
    (0..deletes.len()).partition(|&pos| !handle_uuid || deletes[pos].1.is_some())
}

/// Builds the statement for `batch`, executes it and validates the result row.
pub(crate) fn execute_batch(
    conn: &mut dyn WriteConnection,
    job: &WriteJob<'_>,
    batch: &RowBatch,
) -> Result<BatchRow, WriteError> {
    let spec = batch.spec(job.extending);
    let sql = job.builder.build(job.table, &spec);
    let timeout = job.ctx.statement_timeout()?;
    debug!(
        stream_id = %job.ctx.stream_id,
        kind = %spec.kind,
        shape = ?spec.shape,
        rows = batch.len(),
        "batch execution"
    );
    let row = conn
        .execute_batch(job.table, &sql, batch, timeout)?
        .ok_or_else(|| WriteError::Transport("No result out of batch operation.".into()))?;
    row.check_aligned(batch.len())
        .map_err(WriteError::Transport)?;
    Ok(row)
}

/// Errors that end the whole request even in the row-by-row strategy:
/// they are about the connection, the table or the budget, not the row.
pub(crate) fn aborts_request(err: &WriteError) -> bool {
    match err {
        WriteError::Store(store) => {
            store.is_undefined_table() || store.is_out_of_time() || store.is_transient()
        }
        WriteError::Transport(_) => true,
        _ => false,
    }
}

pub(crate) fn log_row_failure(job: &WriteJob<'_>, kind: OpKind, id: Option<&str>, detail: &str) {
    if detail.contains("does not exist") {
        warn!(stream_id = %job.ctx.stream_id, table = job.table, %kind, id, detail, "failed to write object");
    } else {
        error!(stream_id = %job.ctx.stream_id, table = job.table, %kind, id, detail, "failed to write object");
    }
}

pub(crate) fn log_stats(job: &WriteJob<'_>, kind: OpKind, transactional: bool, started: Instant) {
    info!(
        stream_id = %job.ctx.stream_id,
        table = job.table,
        %kind,
        transactional,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "db operation stats"
    );
}
