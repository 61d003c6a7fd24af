use crate::error::{StoreError, WriteError, sqlstate};
use crate::model::{FailureMessage, Feature, ModificationRequest, ModificationResult};
use crate::statement::StatementBuilder;
use crate::store::{ConnectionProvider, ReadConnection, WriteConnection};
use crate::write::batch::{WriteJob, strategy_for};
use crate::write::classify::classify_upserts;
use crate::write::context::RequestContext;
use crate::write::extended::resolve_extending_space;
use crate::write::reconcile::{Reconciliation, partition_ids};
use crate::write::version::allocate_version;
use std::collections::HashSet;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// Connection loss or cancellation by an infrastructure event.
    Transient,
    MissingTable,
    Unexpected,
}

impl RetryReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RetryReason::Transient => "transient",
            RetryReason::MissingTable => "missing_table",
            RetryReason::Unexpected => "unexpected",
        }
    }
}

/// Why one attempt failed, and whether another attempt may help.
#[derive(Debug)]
pub enum AttemptError {
    Retryable {
        error: WriteError,
        reason: RetryReason,
    },
    Fatal(WriteError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Reads, validation and version allocation: nothing written yet.
    Prepare,
    Write { transactional: bool },
}

fn classify_attempt(err: WriteError, phase: Phase) -> AttemptError {
    let retryable = |error, reason| AttemptError::Retryable { error, reason };
    let store = match err {
        WriteError::Store(ref store) => store.clone(),
        WriteError::Transport(_) => return AttemptError::Fatal(err.surface()),
        other => return AttemptError::Fatal(other),
    };
    if store.is_out_of_time() {
        return AttemptError::Fatal(WriteError::Timeout(
            "No time for retry left for database query.".into(),
        ));
    }
    if store.is_transient() {
        return retryable(err, RetryReason::Transient);
    }
    if store.is_undefined_table() {
        return retryable(err, RetryReason::MissingTable);
    }
    match phase {
        Phase::Write {
            transactional: true,
        } => AttemptError::Fatal(transaction_failure(&store)),
        _ => retryable(err, RetryReason::Unexpected),
    }
}

/// A store error inside an all-or-nothing write: constraint conflicts are the
/// caller's to resolve, everything else is a gateway failure.
fn transaction_failure(store: &StoreError) -> WriteError {
    if store.has_state(sqlstate::UNIQUE_VIOLATION) {
        return WriteError::Conflict {
            message: FailureMessage::TransactionGeneral.as_str().into(),
            failed: Vec::new(),
        };
    }
    WriteError::BadGateway {
        message: FailureMessage::TransactionGeneral.as_str().into(),
        details: Some(match store.sqlstate() {
            Some(state) => format!("SQL-state: {state}"),
            None => "Unexpected Error occurred".into(),
        }),
    }
}

/// Runs one attempt of a modification request.
pub struct Dispatcher<'a, P: ConnectionProvider> {
    provider: &'a P,
    builder: &'a dyn StatementBuilder,
}

impl<'a, P: ConnectionProvider> Dispatcher<'a, P> {
    pub fn new(provider: &'a P, builder: &'a dyn StatementBuilder) -> Self {
        Self { provider, builder }
    }

    pub fn provider(&self) -> &'a P {
        self.provider
    }

    pub fn run(
        &self,
        mut request: ModificationRequest,
        ctx: &RequestContext,
    ) -> Result<ModificationResult, AttemptError> {
        let flags = request.flags;
        check_payload(&request, ctx).map_err(AttemptError::Fatal)?;

        let original_updates: Vec<String> =
            request.updates.iter().filter_map(|f| f.id.clone()).collect();
        let original_deletes: Vec<String> = request.deletes.keys().cloned().collect();

        let old_features = self
            .prepare(&mut request, ctx)
            .map_err(|e| classify_attempt(e, Phase::Prepare))?;

        let mut primary = self
            .provider
            .primary()
            .map_err(|e| classify_attempt(e.into(), Phase::Prepare))?;
        if flags.enable_global_versioning {
            let version = allocate_version(&mut primary, &request.space.table, ctx)
                .map_err(|e| classify_attempt(e, Phase::Prepare))?;
            request.version = Some(version);
        }

        let phase = Phase::Write {
            transactional: flags.transactional,
        };
        let rec = match self.write(&mut primary, &mut request, ctx) {
            Ok(rec) => rec,
            Err(err) => {
                if flags.transactional {
                    rollback_quietly(&mut primary, ctx);
                }
                return Err(classify_attempt(err, phase));
            }
        };

        if flags.transactional {
            if rec.has_failures() {
                rollback_quietly(&mut primary, ctx);
                return Err(AttemptError::Fatal(WriteError::Conflict {
                    message: FailureMessage::TransactionGeneral.as_str().into(),
                    failed: rec.failed,
                }));
            }
            primary
                .commit()
                .map_err(|e| classify_attempt(e.into(), phase))?;
        }

        let ids = partition_ids(
            &request.inserts,
            &request.updates,
            &original_updates,
            &original_deletes,
            rec.failed_ids(),
        );
        Ok(ModificationResult {
            features: rec.features,
            inserted: ids.inserted,
            updated: ids.updated,
            deleted: ids.deleted,
            failed: rec.failed,
            version: request.version,
            old_features,
        })
    }

    /// Every read-side step: extension rewrite, old states, upsert
    /// classification and id validation.
    fn prepare(
        &self,
        request: &mut ModificationRequest,
        ctx: &RequestContext,
    ) -> Result<Option<Vec<Feature>>, WriteError> {
        let flags = request.flags;
        let mut replica: Option<P::Replica> = None;

        if flags.for_extending_space {
            let conn = self.replica(&mut replica)?;
            resolve_extending_space(conn, request, ctx)?;
        }

        let old_features = if flags.include_old_states {
            let ids = request.referenced_ids();
            let conn = self.replica(&mut replica)?;
            let old = if ids.is_empty() {
                Vec::new()
            } else {
                conn.fetch_features(&request.space.table, &ids, ctx.statement_timeout()?)?
            };
            debug!(stream_id = %ctx.stream_id, found = old.len(), "loaded old states");
            Some(old)
        } else {
            None
        };

        if !request.upserts.is_empty() {
            let upserts = std::mem::take(&mut request.upserts);
            let conn = self.replica(&mut replica)?;
            let (inserts, updates) = classify_upserts(conn, &request.space.table, upserts, ctx)?;
            request.inserts.extend(inserts);
            request.updates.extend(updates);
        }

        assign_missing_ids(request);
        check_unique_ids(request)?;
        Ok(old_features)
    }

    fn replica<'s>(
        &self,
        slot: &'s mut Option<P::Replica>,
    ) -> Result<&'s mut P::Replica, WriteError> {
        if slot.is_none() {
            *slot = Some(self.provider.replica()?);
        }
        slot.as_mut()
            .ok_or_else(|| WriteError::Transport("replica connection unavailable".into()))
    }

    /// Deletes, then inserts, then updates. An all-or-nothing request stops at
    /// the first kind that reported a failed row.
    fn write(
        &self,
        primary: &mut P::Primary,
        request: &mut ModificationRequest,
        ctx: &RequestContext,
    ) -> Result<Reconciliation, WriteError> {
        let flags = request.flags;
        primary.set_autocommit(!flags.transactional)?;

        let strategy = strategy_for(flags.transactional);
        let job = WriteJob {
            table: &request.space.table,
            handle_uuid: flags.handle_uuid,
            version: request.version,
            extending: request.space.base.is_some(),
            builder: self.builder,
            ctx,
        };
        debug!(
            stream_id = %ctx.stream_id,
            strategy = strategy.name(),
            inserts = request.inserts.len(),
            updates = request.updates.len(),
            deletes = request.deletes.len(),
            version = ?request.version,
            retry = ctx.retry_attempted(),
            "writing features"
        );

        let mut rec = Reconciliation::default();
        let stop_early = |rec: &Reconciliation| flags.transactional && rec.has_failures();

        if !request.deletes.is_empty() {
            let deletes: Vec<(String, Option<String>)> = request
                .deletes
                .iter()
                .map(|(id, puuid)| (id.clone(), puuid.clone()))
                .collect();
            let outcome = strategy.delete(primary, &job, &deletes)?;
            rec.absorb(outcome, &mut [])?;
        }
        if !request.inserts.is_empty() && !stop_early(&rec) {
            let outcome = strategy.insert(primary, &job, &request.inserts)?;
            rec.absorb(outcome, &mut request.inserts)?;
        }
        if !request.updates.is_empty() && !stop_early(&rec) {
            let outcome = strategy.update(primary, &job, &request.updates)?;
            rec.absorb(outcome, &mut request.updates)?;
        }
        Ok(rec)
    }
}

fn check_payload(request: &ModificationRequest, ctx: &RequestContext) -> Result<(), WriteError> {
    let largest = [
        request.inserts.len(),
        request.updates.len(),
        request.upserts.len(),
        request.deletes.len(),
    ]
    .into_iter()
    .max()
    .unwrap_or(0);
    if largest > ctx.max_batch_rows {
        return Err(WriteError::PayloadTooLarge(format!(
            "{largest} rows in one operation exceed the limit of {}",
            ctx.max_batch_rows
        )));
    }
    Ok(())
}

/// New features without an id get a random one; updates never do.
fn assign_missing_ids(request: &mut ModificationRequest) {
    for feature in request.inserts.iter_mut().filter(|f| f.id.is_none()) {
        feature.id = Some(Uuid::new_v4().to_string());
    }
}

/// A row id may be written at most once per request, deletes aside.
fn check_unique_ids(request: &ModificationRequest) -> Result<(), WriteError> {
    let mut seen = HashSet::new();
    for id in request
        .inserts
        .iter()
        .chain(&request.updates)
        .filter_map(Feature::id)
    {
        if !seen.insert(id) {
            return Err(WriteError::IllegalArgument(format!(
                "feature '{id}' is written more than once in one request"
            )));
        }
    }
    Ok(())
}

fn rollback_quietly<C: WriteConnection + ?Sized>(conn: &mut C, ctx: &RequestContext) {
    if let Err(err) = conn.rollback() {
        warn!(stream_id = %ctx.stream_id, error = %err, "rollback failed");
    }
}
