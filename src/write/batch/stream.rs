use super::{
    BatchOutcome, BatchWriteStrategy, OperationOutcome, RejectReason, WriteJob, aborts_request,
    bind_feature, check_update, execute_batch, log_row_failure, log_stats, update_puuid,
};
use crate::error::WriteError;
use crate::model::{Feature, Geometry};
use crate::store::{
    DeleteBatch, GeometryColumn, InsertBatch, OpKind, RowBatch, UpdateBatch, WriteConnection,
};
use std::time::Instant;

/// Row-by-row writes in autocommit mode. A failing row is recorded and the
/// remaining rows are still attempted.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamWriter;

struct RowRef<'a> {
    position: usize,
    id: &'a str,
    uuid_checked: bool,
}

impl StreamWriter {
    fn run_row(
        &self,
        conn: &mut dyn WriteConnection,
        job: &WriteJob<'_>,
        outcome: &mut OperationOutcome,
        row_ref: RowRef<'_>,
        batch: RowBatch,
    ) -> Result<(), WriteError> {
        let RowRef {
            position,
            id,
            uuid_checked,
        } = row_ref;
        match execute_batch(conn, job, &batch) {
            Ok(row) => {
                if let Some(false) = row.success.first() {
                    let detail = row.err_msg.first().cloned().flatten().unwrap_or_default();
                    log_row_failure(job, outcome.kind, Some(id), &detail);
                }
                outcome.batches.push(BatchOutcome {
                    positions: vec![position],
                    ids: vec![id.to_string()],
                    uuid_checked: vec![uuid_checked],
                    row,
                });
                Ok(())
            }
            Err(err) if aborts_request(&err) => Err(err),
            Err(err) => {
                log_row_failure(job, outcome.kind, Some(id), &err.to_string());
                outcome.reject(position, Some(id.to_string()), RejectReason::Generic);
                Ok(())
            }
        }
    }
}

fn geometry_column(geometry: Option<Geometry>) -> GeometryColumn {
    match geometry {
        Some(geometry) => GeometryColumn::Present(vec![geometry]),
        None => GeometryColumn::Absent,
    }
}

impl BatchWriteStrategy for StreamWriter {
    fn name(&self) -> &'static str {
        "stream"
    }

    fn delete(
        &self,
        conn: &mut dyn WriteConnection,
        job: &WriteJob<'_>,
        deletes: &[(String, Option<String>)],
    ) -> Result<OperationOutcome, WriteError> {
        let started = Instant::now();
        let mut outcome = OperationOutcome::new(OpKind::Delete);
        for (position, (id, puuid)) in deletes.iter().enumerate() {
            let checked = job.handle_uuid && puuid.is_some();
            let batch = RowBatch::Delete(DeleteBatch {
                ids: vec![id.clone()],
                puuids: if checked { puuid.clone().map(|p| vec![p]) } else { None },
                version: job.version,
            });
            let row_ref = RowRef {
                position,
                id,
                uuid_checked: checked,
            };
            self.run_row(conn, job, &mut outcome, row_ref, batch)?;
        }
        log_stats(job, OpKind::Delete, false, started);
        Ok(outcome)
    }

    fn insert(
        &self,
        conn: &mut dyn WriteConnection,
        job: &WriteJob<'_>,
        inserts: &[Feature],
    ) -> Result<OperationOutcome, WriteError> {
        let started = Instant::now();
        let mut outcome = OperationOutcome::new(OpKind::Insert);
        for (position, feature) in inserts.iter().enumerate() {
            let id = feature.id().unwrap_or_default();
            let (jsondata, geometry) = match bind_feature(feature, job.version) {
                Ok(bound) => bound,
                Err(err) => {
                    log_row_failure(job, OpKind::Insert, Some(id), &err.to_string());
                    outcome.reject(position, feature.id.clone(), RejectReason::Generic);
                    continue;
                }
            };
            let batch = RowBatch::Insert(InsertBatch {
                jsondata: vec![jsondata],
                geometry: geometry_column(geometry),
            });
            let row_ref = RowRef {
                position,
                id,
                uuid_checked: false,
            };
            self.run_row(conn, job, &mut outcome, row_ref, batch)?;
        }
        log_stats(job, OpKind::Insert, false, started);
        Ok(outcome)
    }

    fn update(
        &self,
        conn: &mut dyn WriteConnection,
        job: &WriteJob<'_>,
        updates: &[Feature],
    ) -> Result<OperationOutcome, WriteError> {
        let started = Instant::now();
        let mut outcome = OperationOutcome::new(OpKind::Update);
        for (position, feature) in updates.iter().enumerate() {
            let id = match check_update(feature, job.handle_uuid) {
                Ok(id) => id,
                Err(reason) => {
                    outcome.reject(position, feature.id.clone(), reason);
                    continue;
                }
            };
            let (jsondata, geometry) = match bind_feature(feature, job.version) {
                Ok(bound) => bound,
                Err(err) => {
                    log_row_failure(job, OpKind::Update, Some(id), &err.to_string());
                    outcome.reject(position, feature.id.clone(), RejectReason::Generic);
                    continue;
                }
            };
            let puuid = update_puuid(feature, job.handle_uuid);
            let checked = puuid.is_some();
            let batch = RowBatch::Update(UpdateBatch {
                ids: vec![id.to_string()],
                puuids: job.handle_uuid.then(|| vec![puuid]),
                jsondata: vec![jsondata],
                geometry: geometry_column(geometry),
                nowait: job.ctx.nowait,
            });
            let row_ref = RowRef {
                position,
                id,
                uuid_checked: checked,
            };
            self.run_row(conn, job, &mut outcome, row_ref, batch)?;
        }
        log_stats(job, OpKind::Update, false, started);
        Ok(outcome)
    }
}
