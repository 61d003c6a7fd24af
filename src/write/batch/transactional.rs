use super::{
    BatchOutcome, BatchWriteStrategy, OperationOutcome, RejectReason, WriteJob, bind_feature,
    check_update, delete_buckets, execute_batch, log_row_failure, log_stats, update_puuid,
};
use crate::error::WriteError;
use crate::model::{Feature, Geometry};
use crate::store::{
    BatchRow, BatchShape, DeleteBatch, GeometryColumn, InsertBatch, OpKind, RowBatch, UpdateBatch,
    WriteConnection,
};
use serde_json::Value;
use std::time::Instant;

/// Array batches inside one transaction: at most one statement per operation
/// kind and shape. The caller decides between commit and rollback.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionalWriter;

/// Rows of one shape collected for a single array statement.
#[derive(Default)]
struct ShapeRows {
    positions: Vec<usize>,
    ids: Vec<String>,
    puuids: Vec<Option<String>>,
    jsondata: Vec<Value>,
    geometry: Vec<Geometry>,
}

impl ShapeRows {
    fn push(
        &mut self,
        position: usize,
        id: &str,
        puuid: Option<String>,
        jsondata: Value,
        geometry: Option<Geometry>,
    ) {
        self.positions.push(position);
        self.ids.push(id.to_string());
        self.puuids.push(puuid);
        self.jsondata.push(jsondata);
        self.geometry.extend(geometry);
    }

    fn geometry_column(&mut self, shape: BatchShape) -> GeometryColumn {
        match shape {
            BatchShape::WithGeometry => GeometryColumn::Present(std::mem::take(&mut self.geometry)),
            BatchShape::WithoutGeometry => GeometryColumn::Absent,
        }
    }
}

/// Binds every feature and groups the bindable ones by shape.
fn collect_by_shape(
    job: &WriteJob<'_>,
    kind: OpKind,
    features: &[Feature],
    outcome: &mut OperationOutcome,
) -> Vec<(BatchShape, ShapeRows)> {
    let mut with_geometry = ShapeRows::default();
    let mut without_geometry = ShapeRows::default();
    for (position, feature) in features.iter().enumerate() {
        let id = if kind == OpKind::Update {
            match check_update(feature, job.handle_uuid) {
                Ok(id) => id,
                Err(reason) => {
                    outcome.reject(position, feature.id.clone(), reason);
                    continue;
                }
            }
        } else {
            feature.id().unwrap_or_default()
        };
        let (jsondata, geometry) = match bind_feature(feature, job.version) {
            Ok(bound) => bound,
            Err(err) => {
                log_row_failure(job, kind, Some(id), &err.to_string());
                outcome.reject(position, feature.id.clone(), RejectReason::Generic);
                continue;
            }
        };
        let puuid = update_puuid(feature, job.handle_uuid);
        let rows = if geometry.is_some() {
            &mut with_geometry
        } else {
            &mut without_geometry
        };
        rows.push(position, id, puuid, jsondata, geometry);
    }
    [
        (BatchShape::WithGeometry, with_geometry),
        (BatchShape::WithoutGeometry, without_geometry),
    ]
    .into_iter()
    .filter(|(_, rows)| !rows.positions.is_empty())
    .collect()
}

fn record(
    job: &WriteJob<'_>,
    outcome: &mut OperationOutcome,
    positions: Vec<usize>,
    ids: Vec<String>,
    uuid_checked: Vec<bool>,
    row: BatchRow,
) {
    for (i, ok) in row.success.iter().enumerate() {
        if !ok {
            let detail = row.err_msg.get(i).cloned().flatten().unwrap_or_default();
            log_row_failure(job, outcome.kind, ids.get(i).map(String::as_str), &detail);
        }
    }
    outcome.batches.push(BatchOutcome {
        positions,
        ids,
        uuid_checked,
        row,
    });
}

impl BatchWriteStrategy for TransactionalWriter {
    fn name(&self) -> &'static str {
        "transactional"
    }

    fn delete(
        &self,
        conn: &mut dyn WriteConnection,
        job: &WriteJob<'_>,
        deletes: &[(String, Option<String>)],
    ) -> Result<OperationOutcome, WriteError> {
        let started = Instant::now();
        let mut outcome = OperationOutcome::new(OpKind::Delete);
        let (checked, unchecked) = delete_buckets(deletes, job.handle_uuid);
        for (positions, with_uuid) in [(checked, job.handle_uuid), (unchecked, false)] {
            if positions.is_empty() {
                continue;
            }
            let ids: Vec<String> = positions.iter().map(|&p| deletes[p].0.clone()).collect();
            let puuids = with_uuid.then(|| {
                positions
                    .iter()
                    .filter_map(|&p| deletes[p].1.clone())
                    .collect::<Vec<_>>()
            });
            let batch = RowBatch::Delete(DeleteBatch {
                ids: ids.clone(),
                puuids,
                version: job.version,
            });
            let row = execute_batch(conn, job, &batch)?;
            let uuid_checked = vec![with_uuid; positions.len()];
            record(job, &mut outcome, positions, ids, uuid_checked, row);
        }
        log_stats(job, OpKind::Delete, true, started);
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
        for (shape, mut rows) in collect_by_shape(job, OpKind::Insert, inserts, &mut outcome) {
            let batch = RowBatch::Insert(InsertBatch {
                geometry: rows.geometry_column(shape),
                jsondata: rows.jsondata,
            });
            let row = execute_batch(conn, job, &batch)?;
            let uuid_checked = vec![false; rows.positions.len()];
            record(job, &mut outcome, rows.positions, rows.ids, uuid_checked, row);
        }
        log_stats(job, OpKind::Insert, true, started);
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
        for (shape, mut rows) in collect_by_shape(job, OpKind::Update, updates, &mut outcome) {
            let uuid_checked: Vec<bool> = rows.puuids.iter().map(Option::is_some).collect();
            let geometry = rows.geometry_column(shape);
            let batch = RowBatch::Update(UpdateBatch {
                ids: rows.ids.clone(),
                puuids: job.handle_uuid.then_some(rows.puuids),
                jsondata: rows.jsondata,
                geometry,
                nowait: job.ctx.nowait,
            });
            let row = execute_batch(conn, job, &batch)?;
            record(job, &mut outcome, rows.positions, rows.ids, uuid_checked, row);
        }
        log_stats(job, OpKind::Update, true, started);
        Ok(outcome)
    }
}
