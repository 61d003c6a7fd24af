use crate::error::WriteError;
use crate::model::{FailureMessage, Feature, ModificationFailure};
use crate::store::OpKind;
use crate::write::batch::{OperationOutcome, RejectReason};
use std::collections::HashSet;

/// Ids of failed rows, split by the statement that failed them.
///
/// Inserts and updates share one set: an id is written at most once per
/// request. Deletes are kept apart since a request may delete an id and
/// insert it again.
#[derive(Debug, Default)]
pub struct FailedIds {
    deletes: HashSet<String>,
    writes: HashSet<String>,
}

impl FailedIds {
    /// Returns false when `id` already failed for this kind.
    fn record(&mut self, kind: OpKind, id: &str) -> bool {
        let set = match kind {
            OpKind::Delete => &mut self.deletes,
            OpKind::Insert | OpKind::Update => &mut self.writes,
        };
        set.insert(id.to_string())
    }

    pub fn delete_failed(&self, id: &str) -> bool {
        self.deletes.contains(id)
    }

    pub fn write_failed(&self, id: &str) -> bool {
        self.writes.contains(id)
    }
}

/// Accumulates per-row results of the executed operations.
#[derive(Debug, Default)]
pub struct Reconciliation {
    /// Successfully written inserts and updates, carrying the stored namespace.
    pub features: Vec<Feature>,
    pub failed: Vec<ModificationFailure>,
    failed_ids: FailedIds,
}

impl Reconciliation {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn failed_ids(&self) -> &FailedIds {
        &self.failed_ids
    }

    /// Folds one operation's outcome in. `features` is the list the outcome's
    /// positions refer to; it is empty for deletes. Returns the number of new
    /// failures.
    pub fn absorb(
        &mut self,
        outcome: OperationOutcome,
        features: &mut [Feature],
    ) -> Result<usize, WriteError> {
        let before = self.failed.len();
        let kind = outcome.kind;

        for rejection in outcome.rejected {
            let message = match rejection.reason {
                RejectReason::MissingId => FailureMessage::UpdateIdMissing,
                RejectReason::MissingPuuid => FailureMessage::UpdatePuuidMissing,
                RejectReason::Generic => general_failure(kind),
            };
            self.fail(kind, rejection.id, message);
        }

        for batch in outcome.batches {
            for (i, ok) in batch.row.success.iter().enumerate() {
                let id = batch.ids.get(i).cloned();
                if !ok {
                    let checked = batch.uuid_checked.get(i).copied().unwrap_or(false);
                    self.fail(kind, id, rejected_by_store(kind, checked));
                    continue;
                }
                if kind == OpKind::Delete {
                    continue;
                }
                let namespace = batch.row.namespace.get(i).cloned().flatten().ok_or_else(|| {
                    WriteError::Transport(format!(
                        "{kind} of '{}' succeeded without namespace",
                        id.as_deref().unwrap_or_default()
                    ))
                })?;
                let position = batch.positions.get(i).copied().unwrap_or(usize::MAX);
                let Some(feature) = features.get_mut(position) else {
                    return Err(WriteError::Transport(format!(
                        "{kind} result refers to unknown row {position}"
                    )));
                };
                feature.apply_namespace_json(&namespace).map_err(|e| {
                    WriteError::Transport(format!("malformed namespace in {kind} result: {e}"))
                })?;
                self.features.push(feature.clone());
            }
        }

        Ok(self.failed.len() - before)
    }

    fn fail(&mut self, kind: OpKind, id: Option<String>, message: FailureMessage) {
        if let Some(id) = &id
            && !self.failed_ids.record(kind, id)
        {
            return;
        }
        self.failed.push(ModificationFailure::new(id, message));
    }
}

fn general_failure(kind: OpKind) -> FailureMessage {
    match kind {
        OpKind::Insert => FailureMessage::InsertGeneral,
        OpKind::Update => FailureMessage::UpdateGeneral,
        OpKind::Delete => FailureMessage::DeleteGeneral,
    }
}

/// Message for a row the store reported as not written. Whether the uuid was
/// checked decides between "missing" and "missing or stale".
fn rejected_by_store(kind: OpKind, uuid_checked: bool) -> FailureMessage {
    match (kind, uuid_checked) {
        (OpKind::Insert, _) => FailureMessage::InsertGeneral,
        (OpKind::Update, true) => FailureMessage::UpdateUuid,
        (OpKind::Update, false) => FailureMessage::UpdateNotExists,
        (OpKind::Delete, true) => FailureMessage::DeleteUuid,
        (OpKind::Delete, false) => FailureMessage::DeleteNotExists,
    }
}

/// Ids grouped by how the request named them.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Dispositions {
    pub inserted: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
}

/// Sorts successful ids into the categories the caller asked for: an id the
/// caller sent as a delete or update stays one even after rewriting. An id
/// that was deleted and then inserted again by the same request is reported
/// in both categories.
pub fn partition_ids(
    inserts: &[Feature],
    updates: &[Feature],
    original_updates: &[String],
    original_deletes: &[String],
    failed: &FailedIds,
) -> Dispositions {
    // Deletes rewritten into tombstone writes.
    let tombstones: HashSet<&str> = inserts
        .iter()
        .chain(updates)
        .filter(|f| f.is_tombstone())
        .filter_map(Feature::id)
        .collect();
    let requested_updates: HashSet<&str> = original_updates.iter().map(String::as_str).collect();
    let mut out = Dispositions::default();

    let mut deleted = HashSet::new();
    for id in original_deletes {
        let failed_here = if tombstones.contains(id.as_str()) {
            failed.write_failed(id)
        } else {
            failed.delete_failed(id)
        };
        if !failed_here && deleted.insert(id.as_str()) {
            out.deleted.push(id.clone());
        }
    }

    let mut updated = HashSet::new();
    let update_ids = original_updates
        .iter()
        .map(String::as_str)
        .chain(updates.iter().filter_map(Feature::id));
    for id in update_ids {
        if !tombstones.contains(id) && !failed.write_failed(id) && updated.insert(id) {
            out.updated.push(id.to_string());
        }
    }

    let mut inserted = HashSet::new();
    for id in inserts.iter().filter_map(Feature::id) {
        if tombstones.contains(id) || requested_updates.contains(id) || failed.write_failed(id) {
            continue;
        }
        if inserted.insert(id) {
            out.inserted.push(id.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{FailedIds, Reconciliation, partition_ids};
    use crate::model::{FailureMessage, Feature};
    use crate::store::{BatchRow, OpKind};
    use crate::write::batch::{BatchOutcome, OperationOutcome, RejectReason};

    fn strings(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn failures_pick_message_by_kind_and_check() {
        let mut row = BatchRow::default();
        row.push_failure("uuid mismatch");
        row.push_failure("not found");
        let mut outcome = OperationOutcome::new(OpKind::Delete);
        outcome.batches.push(BatchOutcome {
            positions: vec![0, 1],
            ids: strings(&["a", "b"]),
            uuid_checked: vec![true, false],
            row,
        });
        outcome.reject(2, Some("c".into()), RejectReason::Generic);

        let mut rec = Reconciliation::default();
        assert_eq!(rec.absorb(outcome, &mut []).expect("absorb"), 3);
        let messages: Vec<_> = rec.failed.iter().map(|f| f.message).collect();
        assert_eq!(
            messages,
            vec![
                FailureMessage::DeleteGeneral,
                FailureMessage::DeleteUuid,
                FailureMessage::DeleteNotExists
            ]
        );
    }

    #[test]
    fn successes_receive_stored_namespace() {
        let mut features = vec![Feature::new("a")];
        let mut row = BatchRow::default();
        row.push_success(r#"{"uuid":"u1","version":2,"createdAt":1,"updatedAt":1}"#.into());
        let mut outcome = OperationOutcome::new(OpKind::Insert);
        outcome.batches.push(BatchOutcome {
            positions: vec![0],
            ids: strings(&["a"]),
            uuid_checked: vec![false],
            row,
        });

        let mut rec = Reconciliation::default();
        assert_eq!(rec.absorb(outcome, &mut features).expect("absorb"), 0);
        assert_eq!(rec.features.len(), 1);
        assert_eq!(rec.features[0].namespace().uuid.as_deref(), Some("u1"));
        assert_eq!(features[0].namespace().version, Some(2));
    }

    #[test]
    fn success_without_namespace_is_a_transport_error() {
        let mut row = BatchRow::default();
        row.success.push(true);
        row.namespace.push(None);
        row.err_msg.push(None);
        let mut outcome = OperationOutcome::new(OpKind::Update);
        outcome.batches.push(BatchOutcome {
            positions: vec![0],
            ids: strings(&["a"]),
            uuid_checked: vec![false],
            row,
        });
        let mut rec = Reconciliation::default();
        assert!(rec.absorb(outcome, &mut [Feature::new("a")]).is_err());
    }

    fn failed(kind: OpKind, ids: &[&str]) -> FailedIds {
        let mut failed = FailedIds::default();
        for id in ids {
            failed.record(kind, id);
        }
        failed
    }

    #[test]
    fn ids_keep_the_category_the_caller_used() {
        let inserts = vec![Feature::new("n"), Feature::new("u2"), Feature::new("bad")];
        let updates = vec![Feature::new("x")];

        let out = partition_ids(
            &inserts,
            &updates,
            &strings(&["u2"]),
            &strings(&["d"]),
            &failed(OpKind::Insert, &["bad"]),
        );
        assert_eq!(out.deleted, strings(&["d"]));
        assert_eq!(out.updated, strings(&["u2", "x"]));
        assert_eq!(out.inserted, strings(&["n"]));
    }

    #[test]
    fn delete_then_insert_of_one_id_reports_both() {
        let inserts = vec![Feature::new("a")];
        let out = partition_ids(&inserts, &[], &[], &strings(&["a"]), &FailedIds::default());
        assert_eq!(out.deleted, strings(&["a"]));
        assert_eq!(out.inserted, strings(&["a"]));
    }

    #[test]
    fn failures_only_remove_their_own_kind() {
        let inserts = vec![Feature::new("a"), Feature::new("b")];
        let deletes = strings(&["a", "b"]);

        let out = partition_ids(&inserts, &[], &[], &deletes, &failed(OpKind::Insert, &["a"]));
        assert_eq!(out.deleted, strings(&["a", "b"]));
        assert_eq!(out.inserted, strings(&["b"]));

        let out = partition_ids(&inserts, &[], &[], &deletes, &failed(OpKind::Delete, &["b"]));
        assert_eq!(out.deleted, strings(&["a"]));
        assert_eq!(out.inserted, strings(&["a", "b"]));
    }

    #[test]
    fn tombstoned_deletes_stay_deletes() {
        let updates = vec![Feature::tombstone("t", None)];
        let out = partition_ids(&[], &updates, &[], &strings(&["t"]), &FailedIds::default());
        assert_eq!(out.deleted, strings(&["t"]));
        assert!(out.updated.is_empty());

        let inserts = vec![Feature::tombstone("t", None)];
        let out = partition_ids(&inserts, &[], &[], &strings(&["t"]), &failed(OpKind::Insert, &["t"]));
        assert!(out.deleted.is_empty());
        assert!(out.inserted.is_empty());
    }
}
