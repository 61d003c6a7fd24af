//! Contract between the write engine and the relational store.
//!
//! The engine supplies typed, shape-uniform row batches; a
//! [`crate::statement::StatementBuilder`] supplies the SQL text they are bound
//! to; a [`WriteConnection`] executes the pair and returns exactly one
//! [`BatchRow`] whose arrays are index-aligned with the submitted rows.
//!
//! Parameter order per statement:
//!
//! | kind | parameters |
//! |------|------------|
//! | insert | `jsondata jsonb[]`, [`geometry geometry[]`] |
//! | update | `ids text[]`, `puuids text[]` (NULL without concurrency check), `jsondata jsonb[]`, [`geometry geometry[]`], `nowait bool` |
//! | delete | [`version bigint`], `ids text[]`, [`puuids text[]`] |

use crate::error::StoreError;
use crate::model::{Feature, Geometry, Space};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Insert => "insert",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Array parameters need one element type, so rows with and without a
/// geometry are never mixed in one statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchShape {
    WithGeometry,
    WithoutGeometry,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GeometryColumn {
    Absent,
    Present(Vec<Geometry>),
}

impl GeometryColumn {
    pub fn shape(&self) -> BatchShape {
        match self {
            GeometryColumn::Absent => BatchShape::WithoutGeometry,
            GeometryColumn::Present(_) => BatchShape::WithGeometry,
        }
    }

    pub fn get(&self, index: usize) -> Option<&Geometry> {
        match self {
            GeometryColumn::Absent => None,
            GeometryColumn::Present(values) => values.get(index),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertBatch {
    pub jsondata: Vec<Value>,
    pub geometry: GeometryColumn,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateBatch {
    pub ids: Vec<String>,
    /// `None` when no concurrency check was requested. A `None` element skips
    /// the check for that row only.
    pub puuids: Option<Vec<Option<String>>>,
    pub jsondata: Vec<Value>,
    pub geometry: GeometryColumn,
    pub nowait: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteBatch {
    pub ids: Vec<String>,
    pub puuids: Option<Vec<String>>,
    /// When set the rows are soft-deleted and stamped with this version.
    pub version: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RowBatch {
    Insert(InsertBatch),
    Update(UpdateBatch),
    Delete(DeleteBatch),
}

impl RowBatch {
    pub fn len(&self) -> usize {
        match self {
            RowBatch::Insert(b) => b.jsondata.len(),
            RowBatch::Update(b) => b.ids.len(),
            RowBatch::Delete(b) => b.ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn spec(&self, extending: bool) -> StatementSpec {
        match self {
            RowBatch::Insert(b) => StatementSpec {
                kind: OpKind::Insert,
                shape: b.geometry.shape(),
                with_uuid: false,
                versioned: false,
                extending,
            },
            RowBatch::Update(b) => StatementSpec {
                kind: OpKind::Update,
                shape: b.geometry.shape(),
                with_uuid: b.puuids.is_some(),
                versioned: false,
                extending,
            },
            RowBatch::Delete(b) => StatementSpec {
                kind: OpKind::Delete,
                shape: BatchShape::WithoutGeometry,
                with_uuid: b.puuids.is_some(),
                versioned: b.version.is_some(),
                extending,
            },
        }
    }
}

/// What the statement builder needs to pick a statement template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatementSpec {
    pub kind: OpKind,
    pub shape: BatchShape,
    pub with_uuid: bool,
    pub versioned: bool,
    pub extending: bool,
}

impl StatementSpec {
    pub fn param_count(&self) -> usize {
        let geometry = usize::from(self.shape == BatchShape::WithGeometry);
        match self.kind {
            OpKind::Insert => 1 + geometry,
            OpKind::Update => 4 + geometry,
            OpKind::Delete => 1 + usize::from(self.with_uuid) + usize::from(self.versioned),
        }
    }
}

/// The single result row of a batch statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchRow {
    pub success: Vec<bool>,
    /// Namespace json per row, set for successful rows.
    pub namespace: Vec<Option<String>>,
    /// Raw store message per row, set for failed rows.
    pub err_msg: Vec<Option<String>>,
}

impl BatchRow {
    pub fn push_success(&mut self, namespace: String) {
        self.success.push(true);
        self.namespace.push(Some(namespace));
        self.err_msg.push(None);
    }

    pub fn push_failure(&mut self, err_msg: impl Into<String>) {
        self.success.push(false);
        self.namespace.push(None);
        self.err_msg.push(Some(err_msg.into()));
    }

    pub fn len(&self) -> usize {
        self.success.len()
    }

    pub fn is_empty(&self) -> bool {
        self.success.is_empty()
    }

    /// Checks that all arrays line up with `expected` submitted rows.
    pub fn check_aligned(&self, expected: usize) -> Result<(), String> {
        if self.success.len() != expected {
            return Err(format!(
                "batch result holds {} success flags for {expected} rows",
                self.success.len()
            ));
        }
        if self.namespace.len() != expected || self.err_msg.len() != expected {
            return Err(format!(
                "batch result arrays are misaligned: {} namespaces, {} messages for {expected} rows",
                self.namespace.len(),
                self.err_msg.len()
            ));
        }
        Ok(())
    }
}

/// Read access, served by primary or replica connections.
pub trait ReadConnection {
    /// The subset of `ids` with a live row in `table`; soft-deleted rows do
    /// not count.
    fn existing_ids(
        &mut self,
        table: &str,
        ids: &[String],
        timeout: Duration,
    ) -> Result<HashSet<String>, StoreError>;

    /// Current head state of the given ids. Missing ids are skipped.
    fn fetch_features(
        &mut self,
        table: &str,
        ids: &[String],
        timeout: Duration,
    ) -> Result<Vec<Feature>, StoreError>;

    /// Whether `table` is visible to this connection.
    fn table_exists(&mut self, table: &str, timeout: Duration) -> Result<bool, StoreError>;
}

/// Read-write access on the primary database.
pub trait WriteConnection: ReadConnection {
    fn set_autocommit(&mut self, autocommit: bool) -> Result<(), StoreError>;

    fn commit(&mut self) -> Result<(), StoreError>;

    fn rollback(&mut self) -> Result<(), StoreError>;

    /// Executes one batch statement against `table`. `Ok(None)` means the
    /// statement produced no result row.
    fn execute_batch(
        &mut self,
        table: &str,
        sql: &str,
        batch: &RowBatch,
        timeout: Duration,
    ) -> Result<Option<BatchRow>, StoreError>;

    /// Advances the version sequence of `table` and returns the new value.
    fn next_version(&mut self, table: &str, timeout: Duration) -> Result<i64, StoreError>;

    /// Creates the space table (and its history) when missing. Returns whether
    /// anything was created.
    fn ensure_table(&mut self, space: &Space, timeout: Duration) -> Result<bool, StoreError>;
}

pub trait ConnectionProvider {
    type Primary: WriteConnection;
    type Replica: ReadConnection;

    fn primary(&self) -> Result<Self::Primary, StoreError>;

    fn replica(&self) -> Result<Self::Replica, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::{BatchRow, BatchShape, DeleteBatch, OpKind, RowBatch, StatementSpec};

    #[test]
    fn param_counts_follow_statement_shape() {
        let spec = |kind, shape, with_uuid, versioned| StatementSpec {
            kind,
            shape,
            with_uuid,
            versioned,
            extending: false,
        };
        assert_eq!(spec(OpKind::Insert, BatchShape::WithGeometry, false, false).param_count(), 2);
        assert_eq!(spec(OpKind::Insert, BatchShape::WithoutGeometry, false, false).param_count(), 1);
        assert_eq!(spec(OpKind::Update, BatchShape::WithGeometry, true, false).param_count(), 5);
        assert_eq!(spec(OpKind::Update, BatchShape::WithoutGeometry, false, false).param_count(), 4);
        assert_eq!(spec(OpKind::Delete, BatchShape::WithoutGeometry, true, true).param_count(), 3);
        assert_eq!(spec(OpKind::Delete, BatchShape::WithoutGeometry, false, false).param_count(), 1);
    }

    #[test]
    fn delete_batches_describe_versioned_statements() {
        let batch = RowBatch::Delete(DeleteBatch {
            ids: vec!["a".into()],
            puuids: None,
            version: Some(4),
        });
        let spec = batch.spec(false);
        assert!(spec.versioned);
        assert!(!spec.with_uuid);
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn misaligned_results_are_rejected() {
        let mut row = BatchRow::default();
        row.push_success("{}".into());
        row.push_failure("nope");
        assert!(row.check_aligned(2).is_ok());
        assert!(row.check_aligned(3).is_err());
        row.namespace.pop();
        assert!(row.check_aligned(2).is_err());
    }
}
