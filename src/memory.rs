//! In-memory reference store.
//!
//! Implements the connection contract of [`crate::store`] over plain maps so
//! the write engine can run without a database: per-row results, optimistic
//! uuid checks, soft deletes with history, transactions with rollback, row
//! locks, per-table version sequences and injectable faults.

use crate::error::{StoreError, sqlstate};
use crate::model::{Feature, Geometry, NAMESPACE_KEY, Namespace, Space};
use crate::statement::count_placeholders;
use crate::store::{
    BatchRow, ConnectionProvider, DeleteBatch, InsertBatch, ReadConnection, RowBatch,
    UpdateBatch, WriteConnection,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    /// Opening a primary connection.
    Connect,
    ExistingIds,
    FetchFeatures,
    ExecuteBatch,
    NextVersion,
    Commit,
    EnsureTable,
}

#[derive(Debug, Clone)]
pub enum FaultAction {
    Fail(StoreError),
    /// The call blocks for the given time, then fails.
    Stall(Duration, StoreError),
    /// The statement runs but yields no result row.
    NoResultRow,
    /// The statement runs but every result array loses its last element.
    TruncatedResult,
}

#[derive(Debug, Clone)]
struct Fault {
    point: FaultPoint,
    action: FaultAction,
    skip: usize,
    remaining: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub jsondata: Value,
    pub geometry: Option<Geometry>,
    pub namespace: Namespace,
}

impl StoredRow {
    pub fn is_deleted(&self) -> bool {
        self.namespace.deleted
    }

    pub fn to_feature(&self, id: &str) -> Option<Feature> {
        Feature::from_columns(id, &self.jsondata, self.geometry.clone()).ok()
    }
}

/// A row state recorded because it carried a version.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRow {
    pub id: String,
    pub uuid: Option<String>,
    pub version: i64,
    pub deleted: bool,
    pub jsondata: Value,
    pub geometry: Option<Geometry>,
}

#[derive(Debug, Clone, Default)]
struct Table {
    base: Option<String>,
    rows: BTreeMap<String, StoredRow>,
    history: Vec<HistoryRow>,
}

impl Table {
    fn put(&mut self, id: &str, row: StoredRow) {
        if let Some(version) = row.namespace.version {
            self.history.push(HistoryRow {
                id: id.to_string(),
                uuid: row.namespace.uuid.clone(),
                version,
                deleted: row.namespace.deleted,
                jsondata: row.jsondata.clone(),
                geometry: row.geometry.clone(),
            });
        }
        self.rows.insert(id.to_string(), row);
    }
}

type Tables = BTreeMap<String, Table>;

#[derive(Debug, Default)]
struct StoreState {
    tables: Tables,
    sequences: HashMap<String, i64>,
    faults: Vec<Fault>,
    locked: HashSet<(String, String)>,
    statements: Vec<String>,
    primary_connections: usize,
}

impl StoreState {
    fn take_fault(&mut self, point: FaultPoint) -> Option<FaultAction> {
        let idx = self.faults.iter().position(|f| f.point == point)?;
        let fault = self.faults.get_mut(idx)?;
        if fault.skip > 0 {
            fault.skip -= 1;
            return None;
        }
        let action = fault.action.clone();
        fault.remaining = fault.remaining.saturating_sub(1);
        if fault.remaining == 0 {
            self.faults.remove(idx);
        }
        Some(action)
    }

    fn fail_if_injected(&mut self, point: FaultPoint) -> Result<(), StoreError> {
        match self.take_fault(point) {
            Some(FaultAction::Fail(err)) => Err(err),
            Some(FaultAction::Stall(delay, err)) => {
                std::thread::sleep(delay);
                Err(err)
            }
            _ => Ok(()),
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

fn undefined_table(table: &str) -> StoreError {
    StoreError::new(
        sqlstate::UNDEFINED_TABLE,
        format!("relation \"{table}\" does not exist"),
    )
}

fn protocol_violation(message: impl Into<String>) -> StoreError {
    StoreError::new(sqlstate::PROTOCOL_VIOLATION, message)
}

/// Stamps a new row state: fresh uuid, the prior uuid as puuid, timestamps.
/// `delete_version` turns the state into a versioned tombstone.
fn stamp_row(
    id: &str,
    mut jsondata: Value,
    geometry: Option<Geometry>,
    prior: Option<&StoredRow>,
    delete_version: Option<i64>,
    now: i64,
) -> Result<StoredRow, StoreError> {
    let body = jsondata
        .as_object_mut()
        .ok_or_else(|| protocol_violation("jsondata must be an object"))?;
    body.insert("id".into(), Value::String(id.to_string()));
    let properties = body
        .entry("properties")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| protocol_violation("properties must be an object"))?;

    let mut namespace: Namespace = match properties.get(NAMESPACE_KEY) {
        Some(raw) => serde_json::from_value(raw.clone())
            .map_err(|e| protocol_violation(format!("malformed namespace: {e}")))?,
        None => Namespace::default(),
    };
    namespace.uuid = Some(Uuid::new_v4().to_string());
    namespace.puuid = prior.and_then(|row| row.namespace.uuid.clone());
    namespace.created_at = prior.map_or(now, |row| row.namespace.created_at);
    namespace.updated_at = now;
    if let Some(version) = delete_version {
        namespace.version = Some(version);
        namespace.deleted = true;
    }
    let raw = serde_json::to_value(&namespace)
        .map_err(|e| protocol_violation(format!("namespace not serializable: {e}")))?;
    properties.insert(NAMESPACE_KEY.into(), raw);

    Ok(StoredRow {
        jsondata,
        geometry,
        namespace,
    })
}

fn namespace_json(row: &StoredRow) -> Result<String, StoreError> {
    serde_json::to_string(&row.namespace)
        .map_err(|e| protocol_violation(format!("namespace not serializable: {e}")))
}

fn lock_key(table: &str, id: &str) -> (String, String) {
    (table.to_string(), id.to_string())
}

fn canceled() -> StoreError {
    StoreError::new(
        sqlstate::QUERY_CANCELED,
        "canceling statement due to statement timeout",
    )
}

fn apply_insert(target: &mut Table, batch: &InsertBatch, now: i64) -> Result<BatchRow, StoreError> {
    let mut row = BatchRow::default();
    for (i, jsondata) in batch.jsondata.iter().enumerate() {
        let Some(id) = jsondata.get("id").and_then(Value::as_str) else {
            row.push_failure("null value in column \"id\" violates not-null constraint");
            continue;
        };
        // A soft-deleted row gives way to the new one, as the history trigger does.
        if target.rows.get(id).is_some_and(|r| !r.is_deleted()) {
            row.push_failure(format!("duplicate key value violates unique constraint: {id}"));
            continue;
        }
        let geometry = batch.geometry.get(i).cloned();
        let stored = stamp_row(id, jsondata.clone(), geometry, None, None, now)?;
        row.push_success(namespace_json(&stored)?);
        target.put(id, stored);
    }
    Ok(row)
}

fn apply_update(
    table: &str,
    target: &mut Table,
    locked: &HashSet<(String, String)>,
    batch: &UpdateBatch,
    now: i64,
) -> Result<BatchRow, StoreError> {
    let mut row = BatchRow::default();
    for (i, id) in batch.ids.iter().enumerate() {
        let jsondata = batch
            .jsondata
            .get(i)
            .ok_or_else(|| protocol_violation("update arrays differ in length"))?;
        if locked.contains(&lock_key(table, id)) {
            if batch.nowait {
                row.push_failure(format!("could not obtain lock on row \"{id}\""));
                continue;
            }
            return Err(canceled());
        }
        let Some(prior) = target.rows.get(id).filter(|r| !r.is_deleted()) else {
            row.push_failure(format!("object \"{id}\" does not exist"));
            continue;
        };
        let expected = batch
            .puuids
            .as_ref()
            .and_then(|puuids| puuids.get(i))
            .and_then(Option::as_deref);
        if let Some(expected) = expected
            && prior.namespace.uuid.as_deref() != Some(expected)
        {
            row.push_failure(format!("uuid mismatch for \"{id}\""));
            continue;
        }
        let geometry = batch.geometry.get(i).cloned();
        let stored = stamp_row(id, jsondata.clone(), geometry, Some(prior), None, now)?;
        row.push_success(namespace_json(&stored)?);
        target.put(id, stored);
    }
    Ok(row)
}

fn apply_delete(
    table: &str,
    target: &mut Table,
    locked: &HashSet<(String, String)>,
    batch: &DeleteBatch,
    now: i64,
) -> Result<BatchRow, StoreError> {
    let mut row = BatchRow::default();
    for (i, id) in batch.ids.iter().enumerate() {
        if locked.contains(&lock_key(table, id)) {
            return Err(canceled());
        }
        let Some(prior) = target.rows.get(id).filter(|r| !r.is_deleted()) else {
            row.push_failure(format!("object \"{id}\" does not exist"));
            continue;
        };
        let expected = batch.puuids.as_ref().and_then(|puuids| puuids.get(i));
        if let Some(expected) = expected
            && prior.namespace.uuid.as_ref() != Some(expected)
        {
            row.push_failure(format!("uuid mismatch for \"{id}\""));
            continue;
        }
        match batch.version {
            Some(version) => {
                let stored = stamp_row(
                    id,
                    prior.jsondata.clone(),
                    prior.geometry.clone(),
                    Some(prior),
                    Some(version),
                    now,
                )?;
                row.push_success(namespace_json(&stored)?);
                target.put(id, stored);
            }
            None => {
                let namespace = namespace_json(prior)?;
                target.rows.remove(id);
                row.push_success(namespace);
            }
        }
    }
    Ok(row)
}

/// Head state of `id` as seen through `table`, falling back to its base.
fn merged_read(tables: &Tables, table: &str, id: &str) -> Option<Feature> {
    let current = tables.get(table)?;
    match current.rows.get(id) {
        Some(row) if row.is_deleted() => None,
        Some(row) => row.to_feature(id),
        None => current
            .base
            .as_deref()
            .and_then(|base| merged_read(tables, base, id)),
    }
}

/// Shared in-memory database handing out primary and replica connections.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_table(&self, table: &str) {
        self.state
            .lock()
            .tables
            .entry(table.to_string())
            .or_default();
    }

    pub fn create_extending_table(&self, table: &str, base: &str) {
        let mut state = self.state.lock();
        state.tables.entry(base.to_string()).or_default();
        state.tables.entry(table.to_string()).or_default().base = Some(base.to_string());
    }

    pub fn drop_table(&self, table: &str) {
        self.state.lock().tables.remove(table);
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.state.lock().tables.contains_key(table)
    }

    /// Writes `feature` directly, outside any request. Returns the stored
    /// namespace.
    pub fn seed(&self, table: &str, feature: &Feature) -> Result<Namespace, StoreError> {
        let id = feature
            .id()
            .ok_or_else(|| protocol_violation("seeded features need an id"))?;
        let jsondata = feature
            .to_jsondata(feature.namespace().version)
            .map_err(|e| protocol_violation(e.to_string()))?;
        let mut state = self.state.lock();
        let target = state
            .tables
            .get_mut(table)
            .ok_or_else(|| undefined_table(table))?;
        let prior = target.rows.get(id).cloned();
        let stored = stamp_row(
            id,
            jsondata,
            feature.geometry.clone(),
            prior.as_ref(),
            None,
            now_millis(),
        )?;
        let namespace = stored.namespace.clone();
        target.put(id, stored);
        Ok(namespace)
    }

    /// The physical row, tombstones included.
    pub fn row(&self, table: &str, id: &str) -> Option<StoredRow> {
        self.state.lock().tables.get(table)?.rows.get(id).cloned()
    }

    /// The live feature stored in `table` itself.
    pub fn feature(&self, table: &str, id: &str) -> Option<Feature> {
        self.row(table, id)
            .filter(|row| !row.is_deleted())
            .and_then(|row| row.to_feature(id))
    }

    pub fn read_merged(&self, table: &str, id: &str) -> Option<Feature> {
        merged_read(&self.state.lock().tables, table, id)
    }

    pub fn ids(&self, table: &str) -> Vec<String> {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|t| t.rows.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn history(&self, table: &str) -> Vec<HistoryRow> {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|t| t.history.clone())
            .unwrap_or_default()
    }

    /// Physically drops soft-deleted rows, the job of the store's own
    /// maintenance outside the write path. Returns the number removed.
    pub fn purge_soft_deleted(&self, table: &str) -> usize {
        let mut state = self.state.lock();
        let Some(target) = state.tables.get_mut(table) else {
            return 0;
        };
        let before = target.rows.len();
        target.rows.retain(|_, row| !row.is_deleted());
        before - target.rows.len()
    }

    pub fn current_version(&self, table: &str) -> i64 {
        self.state
            .lock()
            .sequences
            .get(table)
            .copied()
            .unwrap_or_default()
    }

    /// Resets the version sequence of `table` so that the next allocation
    /// returns `last + 1`.
    pub fn set_sequence(&self, table: &str, last: i64) {
        self.state.lock().sequences.insert(table.to_string(), last);
    }

    /// Simulates another writer holding `id`.
    pub fn lock_row(&self, table: &str, id: &str) {
        self.state.lock().locked.insert(lock_key(table, id));
    }

    pub fn unlock_row(&self, table: &str, id: &str) {
        self.state.lock().locked.remove(&lock_key(table, id));
    }

    pub fn inject(&self, point: FaultPoint, action: FaultAction) {
        self.inject_times(point, action, 0, 1);
    }

    /// Lets `skip` calls at `point` pass, then applies `action` `times` times.
    pub fn inject_times(&self, point: FaultPoint, action: FaultAction, skip: usize, times: usize) {
        if times == 0 {
            return;
        }
        self.state.lock().faults.push(Fault {
            point,
            action,
            skip,
            remaining: times,
        });
    }

    /// SQL of every statement executed so far.
    pub fn statements(&self) -> Vec<String> {
        self.state.lock().statements.clone()
    }

    pub fn clear_statements(&self) {
        self.state.lock().statements.clear();
    }

    pub fn primary_connections(&self) -> usize {
        self.state.lock().primary_connections
    }
}

impl ConnectionProvider for MemoryStore {
    type Primary = MemoryConnection;
    type Replica = MemoryConnection;

    fn primary(&self) -> Result<MemoryConnection, StoreError> {
        let mut state = self.state.lock();
        state.fail_if_injected(FaultPoint::Connect)?;
        state.primary_connections += 1;
        Ok(MemoryConnection::new(self.state.clone(), false))
    }

    fn replica(&self) -> Result<MemoryConnection, StoreError> {
        Ok(MemoryConnection::new(self.state.clone(), true))
    }
}

/// One connection. Outside autocommit it works on a private copy of the
/// tables that commit publishes and rollback discards.
#[derive(Debug)]
pub struct MemoryConnection {
    state: Arc<Mutex<StoreState>>,
    read_only: bool,
    tx: Option<Tables>,
    touched: BTreeSet<String>,
}

impl MemoryConnection {
    fn new(state: Arc<Mutex<StoreState>>, read_only: bool) -> Self {
        Self {
            state,
            read_only,
            tx: None,
            touched: BTreeSet::new(),
        }
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::new(
                sqlstate::READ_ONLY_TRANSACTION,
                "cannot execute write in a read-only transaction",
            ));
        }
        Ok(())
    }

    fn publish(&mut self) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.fail_if_injected(FaultPoint::Commit)?;
        if let Some(tx) = self.tx.as_mut() {
            for name in std::mem::take(&mut self.touched) {
                match tx.get(&name) {
                    Some(table) => {
                        state.tables.insert(name, table.clone());
                    }
                    None => {
                        state.tables.remove(&name);
                    }
                }
            }
            *tx = state.tables.clone();
        }
        Ok(())
    }
}

impl ReadConnection for MemoryConnection {
    fn existing_ids(
        &mut self,
        table: &str,
        ids: &[String],
        _timeout: Duration,
    ) -> Result<HashSet<String>, StoreError> {
        let mut state = self.state.lock();
        state.fail_if_injected(FaultPoint::ExistingIds)?;
        let tables = self.tx.as_ref().unwrap_or(&state.tables);
        let target = tables.get(table).ok_or_else(|| undefined_table(table))?;
        Ok(ids
            .iter()
            .filter(|id| target.rows.get(*id).is_some_and(|r| !r.is_deleted()))
            .cloned()
            .collect())
    }

    fn fetch_features(
        &mut self,
        table: &str,
        ids: &[String],
        _timeout: Duration,
    ) -> Result<Vec<Feature>, StoreError> {
        let mut state = self.state.lock();
        state.fail_if_injected(FaultPoint::FetchFeatures)?;
        let tables = self.tx.as_ref().unwrap_or(&state.tables);
        if !tables.contains_key(table) {
            return Err(undefined_table(table));
        }
        Ok(ids
            .iter()
            .filter_map(|id| merged_read(tables, table, id))
            .collect())
    }

    fn table_exists(&mut self, table: &str, _timeout: Duration) -> Result<bool, StoreError> {
        let state = self.state.lock();
        let tables = self.tx.as_ref().unwrap_or(&state.tables);
        Ok(tables.contains_key(table))
    }
}

impl WriteConnection for MemoryConnection {
    fn set_autocommit(&mut self, autocommit: bool) -> Result<(), StoreError> {
        match (autocommit, self.tx.is_some()) {
            (false, false) => {
                self.tx = Some(self.state.lock().tables.clone());
                self.touched.clear();
                Ok(())
            }
            (true, true) => {
                self.publish()?;
                self.tx = None;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.publish()
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        if let Some(tx) = self.tx.as_mut() {
            *tx = self.state.lock().tables.clone();
            self.touched.clear();
        }
        Ok(())
    }

    fn execute_batch(
        &mut self,
        table: &str,
        sql: &str,
        batch: &RowBatch,
        timeout: Duration,
    ) -> Result<Option<BatchRow>, StoreError> {
        self.check_writable()?;
        if timeout.is_zero() {
            return Err(canceled());
        }
        let expected = batch.spec(false).param_count();
        let bound = count_placeholders(sql);
        if bound != expected {
            return Err(protocol_violation(format!(
                "statement expects {bound} parameters but {expected} were bound"
            )));
        }

        let mut state = self.state.lock();
        let fault = state.take_fault(FaultPoint::ExecuteBatch);
        match &fault {
            Some(FaultAction::Fail(err)) => return Err(err.clone()),
            Some(FaultAction::Stall(delay, err)) => {
                std::thread::sleep(*delay);
                return Err(err.clone());
            }
            _ => {}
        }
        state.statements.push(sql.to_string());

        let now = now_millis();
        let StoreState { tables, locked, .. } = &mut *state;
        let tables = self.tx.as_mut().unwrap_or(tables);
        let target = tables.get_mut(table).ok_or_else(|| undefined_table(table))?;
        let mut row = match batch {
            RowBatch::Insert(b) => apply_insert(target, b, now)?,
            RowBatch::Update(b) => apply_update(table, target, locked, b, now)?,
            RowBatch::Delete(b) => apply_delete(table, target, locked, b, now)?,
        };
        if self.tx.is_some() {
            self.touched.insert(table.to_string());
        }

        match fault {
            Some(FaultAction::NoResultRow) => Ok(None),
            Some(FaultAction::TruncatedResult) => {
                row.success.pop();
                row.namespace.pop();
                row.err_msg.pop();
                Ok(Some(row))
            }
            _ => Ok(Some(row)),
        }
    }

    fn next_version(&mut self, table: &str, _timeout: Duration) -> Result<i64, StoreError> {
        self.check_writable()?;
        let mut state = self.state.lock();
        state.fail_if_injected(FaultPoint::NextVersion)?;
        let exists = self
            .tx
            .as_ref()
            .unwrap_or(&state.tables)
            .contains_key(table);
        if !exists {
            return Err(undefined_table(table));
        }
        let sequence = state.sequences.entry(table.to_string()).or_default();
        *sequence += 1;
        Ok(*sequence)
    }

    fn ensure_table(&mut self, space: &Space, _timeout: Duration) -> Result<bool, StoreError> {
        self.check_writable()?;
        let mut state = self.state.lock();
        state.fail_if_injected(FaultPoint::EnsureTable)?;
        if state.tables.contains_key(&space.table) {
            return Ok(false);
        }
        let table = Table {
            base: space.base.clone(),
            ..Table::default()
        };
        if let Some(tx) = self.tx.as_mut() {
            tx.insert(space.table.clone(), table.clone());
        }
        state.tables.insert(space.table.clone(), table);
        Ok(true)
    }
}
