//! In-process reference engine honoring the storage boundary contract.
//!
//! # Responsibility
//! - Provide named tables with auto-increment identity and unique composite
//!   indexes, behind staged atomic transactions.
//! - Track open session handles so singleton/liveness properties are
//!   observable from tests.
//!
//! # Invariants
//! - Reads observe committed state only; staged writes become visible
//!   atomically at commit.
//! - Unique-index ownership is enforced at staging time and re-checked at
//!   commit before any row is mutated.
//! - A transaction dropped while active aborts; its waiters are resolved.

use super::{
    EngineError, EngineResult, EngineSession, EngineTransaction, PendingOp, SchemaBootstrap,
    SchemaEditor, StoreEngine, TableStore, TxnMode,
};
use crate::model::cell::{Cell, CellId, CellKey};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Shared-state engine suitable for tests and embedded use.
#[derive(Clone)]
pub struct MemoryEngine {
    shared: Arc<EngineShared>,
}

struct EngineShared {
    state: Mutex<EngineState>,
}

#[derive(Default)]
struct EngineState {
    name: Option<String>,
    version: u32,
    blocked: bool,
    open_delay: Option<Duration>,
    /// `Some(n)`: the next `n` staged writes succeed, every later one fails.
    writes_before_failure: Option<u64>,
    tables: HashMap<String, Table>,
    next_session_id: u64,
    sessions: HashMap<u64, Arc<SessionFlag>>,
}

#[derive(Default)]
struct Table {
    rows: BTreeMap<CellId, Cell>,
    next_id: CellId,
    indexes: HashMap<String, Index>,
}

struct Index {
    unique: bool,
    entries: HashMap<CellKey, Vec<CellId>>,
}

struct SessionFlag {
    open: AtomicBool,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        let state = EngineState {
            next_session_id: 1,
            ..EngineState::default()
        };
        Self {
            shared: Arc::new(EngineShared {
                state: Mutex::new(state),
            }),
        }
    }

    /// Stalls every subsequent open by `delay`. Test hook.
    pub fn set_open_delay(&self, delay: Option<Duration>) {
        self.shared.state.lock().open_delay = delay;
    }

    /// Makes every subsequent open fail as blocked. Test hook.
    pub fn set_blocked(&self, blocked: bool) {
        self.shared.state.lock().blocked = blocked;
    }

    /// Forces the stored schema version, simulating a store created by a
    /// newer build. Test hook.
    pub fn set_version(&self, version: u32) {
        self.shared.state.lock().version = version;
    }

    pub fn stored_version(&self) -> u32 {
        self.shared.state.lock().version
    }

    /// Lets the next `successes` staged writes through, then fails every
    /// later write and aborts its transaction. Test hook.
    pub fn inject_write_failure_after(&self, successes: u64) {
        self.shared.state.lock().writes_before_failure = Some(successes);
    }

    /// Invalidates every open session, simulating an unexpected disconnect.
    pub fn invalidate_sessions(&self) {
        let mut state = self.shared.state.lock();
        for flag in state.sessions.values() {
            flag.open.store(false, Ordering::SeqCst);
        }
        state.sessions.clear();
    }

    /// Number of session handles currently open engine-side.
    pub fn open_handle_count(&self) -> usize {
        self.shared.state.lock().sessions.len()
    }

    pub fn table_exists(&self, table: &str) -> bool {
        self.shared.state.lock().tables.contains_key(table)
    }

    pub fn index_exists(&self, table: &str, index: &str) -> bool {
        self.shared
            .state
            .lock()
            .tables
            .get(table)
            .is_some_and(|t| t.indexes.contains_key(index))
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.shared
            .state
            .lock()
            .tables
            .get(table)
            .map_or(0, |t| t.rows.len())
    }
}

#[async_trait]
impl StoreEngine for MemoryEngine {
    async fn open(
        &self,
        name: &str,
        version: u32,
        bootstrap: &dyn SchemaBootstrap,
    ) -> EngineResult<Arc<dyn EngineSession>> {
        let delay = self.shared.state.lock().open_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.shared.state.lock();
        if state.blocked {
            return Err(EngineError::Blocked);
        }
        if version < state.version {
            return Err(EngineError::VersionMismatch {
                requested: version,
                current: state.version,
            });
        }
        if version > state.version {
            let from = state.version;
            let mut editor = MemorySchemaEditor { state: &mut *state };
            bootstrap.upgrade(&mut editor, from, version)?;
            state.version = version;
        }
        if state.name.is_none() {
            state.name = Some(name.to_string());
        }

        let id = state.next_session_id;
        state.next_session_id += 1;
        let flag = Arc::new(SessionFlag {
            open: AtomicBool::new(true),
        });
        state.sessions.insert(id, flag.clone());

        Ok(Arc::new(MemorySession {
            id,
            shared: self.shared.clone(),
            flag,
        }))
    }
}

struct MemorySchemaEditor<'a> {
    state: &'a mut EngineState,
}

impl SchemaEditor for MemorySchemaEditor<'_> {
    fn has_table(&self, table: &str) -> bool {
        self.state.tables.contains_key(table)
    }

    fn create_table(&mut self, table: &str) -> EngineResult<()> {
        if self.state.tables.contains_key(table) {
            return Err(EngineError::Internal(format!(
                "table `{table}` already exists"
            )));
        }
        self.state.tables.insert(
            table.to_string(),
            Table {
                next_id: 1,
                ..Table::default()
            },
        );
        Ok(())
    }

    fn has_index(&self, table: &str, index: &str) -> bool {
        self.state
            .tables
            .get(table)
            .is_some_and(|t| t.indexes.contains_key(index))
    }

    fn create_index(
        &mut self,
        table: &str,
        index: &str,
        fields: &[&str],
        unique: bool,
    ) -> EngineResult<()> {
        if fields != ["row", "col"] {
            return Err(EngineError::Internal(format!(
                "unsupported index fields {fields:?}; cells are keyed by (row, col)"
            )));
        }
        let target = self
            .state
            .tables
            .get_mut(table)
            .ok_or_else(|| EngineError::Internal(format!("no such table `{table}`")))?;
        if target.indexes.contains_key(index) {
            return Err(EngineError::Internal(format!(
                "index `{index}` already exists on `{table}`"
            )));
        }

        // Backfill from existing rows; existing data is never touched.
        let mut entries: HashMap<CellKey, Vec<CellId>> = HashMap::new();
        for (id, cell) in &target.rows {
            let slot = entries.entry(cell.key()).or_default();
            if unique && !slot.is_empty() {
                return Err(EngineError::ConstraintViolation(format!(
                    "existing rows collide on {:?} while building `{index}`",
                    cell.key()
                )));
            }
            slot.push(*id);
        }
        target
            .indexes
            .insert(index.to_string(), Index { unique, entries });
        Ok(())
    }
}

struct MemorySession {
    id: u64,
    shared: Arc<EngineShared>,
    flag: Arc<SessionFlag>,
}

impl EngineSession for MemorySession {
    fn is_open(&self) -> bool {
        self.flag.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.flag.open.swap(false, Ordering::SeqCst) {
            self.shared.state.lock().sessions.remove(&self.id);
        }
    }

    fn transaction(&self, tables: &[&str], mode: TxnMode) -> EngineResult<Arc<dyn EngineTransaction>> {
        if !self.is_open() {
            return Err(EngineError::InvalidState(
                "session is closed".to_string(),
            ));
        }
        {
            let state = self.shared.state.lock();
            for table in tables {
                if !state.tables.contains_key(*table) {
                    return Err(EngineError::Internal(format!("no such table `{table}`")));
                }
            }
        }
        Ok(Arc::new(MemoryTransaction {
            inner: Arc::new(TxnInner {
                shared: self.shared.clone(),
                session: self.flag.clone(),
                mode,
                tables: tables.iter().map(|t| t.to_string()).collect(),
                state: Mutex::new(TxnState::default()),
            }),
        }))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TxnPhase {
    Active,
    Committed,
    Aborted,
}

enum StagedOp {
    Upsert { table: String, cell: Cell },
    Delete { table: String, id: CellId },
}

struct TxnState {
    phase: TxnPhase,
    outcome: Option<EngineError>,
    staged: Vec<StagedOp>,
    /// Staged unique-key ownership layered over committed index state.
    key_owner: HashMap<(String, CellKey), Option<CellId>>,
    /// Staged row state by identity layered over committed rows.
    row_state: HashMap<(String, CellId), Option<Cell>>,
    waiters: Vec<oneshot::Sender<EngineResult<()>>>,
}

impl Default for TxnState {
    fn default() -> Self {
        Self {
            phase: TxnPhase::Active,
            outcome: None,
            staged: Vec::new(),
            key_owner: HashMap::new(),
            row_state: HashMap::new(),
            waiters: Vec::new(),
        }
    }
}

impl TxnState {
    fn settle(&mut self, phase: TxnPhase, outcome: Option<EngineError>) {
        self.phase = phase;
        self.outcome = outcome.clone();
        let result = match outcome {
            None => Ok(()),
            Some(err) => Err(err),
        };
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }
}

struct TxnInner {
    shared: Arc<EngineShared>,
    session: Arc<SessionFlag>,
    mode: TxnMode,
    tables: Vec<String>,
    state: Mutex<TxnState>,
}

impl TxnInner {
    /// Effective owner of a unique key: staged overlay first, then committed.
    fn owner_of(&self, engine: &EngineState, txn: &TxnState, table: &str, key: CellKey) -> Option<CellId> {
        if let Some(staged) = txn.key_owner.get(&(table.to_string(), key)) {
            return *staged;
        }
        committed_owner(engine, table, key)
    }

    /// Current row for an identity: staged overlay first, then committed.
    fn row_of(&self, engine: &EngineState, txn: &TxnState, table: &str, id: CellId) -> Option<Cell> {
        if let Some(staged) = txn.row_state.get(&(table.to_string(), id)) {
            return staged.clone();
        }
        engine
            .tables
            .get(table)
            .and_then(|t| t.rows.get(&id))
            .cloned()
    }

    fn abort_locked(&self, txn: &mut TxnState, error: EngineError) {
        if txn.phase == TxnPhase::Active {
            txn.settle(TxnPhase::Aborted, Some(error));
        }
    }

    /// Runs the shared preamble of every write op; returns the error that
    /// should resolve the op when the write cannot be staged.
    fn write_gate(&self, engine: &mut EngineState, txn: &mut TxnState) -> EngineResult<()> {
        if txn.phase != TxnPhase::Active {
            return Err(txn
                .outcome
                .clone()
                .unwrap_or_else(|| EngineError::Aborted("transaction is finished".to_string())));
        }
        if !self.session.open.load(Ordering::SeqCst) {
            let error = EngineError::InvalidState("session invalidated mid-transaction".to_string());
            self.abort_locked(txn, error.clone());
            return Err(error);
        }
        if self.mode != TxnMode::ReadWrite {
            return Err(EngineError::Internal(
                "write issued on a read-only transaction".to_string(),
            ));
        }
        if let Some(remaining) = engine.writes_before_failure.as_mut() {
            if *remaining == 0 {
                let error = EngineError::Internal("injected write failure".to_string());
                self.abort_locked(txn, error.clone());
                return Err(error);
            }
            *remaining -= 1;
        }
        Ok(())
    }

    fn stage_upsert(&self, table: &str, mut cell: Cell) -> EngineResult<CellId> {
        let mut engine = self.shared.state.lock();
        let mut txn = self.state.lock();
        self.write_gate(&mut engine, &mut txn)?;

        let id = match cell.id {
            Some(id) => id,
            None => {
                let target = engine
                    .tables
                    .get_mut(table)
                    .ok_or_else(|| EngineError::Internal(format!("no such table `{table}`")))?;
                let id = target.next_id;
                target.next_id += 1;
                id
            }
        };
        cell.id = Some(id);

        let key = cell.key();
        if let Some(owner) = self.owner_of(&engine, &txn, table, key) {
            if owner != id {
                let error = EngineError::ConstraintViolation(format!(
                    "key {key:?} is already owned by record {owner}"
                ));
                self.abort_locked(&mut txn, error.clone());
                return Err(error);
            }
        }

        // A replace that moves the record releases its previous key.
        if let Some(previous) = self.row_of(&engine, &txn, table, id) {
            if previous.key() != key {
                txn.key_owner
                    .insert((table.to_string(), previous.key()), None);
            }
        }

        if let Some(target) = engine.tables.get_mut(table) {
            if id >= target.next_id {
                target.next_id = id + 1;
            }
        }
        txn.key_owner.insert((table.to_string(), key), Some(id));
        txn.row_state
            .insert((table.to_string(), id), Some(cell.clone()));
        txn.staged.push(StagedOp::Upsert {
            table: table.to_string(),
            cell,
        });
        Ok(id)
    }

    fn stage_delete(&self, table: &str, id: CellId) -> EngineResult<()> {
        let mut engine = self.shared.state.lock();
        let mut txn = self.state.lock();
        self.write_gate(&mut engine, &mut txn)?;

        if let Some(previous) = self.row_of(&engine, &txn, table, id) {
            txn.key_owner
                .insert((table.to_string(), previous.key()), None);
        }
        txn.row_state.insert((table.to_string(), id), None);
        txn.staged.push(StagedOp::Delete {
            table: table.to_string(),
            id,
        });
        Ok(())
    }

    fn read_index(&self, table: &str, index: &str, key: CellKey) -> EngineResult<Vec<Cell>> {
        let engine = self.shared.state.lock();
        let mut txn = self.state.lock();
        if txn.phase != TxnPhase::Active {
            return Err(txn
                .outcome
                .clone()
                .unwrap_or_else(|| EngineError::Aborted("transaction is finished".to_string())));
        }
        if !self.session.open.load(Ordering::SeqCst) {
            let error = EngineError::InvalidState("session invalidated mid-transaction".to_string());
            self.abort_locked(&mut txn, error.clone());
            return Err(error);
        }

        let target = engine
            .tables
            .get(table)
            .ok_or_else(|| EngineError::Internal(format!("no such table `{table}`")))?;
        let idx = target
            .indexes
            .get(index)
            .ok_or_else(|| EngineError::MissingIndex(index.to_string()))?;
        let cells = idx
            .entries
            .get(&key)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| target.rows.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        Ok(cells)
    }

    fn commit(&self) {
        let mut engine = self.shared.state.lock();
        let mut txn = self.state.lock();
        if txn.phase != TxnPhase::Active {
            return;
        }
        if !self.session.open.load(Ordering::SeqCst) {
            self.abort_locked(
                &mut txn,
                EngineError::InvalidState("session invalidated before commit".to_string()),
            );
            return;
        }

        // Writers are serialized engine-side: re-check unique ownership
        // against state committed after staging, before mutating anything.
        if let Err(error) = validate_staged(&engine, &txn.staged) {
            txn.settle(TxnPhase::Aborted, Some(error));
            return;
        }

        for op in txn.staged.drain(..) {
            match op {
                StagedOp::Upsert { table, cell } => apply_upsert(&mut engine, &table, cell),
                StagedOp::Delete { table, id } => apply_delete(&mut engine, &table, id),
            }
        }
        txn.settle(TxnPhase::Committed, None);
    }

    fn abort(&self) {
        let mut txn = self.state.lock();
        self.abort_locked(&mut txn, EngineError::Aborted("transaction aborted".to_string()));
    }
}

impl Drop for TxnInner {
    fn drop(&mut self) {
        let mut txn = self.state.lock();
        if txn.phase == TxnPhase::Active {
            txn.settle(
                TxnPhase::Aborted,
                Some(EngineError::Aborted(
                    "transaction dropped without commit".to_string(),
                )),
            );
        }
    }
}

fn committed_owner(engine: &EngineState, table: &str, key: CellKey) -> Option<CellId> {
    let target = engine.tables.get(table)?;
    target
        .indexes
        .values()
        .filter(|idx| idx.unique)
        .find_map(|idx| idx.entries.get(&key).and_then(|ids| ids.first().copied()))
}

/// Replays staged ops over committed state, rejecting any unique-key conflict.
fn validate_staged(engine: &EngineState, staged: &[StagedOp]) -> EngineResult<()> {
    let mut key_owner: HashMap<(&str, CellKey), Option<CellId>> = HashMap::new();
    let mut row_state: HashMap<(&str, CellId), Option<CellKey>> = HashMap::new();

    fn key_of(
        engine: &EngineState,
        row_state: &HashMap<(&str, CellId), Option<CellKey>>,
        table: &str,
        id: CellId,
    ) -> Option<CellKey> {
        match row_state.get(&(table, id)) {
            Some(staged) => *staged,
            None => engine
                .tables
                .get(table)
                .and_then(|t| t.rows.get(&id))
                .map(Cell::key),
        }
    }

    for op in staged {
        match op {
            StagedOp::Upsert { table, cell } => {
                let id = match cell.id {
                    Some(id) => id,
                    None => {
                        return Err(EngineError::Internal(
                            "staged upsert without identity".to_string(),
                        ))
                    }
                };
                let key = cell.key();
                let owner = key_owner
                    .get(&(table.as_str(), key))
                    .copied()
                    .unwrap_or_else(|| committed_owner(engine, table, key));
                if let Some(owner) = owner {
                    if owner != id {
                        return Err(EngineError::ConstraintViolation(format!(
                            "key {key:?} is already owned by record {owner}"
                        )));
                    }
                }
                if let Some(previous) = key_of(engine, &row_state, table, id) {
                    if previous != key {
                        key_owner.insert((table.as_str(), previous), None);
                    }
                }
                key_owner.insert((table.as_str(), key), Some(id));
                row_state.insert((table.as_str(), id), Some(key));
            }
            StagedOp::Delete { table, id } => {
                if let Some(previous) = key_of(engine, &row_state, table, *id) {
                    key_owner.insert((table.as_str(), previous), None);
                }
                row_state.insert((table.as_str(), *id), None);
            }
        }
    }
    Ok(())
}

fn apply_upsert(engine: &mut EngineState, table: &str, cell: Cell) {
    let Some(target) = engine.tables.get_mut(table) else {
        return;
    };
    let id = cell.id.unwrap_or_default();
    if let Some(previous) = target.rows.insert(id, cell.clone()) {
        for idx in target.indexes.values_mut() {
            if let Some(ids) = idx.entries.get_mut(&previous.key()) {
                ids.retain(|existing| *existing != id);
                if ids.is_empty() {
                    idx.entries.remove(&previous.key());
                }
            }
        }
    }
    for idx in target.indexes.values_mut() {
        idx.entries.entry(cell.key()).or_default().push(id);
    }
}

fn apply_delete(engine: &mut EngineState, table: &str, id: CellId) {
    let Some(target) = engine.tables.get_mut(table) else {
        return;
    };
    if let Some(previous) = target.rows.remove(&id) {
        for idx in target.indexes.values_mut() {
            if let Some(ids) = idx.entries.get_mut(&previous.key()) {
                ids.retain(|existing| *existing != id);
                if ids.is_empty() {
                    idx.entries.remove(&previous.key());
                }
            }
        }
    }
}

struct MemoryTransaction {
    inner: Arc<TxnInner>,
}

impl EngineTransaction for MemoryTransaction {
    fn store(&self, table: &str) -> EngineResult<Arc<dyn TableStore>> {
        if !self.inner.tables.iter().any(|t| t == table) {
            return Err(EngineError::Internal(format!(
                "table `{table}` is outside this transaction's scope"
            )));
        }
        Ok(Arc::new(MemoryTableStore {
            txn: self.inner.clone(),
            table: table.to_string(),
        }))
    }

    fn completion(&self) -> PendingOp<()> {
        let mut txn = self.inner.state.lock();
        match txn.phase {
            TxnPhase::Active => {
                let (tx, op) = PendingOp::pending();
                txn.waiters.push(tx);
                op
            }
            TxnPhase::Committed => PendingOp::ready(Ok(())),
            TxnPhase::Aborted => PendingOp::ready(Err(txn
                .outcome
                .clone()
                .unwrap_or_else(|| EngineError::Aborted("transaction aborted".to_string())))),
        }
    }

    fn commit(&self) {
        self.inner.commit();
    }

    fn abort(&self) {
        self.inner.abort();
    }
}

struct MemoryTableStore {
    txn: Arc<TxnInner>,
    table: String,
}

impl TableStore for MemoryTableStore {
    fn add(&self, mut cell: Cell) -> PendingOp<CellId> {
        cell.id = None;
        PendingOp::ready(self.txn.stage_upsert(&self.table, cell))
    }

    fn put(&self, cell: Cell) -> PendingOp<CellId> {
        PendingOp::ready(self.txn.stage_upsert(&self.table, cell))
    }

    fn delete(&self, id: CellId) -> PendingOp<()> {
        PendingOp::ready(self.txn.stage_delete(&self.table, id))
    }

    fn index_get_all(&self, index: &str, key: CellKey) -> PendingOp<Vec<Cell>> {
        PendingOp::ready(self.txn.read_index(&self.table, index, key))
    }
}
