//! Storage engine boundary consumed by the connection and transaction layers.
//!
//! # Responsibility
//! - Define the contract of the embedded transactional key-value engine:
//!   versioned open, named tables, auto-increment identity, unique composite
//!   indexes, atomic transactions with commit/abort notification.
//! - Keep engine internals opaque to everything above this module.
//!
//! # Invariants
//! - A transaction terminates exactly once: committed, aborted, or errored.
//! - Session liveness is engine-side state, never a cached snapshot.
//! - Request outcomes are delivered through [`PendingOp`] completion futures.

use crate::model::cell::{Cell, CellId, CellKey};
use async_trait::async_trait;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tokio::sync::oneshot;

pub mod memory;

pub type EngineResult<T> = Result<T, EngineError>;

/// Failure classes reported by the engine boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Another open handle holds an incompatible version.
    Blocked,
    /// The requested schema version is older than the stored one.
    VersionMismatch { requested: u32, current: u32 },
    /// The session or transaction is no longer usable.
    InvalidState(String),
    /// A unique index rejected a write.
    ConstraintViolation(String),
    /// The named index does not exist on the target table.
    MissingIndex(String),
    /// The transaction terminated without committing.
    Aborted(String),
    /// Engine-internal failure not covered by a more specific class.
    Internal(String),
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blocked => write!(f, "open blocked by another handle"),
            Self::VersionMismatch { requested, current } => write!(
                f,
                "requested schema version {requested} is older than stored version {current}"
            ),
            Self::InvalidState(message) => write!(f, "invalid engine state: {message}"),
            Self::ConstraintViolation(message) => {
                write!(f, "uniqueness constraint violated: {message}")
            }
            Self::MissingIndex(name) => write!(f, "no such index: {name}"),
            Self::Aborted(message) => write!(f, "transaction aborted: {message}"),
            Self::Internal(message) => write!(f, "engine failure: {message}"),
        }
    }
}

impl Error for EngineError {}

/// Transaction scope requested from a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnMode {
    ReadOnly,
    ReadWrite,
}

/// Completion future for one engine request.
///
/// Stands in for the engine's request success/error notification: the engine
/// resolves the sender side exactly once, the caller suspends on [`wait`].
///
/// [`wait`]: PendingOp::wait
pub struct PendingOp<T> {
    rx: oneshot::Receiver<EngineResult<T>>,
}

impl<T> PendingOp<T> {
    /// Creates an unresolved op plus the sender the engine resolves it with.
    pub(crate) fn pending() -> (oneshot::Sender<EngineResult<T>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Creates an op already carrying its outcome.
    pub(crate) fn ready(result: EngineResult<T>) -> Self {
        let (tx, op) = Self::pending();
        // Receiver is held by `op`, so the send cannot fail.
        let _ = tx.send(result);
        op
    }

    /// Suspends until the engine delivers the request outcome.
    pub async fn wait(self) -> EngineResult<T> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(EngineError::InvalidState(
                "request dropped before completion".to_string(),
            )),
        }
    }
}

/// Entry point into the storage engine: versioned open with schema bootstrap.
#[async_trait]
pub trait StoreEngine: Send + Sync {
    /// Opens the named store at `version`.
    ///
    /// # Contract
    /// - When the stored version is older than `version`, `bootstrap` runs
    ///   before any session is handed out, and the stored version is raised.
    /// - When the stored version is newer, fails with `VersionMismatch`;
    ///   versions never decrease.
    /// - Fails with `Blocked` when another handle prevents the open.
    async fn open(
        &self,
        name: &str,
        version: u32,
        bootstrap: &dyn SchemaBootstrap,
    ) -> EngineResult<Arc<dyn EngineSession>>;
}

/// Versioned schema setup invoked by [`StoreEngine::open`].
pub trait SchemaBootstrap: Send + Sync {
    fn upgrade(
        &self,
        schema: &mut dyn SchemaEditor,
        from_version: u32,
        to_version: u32,
    ) -> EngineResult<()>;
}

/// Schema mutation surface available only during an upgrade.
pub trait SchemaEditor {
    fn has_table(&self, table: &str) -> bool;
    /// Fails when the table already exists; callers check `has_table` first.
    fn create_table(&mut self, table: &str) -> EngineResult<()>;
    fn has_index(&self, table: &str, index: &str) -> bool;
    /// Builds the index over existing rows without touching row data.
    fn create_index(
        &mut self,
        table: &str,
        index: &str,
        fields: &[&str],
        unique: bool,
    ) -> EngineResult<()>;
}

/// One open logical connection to the engine.
pub trait EngineSession: Send + Sync {
    /// Re-derives liveness from engine-side state on every call.
    fn is_open(&self) -> bool;

    /// Closes the handle and releases it engine-side. Idempotent.
    fn close(&self);

    /// Starts a transaction scoped to `tables`.
    fn transaction(&self, tables: &[&str], mode: TxnMode) -> EngineResult<Arc<dyn EngineTransaction>>;
}

impl std::fmt::Debug for dyn EngineSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSession")
            .field("is_open", &self.is_open())
            .finish()
    }
}

/// A scoped atomic unit of work.
pub trait EngineTransaction: Send + Sync {
    /// Returns the operation surface for one in-scope table.
    fn store(&self, table: &str) -> EngineResult<Arc<dyn TableStore>>;

    /// Registers a completion waiter.
    ///
    /// Resolves `Ok(())` on commit and `Err` on abort or failure; a waiter
    /// registered after the terminal outcome resolves immediately.
    fn completion(&self) -> PendingOp<()>;

    /// Requests commit. No-op once the transaction is terminal.
    fn commit(&self);

    /// Requests abort. No-op once the transaction is terminal.
    fn abort(&self);
}

/// Per-table operations issued inside a transaction.
pub trait TableStore: Send + Sync {
    /// Inserts a new record, letting the engine assign its identity.
    fn add(&self, cell: Cell) -> PendingOp<CellId>;

    /// Inserts or replaces by the record's identity.
    fn put(&self, cell: Cell) -> PendingOp<CellId>;

    /// Deletes by identity. Succeeds even when the identity is absent.
    fn delete(&self, id: CellId) -> PendingOp<()>;

    /// Exact-match lookup on a named composite index.
    fn index_get_all(&self, index: &str, key: CellKey) -> PendingOp<Vec<Cell>>;
}
