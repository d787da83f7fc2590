//! Transaction bridge: engine lifecycle events as awaitable results.
//!
//! # Responsibility
//! - Start transactions on the managed session.
//! - Resolve each transaction to exactly one terminal outcome.
//! - Tear down sessions judged stale mid-flight so the next acquire reopens.
//!
//! # Invariants
//! - `await_completion` resolves once per transaction: `Ok` on commit,
//!   `Aborted` on abort or constraint violation.
//! - Every invalid-session class error closes the owning session before it
//!   is surfaced as `SessionInvalid`.

use crate::db::manager::ConnectionManager;
use crate::db::{StoreError, StoreResult};
use crate::engine::{EngineError, EngineTransaction, PendingOp, TableStore, TxnMode};
use log::{info, warn};
use std::sync::Arc;

/// One unit of work bound to the managed session.
///
/// Dropping it without completion aborts the underlying transaction, so an
/// early error return can never leak staged writes.
pub struct StoreTransaction {
    txn: Arc<dyn EngineTransaction>,
    completion: PendingOp<()>,
}

impl std::fmt::Debug for StoreTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreTransaction").finish_non_exhaustive()
    }
}

impl StoreTransaction {
    /// Returns the operation surface for one in-scope table.
    pub fn store(&self, table: &str) -> StoreResult<Arc<dyn TableStore>> {
        self.txn.store(table).map_err(surface_sync)
    }

    /// Explicitly aborts the transaction, discarding staged writes.
    pub fn abort(self) {
        self.txn.abort();
    }
}

/// Converts transaction lifecycle and request notifications into a single
/// deterministic completion idiom, with session-invalidation recovery.
pub struct TransactionBridge {
    manager: Arc<ConnectionManager>,
}

impl TransactionBridge {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Starts a transaction over `tables`, acquiring the session first.
    ///
    /// A session judged stale between acquire and start is closed and
    /// reopened once, transparently to the caller.
    pub async fn begin(&self, tables: &[&str], mode: TxnMode) -> StoreResult<StoreTransaction> {
        let session = self.manager.acquire().await?;
        let txn = match session.transaction(tables, mode) {
            Ok(txn) => txn,
            Err(EngineError::InvalidState(_)) => {
                warn!("event=txn_begin module=db status=retry error_code=stale_session");
                self.manager.invalidate().await;
                let session = self.manager.acquire().await?;
                session.transaction(tables, mode).map_err(surface_sync)?
            }
            Err(err) => return Err(surface_sync(err)),
        };
        let completion = txn.completion();
        Ok(StoreTransaction { txn, completion })
    }

    /// Awaits one request, translating its failure class.
    pub async fn await_request<T>(&self, pending: PendingOp<T>) -> StoreResult<T> {
        match pending.wait().await {
            Ok(value) => Ok(value),
            Err(err) => Err(self.surface(err).await),
        }
    }

    /// Requests commit and suspends until the terminal outcome.
    pub async fn await_completion(&self, txn: StoreTransaction) -> StoreResult<()> {
        txn.txn.commit();
        match txn.completion.wait().await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.surface(err).await),
        }
    }

    /// Maps an engine failure to the caller taxonomy.
    ///
    /// Invalid-session errors additionally close the owning session; without
    /// that, every later transaction would fail identically until restart.
    async fn surface(&self, err: EngineError) -> StoreError {
        if matches!(err, EngineError::InvalidState(_)) {
            info!("event=session_teardown module=db status=ok cause={err}");
            self.manager.invalidate().await;
            return StoreError::SessionInvalid;
        }
        surface_sync(err)
    }
}

fn surface_sync(err: EngineError) -> StoreError {
    match err {
        EngineError::InvalidState(_) => StoreError::SessionInvalid,
        EngineError::ConstraintViolation(message) | EngineError::Aborted(message) => {
            StoreError::Aborted(message)
        }
        EngineError::Internal(message) => StoreError::Aborted(message),
        EngineError::MissingIndex(name) => StoreError::MissingIndex(name),
        err @ (EngineError::Blocked | EngineError::VersionMismatch { .. }) => {
            StoreError::ConnectionFailure(err)
        }
    }
}
