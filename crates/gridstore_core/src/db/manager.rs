//! Singleton session manager for the cell store.
//!
//! # Responsibility
//! - Lazily open the store and hand out the one current session.
//! - Run the idempotent versioned schema bootstrap on first open.
//! - Race opens against a timeout and classify open failures.
//!
//! # Invariants
//! - At most one open attempt is inflight; concurrent callers wait on it.
//! - A duplicate session resolved while another is current is closed, never
//!   leaked or substituted.
//! - Schema versions are monotonic; bootstrap never destroys existing rows.
//! - Liveness is re-derived from engine state on every acquire.

use crate::db::{StoreError, StoreResult};
use crate::engine::{
    EngineError, EngineResult, EngineSession, SchemaBootstrap, SchemaEditor, StoreEngine,
};
use log::{error, info};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Logical store name handed to the engine on open.
pub const STORE_NAME: &str = "gridstore";
/// Current schema version. Bumping it triggers bootstrap; it never decreases.
pub const SCHEMA_VERSION: u32 = 1;
/// Table holding all cell records.
pub const CELLS_TABLE: &str = "cells";
/// Unique composite index on `(row, col)`.
pub const CELL_KEY_INDEX: &str = "cell_key";

const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_millis(5000);

/// Schema setup for the single-version case: create the cells table and its
/// unique composite index only where absent, leaving existing data intact.
struct CellSchemaBootstrap;

impl SchemaBootstrap for CellSchemaBootstrap {
    fn upgrade(
        &self,
        schema: &mut dyn SchemaEditor,
        _from_version: u32,
        _to_version: u32,
    ) -> EngineResult<()> {
        if !schema.has_table(CELLS_TABLE) {
            schema.create_table(CELLS_TABLE)?;
        }
        if !schema.has_index(CELLS_TABLE, CELL_KEY_INDEX) {
            schema.create_index(CELLS_TABLE, CELL_KEY_INDEX, &["row", "col"], true)?;
        }
        Ok(())
    }
}

/// Owns the singleton session lifecycle over an opaque storage engine.
pub struct ConnectionManager {
    engine: Arc<dyn StoreEngine>,
    /// Single-flight slot: the async mutex serializes concurrent opens.
    slot: Mutex<Option<Arc<dyn EngineSession>>>,
    open_timeout: Duration,
}

impl ConnectionManager {
    /// Creates a manager with the default 5000ms open timeout.
    pub fn new(engine: Arc<dyn StoreEngine>) -> Self {
        Self::with_open_timeout(engine, DEFAULT_OPEN_TIMEOUT)
    }

    /// Creates a manager with a caller-chosen open timeout.
    pub fn with_open_timeout(engine: Arc<dyn StoreEngine>, open_timeout: Duration) -> Self {
        Self {
            engine,
            slot: Mutex::new(None),
            open_timeout,
        }
    }

    pub fn open_timeout(&self) -> Duration {
        self.open_timeout
    }

    /// Returns the current session, opening the store when necessary.
    ///
    /// # Contract
    /// - Returns the existing session while the engine still reports it open.
    /// - Fails with `ConnectionTimeout` when the open outlasts the timeout,
    ///   `ConnectionBlocked` when another handle prevents it, and
    ///   `ConnectionFailure` otherwise.
    pub async fn acquire(&self) -> StoreResult<Arc<dyn EngineSession>> {
        let mut slot = self.slot.lock().await;
        if let Some(session) = slot.as_ref() {
            if session.is_open() {
                return Ok(session.clone());
            }
        }

        let started_at = Instant::now();
        info!(
            "event=store_open module=db status=start name={STORE_NAME} version={SCHEMA_VERSION}"
        );

        let bootstrap = CellSchemaBootstrap;
        let open = self.engine.open(STORE_NAME, SCHEMA_VERSION, &bootstrap);
        let opened = match tokio::time::timeout(self.open_timeout, open).await {
            Err(_elapsed) => {
                let timeout_ms = self.open_timeout.as_millis() as u64;
                error!(
                    "event=store_open module=db status=error error_code=open_timeout timeout_ms={timeout_ms}"
                );
                return Err(StoreError::ConnectionTimeout { timeout_ms });
            }
            Ok(Err(EngineError::Blocked)) => {
                error!(
                    "event=store_open module=db status=error error_code=open_blocked duration_ms={}",
                    started_at.elapsed().as_millis()
                );
                return Err(StoreError::ConnectionBlocked);
            }
            Ok(Err(err)) => {
                error!(
                    "event=store_open module=db status=error error_code=open_failed duration_ms={} error={err}",
                    started_at.elapsed().as_millis()
                );
                return Err(StoreError::ConnectionFailure(err));
            }
            Ok(Ok(session)) => session,
        };

        // The slot may still hold a session from before this open started.
        // If it came back alive, the fresh handle is the duplicate: close it
        // and keep the current one. Otherwise discard the stale handle.
        if let Some(previous) = slot.take() {
            if previous.is_open() {
                opened.close();
                info!("event=store_open module=db status=ok outcome=duplicate_discarded");
                *slot = Some(previous.clone());
                return Ok(previous);
            }
            previous.close();
        }

        info!(
            "event=store_open module=db status=ok duration_ms={}",
            started_at.elapsed().as_millis()
        );
        *slot = Some(opened.clone());
        Ok(opened)
    }

    /// Closes and forgets the current session, forcing the next acquire to
    /// open fresh. Safe to call when no session is held.
    pub async fn invalidate(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(session) = slot.take() {
            session.close();
            info!("event=session_invalidated module=db status=ok");
        }
    }
}
