//! Cell repository: transactional upsert engine and composite-key queries.
//!
//! # Responsibility
//! - Resolve insert-or-replace semantics against the `(row, col)` unique
//!   index, batching all writes into one transaction.
//! - Serve exact composite-key lookups, standalone or inside a caller's
//!   transaction.
//!
//! # Invariants
//! - Each record's write is issued only after its own lookup resolved.
//! - A batch commits or aborts as a whole; partial writes are never visible.
//! - `Replace` keeps the existing identity; `DeleteInsert` assigns a new one.

use crate::db::bridge::{StoreTransaction, TransactionBridge};
use crate::db::manager::{CELLS_TABLE, CELL_KEY_INDEX};
use crate::db::{StoreError, StoreResult};
use crate::engine::{TableStore, TxnMode};
use crate::model::cell::{Cell, CellId, CellLookup};
use async_trait::async_trait;
use futures::future::try_join_all;
use log::{error, info};
use std::sync::Arc;
use std::time::Instant;

/// How lookups and writes of one batch are scheduled within the transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpsertStrategy {
    /// Resolve and write one record at a time.
    #[default]
    Sequential,
    /// Issue every lookup up front, then write per record as each resolves.
    InterleavedReads,
    /// Await all lookups concurrently, then issue the collected writes.
    ConcurrentReads,
}

/// What to do when a candidate's key already has a stored record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictAction {
    /// Replace in place, carrying over the stored identity.
    #[default]
    Replace,
    /// Delete the stored record, then insert fresh under a new identity.
    DeleteInsert,
}

/// Data access contract over the cells table.
#[async_trait]
pub trait CellRepository: Send + Sync {
    /// Upserts the batch atomically in one read-write transaction.
    async fn upsert(&self, cells: &[Cell]) -> StoreResult<()>;

    /// Exact composite-key lookup in its own read-only transaction.
    ///
    /// Fails with `MissingIndex` when `row` or `col` is absent.
    async fn find_by_row_col(&self, lookup: &CellLookup) -> StoreResult<Vec<Cell>>;
}

/// Bridge-backed repository over the managed store.
pub struct GridCellRepository {
    bridge: Arc<TransactionBridge>,
    strategy: UpsertStrategy,
    conflict: ConflictAction,
}

impl GridCellRepository {
    /// Creates a repository with the default strategy (`Sequential`) and
    /// conflict action (`Replace`).
    pub fn new(bridge: Arc<TransactionBridge>) -> Self {
        Self::with_config(bridge, UpsertStrategy::default(), ConflictAction::default())
    }

    pub fn with_config(
        bridge: Arc<TransactionBridge>,
        strategy: UpsertStrategy,
        conflict: ConflictAction,
    ) -> Self {
        Self {
            bridge,
            strategy,
            conflict,
        }
    }

    pub fn bridge(&self) -> &Arc<TransactionBridge> {
        &self.bridge
    }

    /// Runs the lookup inside a caller-supplied transaction, composing with
    /// an in-flight upsert.
    pub async fn find_by_row_col_in(
        &self,
        txn: &StoreTransaction,
        lookup: &CellLookup,
    ) -> StoreResult<Vec<Cell>> {
        let key = complete_key(lookup)?;
        let store = txn.store(CELLS_TABLE)?;
        self.bridge
            .await_request(store.index_get_all(CELL_KEY_INDEX, key))
            .await
    }

    /// Looks up the stored identity owning this cell's key, if any.
    async fn resolve_existing(
        &self,
        store: &Arc<dyn TableStore>,
        cell: &Cell,
    ) -> StoreResult<Option<CellId>> {
        let matches = self
            .bridge
            .await_request(store.index_get_all(CELL_KEY_INDEX, cell.key()))
            .await?;
        Ok(matches.into_iter().find_map(|existing| existing.id))
    }

    /// Issues the write for one resolved record, honoring the conflict
    /// action. Must run after that record's own lookup resolved.
    async fn write_resolved(
        &self,
        store: &Arc<dyn TableStore>,
        cell: &Cell,
        existing: Option<CellId>,
    ) -> StoreResult<()> {
        match (existing, self.conflict) {
            (Some(id), ConflictAction::Replace) => {
                let replacement = Cell::with_id(id, cell.row, cell.col, cell.payload.clone());
                self.bridge.await_request(store.put(replacement)).await?;
            }
            (Some(id), ConflictAction::DeleteInsert) => {
                self.bridge.await_request(store.delete(id)).await?;
                self.bridge
                    .await_request(store.add(fresh(cell)))
                    .await?;
            }
            (None, _) => {
                self.bridge
                    .await_request(store.add(fresh(cell)))
                    .await?;
            }
        }
        Ok(())
    }

    async fn upsert_sequential(
        &self,
        store: &Arc<dyn TableStore>,
        cells: &[Cell],
    ) -> StoreResult<()> {
        for cell in cells {
            let existing = self.resolve_existing(store, cell).await?;
            self.write_resolved(store, cell, existing).await?;
        }
        Ok(())
    }

    async fn upsert_interleaved(
        &self,
        store: &Arc<dyn TableStore>,
        cells: &[Cell],
    ) -> StoreResult<()> {
        let lookups: Vec<_> = cells
            .iter()
            .map(|cell| store.index_get_all(CELL_KEY_INDEX, cell.key()))
            .collect();
        for (cell, lookup) in cells.iter().zip(lookups) {
            let matches = self.bridge.await_request(lookup).await?;
            let existing = matches.into_iter().find_map(|found| found.id);
            self.write_resolved(store, cell, existing).await?;
        }
        Ok(())
    }

    async fn upsert_concurrent(
        &self,
        store: &Arc<dyn TableStore>,
        cells: &[Cell],
    ) -> StoreResult<()> {
        let lookups = cells
            .iter()
            .map(|cell| self.bridge.await_request(store.index_get_all(CELL_KEY_INDEX, cell.key())));
        let resolved = try_join_all(lookups).await?;

        for (cell, matches) in cells.iter().zip(resolved) {
            let existing = matches.into_iter().find_map(|found| found.id);
            self.write_resolved(store, cell, existing).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CellRepository for GridCellRepository {
    async fn upsert(&self, cells: &[Cell]) -> StoreResult<()> {
        if cells.is_empty() {
            return Ok(());
        }

        let started_at = Instant::now();
        let txn = self.bridge.begin(&[CELLS_TABLE], TxnMode::ReadWrite).await?;
        let store = txn.store(CELLS_TABLE)?;

        let staged = match self.strategy {
            UpsertStrategy::Sequential => self.upsert_sequential(&store, cells).await,
            UpsertStrategy::InterleavedReads => self.upsert_interleaved(&store, cells).await,
            UpsertStrategy::ConcurrentReads => self.upsert_concurrent(&store, cells).await,
        };
        if let Err(err) = staged {
            error!(
                "event=cell_upsert module=repo status=error count={} duration_ms={} error={err}",
                cells.len(),
                started_at.elapsed().as_millis()
            );
            txn.abort();
            return Err(err);
        }

        match self.bridge.await_completion(txn).await {
            Ok(()) => {
                info!(
                    "event=cell_upsert module=repo status=ok count={} duration_ms={}",
                    cells.len(),
                    started_at.elapsed().as_millis()
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    "event=cell_upsert module=repo status=error count={} duration_ms={} error={err}",
                    cells.len(),
                    started_at.elapsed().as_millis()
                );
                Err(err)
            }
        }
    }

    async fn find_by_row_col(&self, lookup: &CellLookup) -> StoreResult<Vec<Cell>> {
        let key = complete_key(lookup)?;
        let txn = self.bridge.begin(&[CELLS_TABLE], TxnMode::ReadOnly).await?;
        let store = txn.store(CELLS_TABLE)?;
        let found = self
            .bridge
            .await_request(store.index_get_all(CELL_KEY_INDEX, key))
            .await?;
        self.bridge.await_completion(txn).await?;
        Ok(found)
    }
}

/// Rejects partial keys before any storage access; a missing coordinate is a
/// call-site defect, not a data condition.
fn complete_key(lookup: &CellLookup) -> StoreResult<(i64, i64)> {
    lookup.key().ok_or_else(|| {
        let missing = match (lookup.row, lookup.col) {
            (None, None) => "row and col",
            (None, Some(_)) => "row",
            _ => "col",
        };
        StoreError::MissingIndex(format!(
            "composite key ({CELL_KEY_INDEX}) requires {missing}"
        ))
    })
}

/// Strips any identity so the engine assigns a fresh one on insert.
fn fresh(cell: &Cell) -> Cell {
    Cell::new(cell.row, cell.col, cell.payload.clone())
}
