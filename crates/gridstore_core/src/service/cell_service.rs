//! Cell use-case service.
//!
//! # Responsibility
//! - Provide stable upsert/lookup entry points for core callers.
//! - Delegate persistence to repository implementations.
//!
//! # Invariants
//! - Service APIs never bypass repository transaction choreography.
//! - The service layer stays storage-agnostic.

use crate::db::bridge::StoreTransaction;
use crate::db::StoreResult;
use crate::engine::TxnMode;
use crate::model::cell::{Cell, CellLookup};
use crate::repo::cell_repo::{CellRepository, GridCellRepository};

/// Use-case service wrapper over the cell repository.
pub struct CellService<R: CellRepository> {
    repo: R,
}

impl<R: CellRepository> CellService<R> {
    /// Creates a service using the provided repository implementation.
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Upserts one or more cells as a single atomic batch.
    pub async fn upsert(&self, cells: &[Cell]) -> StoreResult<()> {
        self.repo.upsert(cells).await
    }

    /// Stores one payload at one position.
    ///
    /// # Contract
    /// - Inserts when the position is empty, replaces otherwise.
    pub async fn put_cell(
        &self,
        row: i64,
        col: i64,
        payload: impl Into<Vec<u8>> + Send,
    ) -> StoreResult<()> {
        self.repo.upsert(&[Cell::new(row, col, payload)]).await
    }

    /// Returns every record stored at the position.
    ///
    /// Zero or one record is expected under the uniqueness invariant; the
    /// sequence shape follows the multi-valued index lookup contract.
    pub async fn find_by_row_col(&self, row: i64, col: i64) -> StoreResult<Vec<Cell>> {
        self.repo.find_by_row_col(&CellLookup::at(row, col)).await
    }

    /// Returns the single record at the position, if present.
    pub async fn find_at(&self, row: i64, col: i64) -> StoreResult<Option<Cell>> {
        Ok(self
            .find_by_row_col(row, col)
            .await?
            .into_iter()
            .next())
    }
}

impl CellService<GridCellRepository> {
    /// Starts a transaction for advanced composition with repository calls.
    pub async fn begin_transaction(
        &self,
        tables: &[&str],
        mode: TxnMode,
    ) -> StoreResult<StoreTransaction> {
        self.repo.bridge().begin(tables, mode).await
    }

    /// Runs a lookup inside a caller-supplied transaction.
    pub async fn find_by_row_col_in(
        &self,
        txn: &StoreTransaction,
        row: i64,
        col: i64,
    ) -> StoreResult<Vec<Cell>> {
        self.repo
            .find_by_row_col_in(txn, &CellLookup::at(row, col))
            .await
    }
}
