//! Core persistence logic for GridStore.
//! This crate is the single source of truth for storage invariants.

pub mod db;
pub mod engine;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use db::bridge::{StoreTransaction, TransactionBridge};
pub use db::manager::{
    ConnectionManager, CELLS_TABLE, CELL_KEY_INDEX, SCHEMA_VERSION, STORE_NAME,
};
pub use db::{StoreError, StoreResult};
pub use engine::memory::MemoryEngine;
pub use engine::{EngineError, EngineResult, StoreEngine, TxnMode};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::cell::{Cell, CellId, CellKey, CellLookup};
pub use repo::cell_repo::{
    CellRepository, ConflictAction, GridCellRepository, UpsertStrategy,
};
pub use service::cell_service::CellService;

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
