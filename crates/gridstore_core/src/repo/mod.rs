//! Repository layer: upsert protocol and composite-key lookups.
//!
//! # Responsibility
//! - Define the data access contract over the cells table.
//! - Keep transaction choreography inside the persistence boundary.
//!
//! # Invariants
//! - Batch upserts are atomic: a failed batch leaves no partial writes.
//! - Lookups require a complete `(row, col)` key.

pub mod cell_repo;
