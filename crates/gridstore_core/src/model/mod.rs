//! Domain model for grid-cell persistence.
//!
//! # Responsibility
//! - Define the canonical stored record and its composite key.
//!
//! # Invariants
//! - Every persisted cell is uniquely addressed by its `(row, col)` pair.
//! - `id` is engine-assigned and never reused for another cell.

pub mod cell;
