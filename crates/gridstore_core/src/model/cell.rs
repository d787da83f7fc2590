//! Cell domain model.
//!
//! # Responsibility
//! - Define the canonical record stored in the `cells` table.
//! - Provide key helpers used by the composite-index lookup path.
//!
//! # Invariants
//! - `(row, col)` is unique across all persisted cells.
//! - `id` is assigned by the storage engine on first insert and is the only
//!   stable identity for replace operations.

use serde::{Deserialize, Serialize};

/// Engine-assigned auto-increment identity for a persisted cell.
///
/// Kept as a type alias to make semantic intent explicit in signatures.
pub type CellId = u64;

/// Composite key addressing one cell position.
pub type CellKey = (i64, i64);

/// Canonical persisted record: one binary payload at one grid position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    /// Engine-assigned identity. `None` until the first insert commits.
    pub id: Option<CellId>,
    /// Row coordinate of the composite key.
    pub row: i64,
    /// Column coordinate of the composite key.
    pub col: i64,
    /// Opaque binary payload. Replaced wholesale on upsert, never merged.
    pub payload: Vec<u8>,
}

impl Cell {
    /// Creates a new unsaved cell at the given position.
    pub fn new(row: i64, col: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: None,
            row,
            col,
            payload: payload.into(),
        }
    }

    /// Creates a cell carrying an already-assigned identity.
    ///
    /// Used by replace paths where identity already exists in storage.
    pub fn with_id(id: CellId, row: i64, col: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Some(id),
            row,
            col,
            payload: payload.into(),
        }
    }

    /// Returns the composite key for this cell.
    pub fn key(&self) -> CellKey {
        (self.row, self.col)
    }
}

/// Exact-match lookup arguments for the composite index.
///
/// Both coordinates must be present; a partial key is a caller defect and is
/// rejected before any storage access.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CellLookup {
    pub row: Option<i64>,
    pub col: Option<i64>,
}

impl CellLookup {
    /// Builds a complete lookup for one position.
    pub fn at(row: i64, col: i64) -> Self {
        Self {
            row: Some(row),
            col: Some(col),
        }
    }

    /// Returns the complete key, or `None` when a coordinate is absent.
    pub fn key(&self) -> Option<CellKey> {
        match (self.row, self.col) {
            (Some(row), Some(col)) => Some((row, col)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Cell, CellLookup};

    #[test]
    fn new_cell_has_no_identity() {
        let cell = Cell::new(3, 4, vec![1, 2, 3]);
        assert_eq!(cell.id, None);
        assert_eq!(cell.key(), (3, 4));
    }

    #[test]
    fn with_id_carries_identity() {
        let cell = Cell::with_id(9, 0, 0, b"blob".to_vec());
        assert_eq!(cell.id, Some(9));
    }

    #[test]
    fn lookup_key_requires_both_coordinates() {
        assert_eq!(CellLookup::at(1, 2).key(), Some((1, 2)));
        let partial = CellLookup {
            row: Some(1),
            col: None,
        };
        assert_eq!(partial.key(), None);
        assert_eq!(CellLookup::default().key(), None);
    }
}
