use gridstore_core::{
    Cell, CellLookup, CellRepository, CellService, ConnectionManager, GridCellRepository,
    MemoryEngine, StoreError, TransactionBridge, TxnMode, CELLS_TABLE,
};
use std::sync::Arc;

fn service() -> (MemoryEngine, CellService<GridCellRepository>) {
    let engine = MemoryEngine::new();
    let manager = Arc::new(ConnectionManager::new(Arc::new(engine.clone())));
    let bridge = Arc::new(TransactionBridge::new(manager));
    let service = CellService::new(GridCellRepository::new(bridge));
    (engine, service)
}

#[tokio::test]
async fn partial_key_is_rejected_before_storage_access() {
    let engine = MemoryEngine::new();
    let manager = Arc::new(ConnectionManager::new(Arc::new(engine.clone())));
    let bridge = Arc::new(TransactionBridge::new(manager));
    let repo = GridCellRepository::new(bridge);

    let missing_col = CellLookup {
        row: Some(5),
        col: None,
    };
    let err = repo
        .find_by_row_col(&missing_col)
        .await
        .expect_err("partial key must be rejected");
    assert!(matches!(err, StoreError::MissingIndex(_)));

    let missing_row = CellLookup {
        row: None,
        col: Some(5),
    };
    let err = repo
        .find_by_row_col(&missing_row)
        .await
        .expect_err("partial key must be rejected");
    assert!(matches!(err, StoreError::MissingIndex(_)));

    assert_eq!(
        engine.open_handle_count(),
        0,
        "a caller defect must not open the store"
    );
}

#[tokio::test]
async fn absent_key_returns_an_empty_sequence() {
    let (_engine, service) = service();

    let found = service
        .find_by_row_col(9, 9)
        .await
        .expect("lookup should succeed");
    assert!(found.is_empty());
    assert_eq!(service.find_at(9, 9).await.expect("lookup should succeed"), None);
}

#[tokio::test]
async fn put_cell_then_find_at_roundtrip() {
    let (_engine, service) = service();

    service
        .put_cell(2, 3, b"payload".to_vec())
        .await
        .expect("put should commit");

    let stored = service
        .find_at(2, 3)
        .await
        .expect("lookup should succeed")
        .expect("record should be present");
    assert_eq!(stored.payload, b"payload".to_vec());
    assert!(stored.id.is_some());
}

#[tokio::test]
async fn lookup_composes_with_a_caller_transaction() {
    let (_engine, service) = service();

    service
        .upsert(&[Cell::new(1, 1, b"committed".to_vec())])
        .await
        .expect("seed upsert should commit");

    let txn = service
        .begin_transaction(&[CELLS_TABLE], TxnMode::ReadOnly)
        .await
        .expect("transaction should start");
    let found = service
        .find_by_row_col_in(&txn, 1, 1)
        .await
        .expect("in-transaction lookup should succeed");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].payload, b"committed".to_vec());
}
