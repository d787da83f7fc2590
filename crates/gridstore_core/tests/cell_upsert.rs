use gridstore_core::{
    Cell, CellRepository, ConflictAction, ConnectionManager, GridCellRepository, MemoryEngine,
    StoreError, TransactionBridge, TxnMode, UpsertStrategy, CELLS_TABLE,
};
use gridstore_core::model::cell::CellLookup;
use std::sync::Arc;

fn harness() -> (MemoryEngine, Arc<TransactionBridge>) {
    let engine = MemoryEngine::new();
    let manager = Arc::new(ConnectionManager::new(Arc::new(engine.clone())));
    (engine, Arc::new(TransactionBridge::new(manager)))
}

async fn single_record_at(repo: &GridCellRepository, row: i64, col: i64) -> Cell {
    let found = repo
        .find_by_row_col(&CellLookup::at(row, col))
        .await
        .expect("lookup should succeed");
    assert_eq!(found.len(), 1, "expected exactly one record at ({row},{col})");
    found.into_iter().next().expect("record should be present")
}

#[tokio::test]
async fn second_upsert_replaces_the_payload() {
    let (engine, bridge) = harness();
    let repo = GridCellRepository::new(bridge);

    repo.upsert(&[Cell::new(0, 0, b"B1".to_vec())])
        .await
        .expect("first upsert should commit");
    repo.upsert(&[Cell::new(0, 0, b"B2".to_vec())])
        .await
        .expect("second upsert should commit");

    let stored = single_record_at(&repo, 0, 0).await;
    assert_eq!(stored.payload, b"B2".to_vec());
    assert_eq!(engine.row_count(CELLS_TABLE), 1);
}

#[tokio::test]
async fn replace_preserves_the_stored_identity() {
    let (_engine, bridge) = harness();
    let repo = GridCellRepository::new(bridge);

    repo.upsert(&[Cell::new(3, 7, b"first".to_vec())])
        .await
        .expect("insert should commit");
    let before = single_record_at(&repo, 3, 7).await;

    repo.upsert(&[Cell::new(3, 7, b"second".to_vec())])
        .await
        .expect("replace should commit");
    let after = single_record_at(&repo, 3, 7).await;

    assert!(before.id.is_some());
    assert_eq!(before.id, after.id, "replace must carry the identity over");
    assert_eq!(after.payload, b"second".to_vec());
}

#[tokio::test]
async fn delete_insert_assigns_a_fresh_identity() {
    let (_engine, bridge) = harness();
    let repo = GridCellRepository::with_config(
        bridge,
        UpsertStrategy::Sequential,
        ConflictAction::DeleteInsert,
    );

    repo.upsert(&[Cell::new(3, 7, b"first".to_vec())])
        .await
        .expect("insert should commit");
    let before = single_record_at(&repo, 3, 7).await;

    repo.upsert(&[Cell::new(3, 7, b"second".to_vec())])
        .await
        .expect("delete-insert should commit");
    let after = single_record_at(&repo, 3, 7).await;

    assert!(before.id.is_some());
    assert!(after.id.is_some());
    assert_ne!(before.id, after.id, "delete-insert must change the identity");
    assert_eq!(after.payload, b"second".to_vec());
}

#[tokio::test]
async fn every_strategy_upholds_key_uniqueness() {
    for strategy in [
        UpsertStrategy::Sequential,
        UpsertStrategy::InterleavedReads,
        UpsertStrategy::ConcurrentReads,
    ] {
        let (engine, bridge) = harness();
        let repo =
            GridCellRepository::with_config(bridge, strategy, ConflictAction::Replace);

        repo.upsert(&[
            Cell::new(0, 0, b"a".to_vec()),
            Cell::new(0, 1, b"b".to_vec()),
            Cell::new(1, 0, b"c".to_vec()),
        ])
        .await
        .expect("first batch should commit");
        repo.upsert(&[
            Cell::new(0, 1, b"b2".to_vec()),
            Cell::new(2, 2, b"d".to_vec()),
        ])
        .await
        .expect("second batch should commit");

        assert_eq!(
            engine.row_count(CELLS_TABLE),
            4,
            "strategy {strategy:?} must keep one record per key"
        );
        let updated = single_record_at(&repo, 0, 1).await;
        assert_eq!(updated.payload, b"b2".to_vec());
    }
}

#[tokio::test]
async fn failed_batch_leaves_no_partial_writes() {
    let (engine, bridge) = harness();
    let repo = GridCellRepository::new(bridge);

    engine.inject_write_failure_after(5);

    let batch: Vec<Cell> = (0..10).map(|i| Cell::new(i, 0, vec![i as u8])).collect();
    let err = repo
        .upsert(&batch)
        .await
        .expect_err("mid-batch failure must fail the whole batch");
    assert!(matches!(err, StoreError::Aborted(_)));
    assert_eq!(
        engine.row_count(CELLS_TABLE),
        0,
        "no write of the failed batch may be visible"
    );
}

#[tokio::test]
async fn large_batch_commits_as_one_transaction() {
    let (engine, bridge) = harness();
    let repo = GridCellRepository::new(bridge.clone());

    let batch: Vec<Cell> = (0..10_000)
        .map(|i| Cell::new(i / 100, i % 100, i.to_le_bytes().to_vec()))
        .collect();
    repo.upsert(&batch).await.expect("batch should commit");

    assert_eq!(engine.row_count(CELLS_TABLE), 10_000);

    // Every record must be individually retrievable by its composite key.
    let txn = bridge
        .begin(&[CELLS_TABLE], TxnMode::ReadOnly)
        .await
        .expect("lookup transaction should start");
    for i in 0..10_000i64 {
        let found = repo
            .find_by_row_col_in(&txn, &CellLookup::at(i / 100, i % 100))
            .await
            .expect("lookup should succeed");
        assert_eq!(found.len(), 1, "expected one record at ({}, {})", i / 100, i % 100);
        assert_eq!(found[0].payload, i.to_le_bytes().to_vec());
    }
}

#[tokio::test]
async fn mixed_batch_inserts_and_replaces() {
    let (engine, bridge) = harness();
    let repo = GridCellRepository::new(bridge);

    repo.upsert(&[Cell::new(0, 0, b"old".to_vec())])
        .await
        .expect("seed insert should commit");
    let seeded = single_record_at(&repo, 0, 0).await;

    repo.upsert(&[
        Cell::new(0, 0, b"new".to_vec()),
        Cell::new(5, 5, b"fresh".to_vec()),
    ])
    .await
    .expect("mixed batch should commit");

    assert_eq!(engine.row_count(CELLS_TABLE), 2);
    let replaced = single_record_at(&repo, 0, 0).await;
    assert_eq!(replaced.payload, b"new".to_vec());
    assert_eq!(replaced.id, seeded.id);
    let inserted = single_record_at(&repo, 5, 5).await;
    assert_eq!(inserted.payload, b"fresh".to_vec());
}

#[tokio::test]
async fn empty_batch_is_a_no_op() {
    let (engine, bridge) = harness();
    let repo = GridCellRepository::new(bridge);

    repo.upsert(&[]).await.expect("empty batch should succeed");
    assert_eq!(engine.open_handle_count(), 0, "no session should be opened");
}
