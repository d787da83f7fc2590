use gridstore_core::{
    Cell, ConnectionManager, MemoryEngine, StoreError, TransactionBridge, TxnMode, CELLS_TABLE,
};
use std::sync::Arc;

fn harness() -> (MemoryEngine, Arc<ConnectionManager>) {
    let engine = MemoryEngine::new();
    let manager = Arc::new(ConnectionManager::new(Arc::new(engine.clone())));
    (engine, manager)
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_acquires_yield_exactly_one_session() {
    let (engine, manager) = harness();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move { manager.acquire().await }));
    }
    for task in tasks {
        task.await
            .expect("task should not panic")
            .expect("every acquire should succeed");
    }

    assert_eq!(
        engine.open_handle_count(),
        1,
        "duplicate sessions must be closed, not leaked"
    );
}

#[tokio::test]
async fn invalidated_session_is_detected_on_next_acquire() {
    let (engine, manager) = harness();

    let first = manager.acquire().await.expect("first acquire should open");
    engine.invalidate_sessions();
    assert!(!first.is_open(), "liveness must reflect engine state");

    let second = manager.acquire().await.expect("acquire should reopen");
    assert!(second.is_open());
    assert_eq!(engine.open_handle_count(), 1);
}

#[tokio::test]
async fn begin_reopens_after_engine_side_disconnect() {
    let (engine, manager) = harness();
    let bridge = TransactionBridge::new(manager.clone());

    manager.acquire().await.expect("warm up the session");
    engine.invalidate_sessions();

    let txn = bridge
        .begin(&[CELLS_TABLE], TxnMode::ReadOnly)
        .await
        .expect("begin should transparently reopen the session");
    drop(txn);
    assert_eq!(engine.open_handle_count(), 1);
}

#[tokio::test]
async fn unknown_table_fails_begin_as_aborted() {
    let (_engine, manager) = harness();
    let bridge = TransactionBridge::new(manager);

    // Failure class must not depend on which begin attempt hits it.
    let err = bridge
        .begin(&["ledger"], TxnMode::ReadOnly)
        .await
        .expect_err("unknown table must be rejected");
    assert!(matches!(err, StoreError::Aborted(_)));
}

#[tokio::test]
async fn mid_transaction_invalidation_heals_the_session() {
    let (engine, manager) = harness();
    let bridge = TransactionBridge::new(manager.clone());

    let txn = bridge
        .begin(&[CELLS_TABLE], TxnMode::ReadWrite)
        .await
        .expect("begin should succeed");
    let store = txn.store(CELLS_TABLE).expect("store should resolve");

    engine.invalidate_sessions();
    let err = bridge
        .await_request(store.add(Cell::new(0, 0, b"doomed".to_vec())))
        .await
        .expect_err("write on an invalidated session must fail");
    assert!(matches!(err, StoreError::SessionInvalid));
    drop(store);
    drop(txn);

    // The stale handle was torn down, so the next acquire opens fresh
    // instead of failing identically until process restart.
    let session = manager.acquire().await.expect("acquire should reopen");
    assert!(session.is_open());
    assert_eq!(engine.open_handle_count(), 1);
}
