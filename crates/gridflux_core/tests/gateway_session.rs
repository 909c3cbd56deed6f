use gridflux_core::{
    BatchConfig, CellValue, GridError, GridSession, MemoryStore, MutationSubmitter, RecordStore,
    StoreExecutor,
};
use gridflux_test_support::FaultyStore;
use gridflux_test_support::fixtures::{
    gateway_over, immediate_queue, memory_gateway, open_gateway, owner, rename_table, stranger,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn owners_round_trip_changes_through_the_gateway() {
    let (store, gateway) = memory_gateway();
    let table = gateway.create_table(&owner(), "  Orders ").await.unwrap();
    assert_eq!(table.name, "Orders");

    let caller = gateway.for_caller(owner());
    let snapshot = caller.snapshot(table.id).await.unwrap();
    assert_eq!(snapshot.views.len(), 1);

    let submitter: Arc<dyn MutationSubmitter> = Arc::new(caller);
    // Long interval: only `close` flushes.
    let config = BatchConfig {
        flush_interval_ms: 3_600_000,
    };
    let session = GridSession::open(&snapshot, submitter, &config).unwrap();

    let row = session.add_row().await.unwrap();
    let column = session
        .add_column("Customer", gridflux_core::ColumnType::Text)
        .await
        .unwrap();
    session.update_cell(row, column, "Acme").unwrap();
    session.rename_table("Orders 2024").await.unwrap();

    assert_eq!(session.close().await.unwrap(), 1);
    gateway.queue().wait_idle().await;

    let stored = gateway.snapshot(&owner(), table.id).await.unwrap();
    assert_eq!(stored.table.name, "Orders 2024");
    assert_eq!(stored.rows.len(), 1);
    assert_eq!(stored.cells.len(), 1);
    assert_eq!(
        store.cells(table.id).await.unwrap()[0].value,
        CellValue::from("Acme")
    );
}

#[tokio::test]
async fn a_session_without_access_keeps_nothing() {
    let (store, gateway) = memory_gateway();
    let table = gateway.create_table(&owner(), "Private").await.unwrap();
    let snapshot = gateway.snapshot(&owner(), table.id).await.unwrap();

    let submitter: Arc<dyn MutationSubmitter> = Arc::new(gateway.for_caller(stranger()));
    let session = GridSession::open(&snapshot, submitter, &BatchConfig::default()).unwrap();

    let result = session.add_row().await;

    assert!(matches!(result, Err(GridError::Unauthorized(id)) if id == table.id));
    assert_eq!(session.with_state(|state| state.rows().count()), 0);
    assert_eq!(session.in_flight(), 0);
    assert!(store.rows(table.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn strangers_cannot_read_or_write() {
    let (_store, gateway) = memory_gateway();
    let table = gateway.create_table(&owner(), "Private").await.unwrap();

    assert!(matches!(
        gateway.snapshot(&stranger(), table.id).await,
        Err(GridError::Unauthorized(_))
    ));
    assert!(gateway.tables(&stranger()).await.unwrap().is_empty());

    let mutation = rename_table(table.id, "Mine now");
    assert!(gateway.submit(&stranger(), mutation).await.is_err());
    assert_eq!(gateway.queue().pending(table.id), 0);
}

#[tokio::test(start_paused = true)]
async fn an_open_gateway_queues_behind_a_slow_store() {
    let memory = Arc::new(MemoryStore::new());
    let faulty = FaultyStore::new(memory.clone());
    faulty.delay("rename_table", Duration::from_millis(500));
    let executor = Arc::new(StoreExecutor::new(Arc::new(faulty.clone())));
    let gateway = open_gateway(memory.clone(), immediate_queue(executor));

    let table = gateway.create_table(&owner(), "Shared").await.unwrap();
    let first = gateway
        .submit(&stranger(), rename_table(table.id, "First"))
        .await
        .unwrap();
    let second = gateway
        .submit(&stranger(), rename_table(table.id, "Second"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(gateway.queue().pending(table.id), 2);

    assert!(first.settled().await.is_ok());
    assert!(second.settled().await.is_ok());
    assert_eq!(faulty.call_count("rename_table"), 2);
    assert_eq!(
        memory.table(table.id).await.unwrap().unwrap().name,
        "Second"
    );
}

#[tokio::test]
async fn a_store_outage_during_the_access_check_is_not_a_rejection() {
    let memory = Arc::new(MemoryStore::new());
    let faulty = FaultyStore::new(memory.clone());
    let gateway = gateway_over(Arc::new(faulty.clone()));
    let table = gateway.create_table(&owner(), "Flaky").await.unwrap();
    faulty.fail_always("table");

    let result = gateway.submit(&owner(), rename_table(table.id, "Later")).await;

    assert!(matches!(&result, Err(GridError::Storage(_))));
    assert!(matches!(&result, Err(error) if !error.is_rejection()));
    assert_eq!(gateway.queue().pending(table.id), 0);
}
