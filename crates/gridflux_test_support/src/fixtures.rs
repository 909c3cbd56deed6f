use gridflux_core::{
    AllowAll, CallerId, CellChange, CellValue, ColumnId, ColumnType, DEFAULT_VIEW_NAME, GridError,
    MemoryStore, Mutation, MutationExecutor, MutationGateway, NewView, OptimisticId, OwnerAccess,
    QueueConfig, QueueManager, RecordStore, RowId, StoreExecutor, TableId, TableSnapshot, Target,
    ViewConfig,
};
use std::sync::Arc;

pub fn owner() -> CallerId {
    CallerId::new("owner@example.com")
}

pub fn stranger() -> CallerId {
    CallerId::new("stranger@example.com")
}

/// Queue that retries without sleeping.
pub fn immediate_queue(executor: Arc<dyn MutationExecutor>) -> QueueManager {
    match QueueManager::new(executor, QueueConfig::immediate()) {
        Ok(queue) => queue,
        Err(error) => panic!("fixtures must run inside a tokio runtime: {error}"),
    }
}

/// Gateway over an owner-checked store, executing through `StoreExecutor`.
pub fn gateway_over(store: Arc<dyn RecordStore>) -> Arc<MutationGateway> {
    let executor = Arc::new(StoreExecutor::new(store.clone()));
    let access = Arc::new(OwnerAccess::new(store.clone()));
    Arc::new(MutationGateway::new(store, access, immediate_queue(executor)))
}

pub fn memory_gateway() -> (Arc<MemoryStore>, Arc<MutationGateway>) {
    let store = Arc::new(MemoryStore::new());
    let gateway = gateway_over(store.clone());
    (store, gateway)
}

/// Gateway that accepts any caller, for tests not about access control.
pub fn open_gateway(store: Arc<dyn RecordStore>, queue: QueueManager) -> Arc<MutationGateway> {
    Arc::new(MutationGateway::new(store, Arc::new(AllowAll), queue))
}

/// Creates a table with the given text columns and `rows` empty rows,
/// written straight to the store, and returns what a client would load.
pub async fn seed_table(
    store: &dyn RecordStore,
    owner: &CallerId,
    columns: &[&str],
    rows: usize,
) -> Result<TableSnapshot, GridError> {
    let table = store.create_table(owner, "Fixture").await?;
    let view = NewView {
        name: DEFAULT_VIEW_NAME.to_string(),
        config: ViewConfig::default(),
        is_default: true,
    };
    store.create_view(table.id, &view).await?;

    for (order, label) in columns.iter().enumerate() {
        store
            .create_column(table.id, label, order as i64, ColumnType::Text)
            .await?;
    }
    for order in 0..rows {
        store.create_row(table.id, order as i64).await?;
    }

    snapshot(store, table.id).await
}

/// Reads a table back without access checks.
pub async fn snapshot(
    store: &dyn RecordStore,
    table_id: TableId,
) -> Result<TableSnapshot, GridError> {
    let table = store
        .table(table_id)
        .await?
        .ok_or_else(|| GridError::NotFound(format!("table {table_id}")))?;

    Ok(TableSnapshot {
        table,
        columns: store.columns(table_id).await?,
        rows: store.rows(table_id).await?,
        cells: store.cells(table_id).await?,
        views: store.views(table_id).await?,
    })
}

pub fn add_row(table_id: TableId, order: i64) -> Mutation {
    Mutation::AddRow {
        table_id,
        optimistic_id: OptimisticId::new(),
        order,
    }
}

pub fn rename_table(table_id: TableId, name: &str) -> Mutation {
    Mutation::RenameTable {
        table_id,
        name: name.to_string(),
    }
}

pub fn cell_change(row: RowId, column: ColumnId, value: impl Into<CellValue>) -> CellChange {
    CellChange {
        row: Target::Id(row),
        column: Target::Id(column),
        value: value.into(),
    }
}
