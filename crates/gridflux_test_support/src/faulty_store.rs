use async_trait::async_trait;
use gridflux_core::{
    CallerId, Cell, Column, ColumnId, ColumnType, GridError, NewView, RecordStore, Row, RowId,
    Table, TableId, View, ViewId, ViewPatch,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct FaultyStoreStats {
    /// Store method names in call order.
    pub calls: Vec<String>,
    pub injected_failures: usize,
}

#[derive(Default)]
struct FaultState {
    calls: Vec<String>,
    fail_next: HashMap<String, usize>,
    fail_always: HashSet<String>,
    delays: HashMap<String, Duration>,
    injected_failures: usize,
}

/// Wraps a real store and injects failures or delays per method.
///
/// Operations are named after the `RecordStore` method they intercept,
/// e.g. `"create_row"` or `"delete_cells_for_row"`.
#[derive(Clone)]
pub struct FaultyStore {
    inner: Arc<dyn RecordStore>,
    state: Arc<Mutex<FaultState>>,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn RecordStore>) -> Self {
        Self {
            inner,
            state: Arc::new(Mutex::new(FaultState::default())),
        }
    }

    /// The next `times` calls of `op` fail, then it recovers.
    pub fn fail_next(&self, op: &str, times: usize) {
        *mutex_lock(&self.state)
            .fail_next
            .entry(op.to_string())
            .or_default() += times;
    }

    pub fn fail_always(&self, op: &str) {
        mutex_lock(&self.state).fail_always.insert(op.to_string());
    }

    pub fn heal(&self, op: &str) {
        let mut state = mutex_lock(&self.state);
        state.fail_always.remove(op);
        state.fail_next.remove(op);
    }

    pub fn delay(&self, op: &str, duration: Duration) {
        mutex_lock(&self.state)
            .delays
            .insert(op.to_string(), duration);
    }

    pub fn stats(&self) -> FaultyStoreStats {
        let state = mutex_lock(&self.state);
        FaultyStoreStats {
            calls: state.calls.clone(),
            injected_failures: state.injected_failures,
        }
    }

    pub fn call_count(&self, op: &str) -> usize {
        mutex_lock(&self.state)
            .calls
            .iter()
            .filter(|call| call.as_str() == op)
            .count()
    }

    async fn intercept(&self, op: &str) -> Result<(), GridError> {
        let delay = {
            let mut state = mutex_lock(&self.state);
            state.calls.push(op.to_string());
            state.delays.get(op).copied()
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = mutex_lock(&self.state);
        let scheduled = match state.fail_next.get_mut(op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };

        if scheduled || state.fail_always.contains(op) {
            state.injected_failures += 1;
            return Err(GridError::storage(format!("injected failure in {op}")));
        }

        Ok(())
    }
}

#[async_trait]
impl RecordStore for FaultyStore {
    async fn create_table(&self, owner: &CallerId, name: &str) -> Result<Table, GridError> {
        self.intercept("create_table").await?;
        self.inner.create_table(owner, name).await
    }

    async fn table(&self, id: TableId) -> Result<Option<Table>, GridError> {
        self.intercept("table").await?;
        self.inner.table(id).await
    }

    async fn tables_for_owner(&self, owner: &CallerId) -> Result<Vec<Table>, GridError> {
        self.intercept("tables_for_owner").await?;
        self.inner.tables_for_owner(owner).await
    }

    async fn rename_table(&self, id: TableId, name: &str) -> Result<bool, GridError> {
        self.intercept("rename_table").await?;
        self.inner.rename_table(id, name).await
    }

    async fn delete_table(&self, id: TableId) -> Result<bool, GridError> {
        self.intercept("delete_table").await?;
        self.inner.delete_table(id).await
    }

    async fn create_row(&self, table_id: TableId, order: i64) -> Result<Row, GridError> {
        self.intercept("create_row").await?;
        self.inner.create_row(table_id, order).await
    }

    async fn row(&self, id: RowId) -> Result<Option<Row>, GridError> {
        self.intercept("row").await?;
        self.inner.row(id).await
    }

    async fn rows(&self, table_id: TableId) -> Result<Vec<Row>, GridError> {
        self.intercept("rows").await?;
        self.inner.rows(table_id).await
    }

    async fn delete_row(&self, table_id: TableId, id: RowId) -> Result<bool, GridError> {
        self.intercept("delete_row").await?;
        self.inner.delete_row(table_id, id).await
    }

    async fn delete_rows(&self, table_id: TableId) -> Result<u64, GridError> {
        self.intercept("delete_rows").await?;
        self.inner.delete_rows(table_id).await
    }

    async fn create_column(
        &self,
        table_id: TableId,
        label: &str,
        order: i64,
        column_type: ColumnType,
    ) -> Result<Column, GridError> {
        self.intercept("create_column").await?;
        self.inner
            .create_column(table_id, label, order, column_type)
            .await
    }

    async fn column(&self, id: ColumnId) -> Result<Option<Column>, GridError> {
        self.intercept("column").await?;
        self.inner.column(id).await
    }

    async fn columns(&self, table_id: TableId) -> Result<Vec<Column>, GridError> {
        self.intercept("columns").await?;
        self.inner.columns(table_id).await
    }

    async fn rename_column(
        &self,
        table_id: TableId,
        id: ColumnId,
        label: &str,
    ) -> Result<bool, GridError> {
        self.intercept("rename_column").await?;
        self.inner.rename_column(table_id, id, label).await
    }

    async fn delete_column(&self, table_id: TableId, id: ColumnId) -> Result<bool, GridError> {
        self.intercept("delete_column").await?;
        self.inner.delete_column(table_id, id).await
    }

    async fn delete_columns(&self, table_id: TableId) -> Result<u64, GridError> {
        self.intercept("delete_columns").await?;
        self.inner.delete_columns(table_id).await
    }

    async fn upsert_cells(&self, table_id: TableId, cells: &[Cell]) -> Result<usize, GridError> {
        self.intercept("upsert_cells").await?;
        self.inner.upsert_cells(table_id, cells).await
    }

    async fn cells(&self, table_id: TableId) -> Result<Vec<Cell>, GridError> {
        self.intercept("cells").await?;
        self.inner.cells(table_id).await
    }

    async fn delete_cells_for_row(&self, row_id: RowId) -> Result<u64, GridError> {
        self.intercept("delete_cells_for_row").await?;
        self.inner.delete_cells_for_row(row_id).await
    }

    async fn delete_cells_for_column(&self, column_id: ColumnId) -> Result<u64, GridError> {
        self.intercept("delete_cells_for_column").await?;
        self.inner.delete_cells_for_column(column_id).await
    }

    async fn delete_cells(&self, table_id: TableId) -> Result<u64, GridError> {
        self.intercept("delete_cells").await?;
        self.inner.delete_cells(table_id).await
    }

    async fn create_view(&self, table_id: TableId, view: &NewView) -> Result<View, GridError> {
        self.intercept("create_view").await?;
        self.inner.create_view(table_id, view).await
    }

    async fn view(&self, id: ViewId) -> Result<Option<View>, GridError> {
        self.intercept("view").await?;
        self.inner.view(id).await
    }

    async fn views(&self, table_id: TableId) -> Result<Vec<View>, GridError> {
        self.intercept("views").await?;
        self.inner.views(table_id).await
    }

    async fn update_view(&self, id: ViewId, patch: &ViewPatch) -> Result<bool, GridError> {
        self.intercept("update_view").await?;
        self.inner.update_view(id, patch).await
    }

    async fn clear_default_views(&self, table_id: TableId) -> Result<u64, GridError> {
        self.intercept("clear_default_views").await?;
        self.inner.clear_default_views(table_id).await
    }

    async fn promote_default(
        &self,
        table_id: TableId,
        exclude: ViewId,
    ) -> Result<Option<ViewId>, GridError> {
        self.intercept("promote_default").await?;
        self.inner.promote_default(table_id, exclude).await
    }

    async fn delete_view(&self, id: ViewId) -> Result<bool, GridError> {
        self.intercept("delete_view").await?;
        self.inner.delete_view(id).await
    }

    async fn delete_views(&self, table_id: TableId) -> Result<u64, GridError> {
        self.intercept("delete_views").await?;
        self.inner.delete_views(table_id).await
    }
}

fn mutex_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poison_error) => poison_error.into_inner(),
    }
}
