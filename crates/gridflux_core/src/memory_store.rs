use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::{
    CallerId, Cell, Column, ColumnId, ColumnType, GridError, NewView, RecordStore, Row, RowId,
    Table, TableId, View, ViewId, ViewPatch,
};

#[derive(Default)]
struct MemoryState {
    tables: IndexMap<TableId, Table>,
    rows: IndexMap<RowId, Row>,
    columns: IndexMap<ColumnId, Column>,
    cells: IndexMap<(RowId, ColumnId), Cell>,
    views: IndexMap<ViewId, View>,
}

/// In-process `RecordStore`.
///
/// Enforces the same referential rules as the SQLite store: a row, column or
/// table that is still referenced cannot be deleted.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poison_error) => poison_error.into_inner(),
        }
    }

    pub fn cell_count(&self) -> usize {
        self.lock().cells.len()
    }
}

fn still_referenced(what: &str, count: usize) -> GridError {
    GridError::storage(format!("{what} is still referenced by {count} record(s)"))
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn create_table(&self, owner: &CallerId, name: &str) -> Result<Table, GridError> {
        let table = Table {
            id: TableId::new(),
            owner: owner.clone(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        self.lock().tables.insert(table.id, table.clone());
        Ok(table)
    }

    async fn table(&self, id: TableId) -> Result<Option<Table>, GridError> {
        Ok(self.lock().tables.get(&id).cloned())
    }

    async fn tables_for_owner(&self, owner: &CallerId) -> Result<Vec<Table>, GridError> {
        Ok(self
            .lock()
            .tables
            .values()
            .filter(|table| &table.owner == owner)
            .cloned()
            .collect())
    }

    async fn rename_table(&self, id: TableId, name: &str) -> Result<bool, GridError> {
        Ok(match self.lock().tables.get_mut(&id) {
            Some(table) => {
                table.name = name.to_string();
                true
            }
            None => false,
        })
    }

    async fn delete_table(&self, id: TableId) -> Result<bool, GridError> {
        let mut state = self.lock();

        let dependents = state.rows.values().filter(|r| r.table_id == id).count()
            + state.columns.values().filter(|c| c.table_id == id).count()
            + state.views.values().filter(|v| v.table_id == id).count();
        if dependents > 0 {
            return Err(still_referenced("table", dependents));
        }

        Ok(state.tables.shift_remove(&id).is_some())
    }

    async fn create_row(&self, table_id: TableId, order: i64) -> Result<Row, GridError> {
        let mut state = self.lock();
        if !state.tables.contains_key(&table_id) {
            return Err(GridError::storage(format!("table {table_id} does not exist")));
        }

        let row = Row {
            id: RowId::new(),
            table_id,
            order,
        };
        state.rows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn row(&self, id: RowId) -> Result<Option<Row>, GridError> {
        Ok(self.lock().rows.get(&id).cloned())
    }

    async fn rows(&self, table_id: TableId) -> Result<Vec<Row>, GridError> {
        let mut rows: Vec<Row> = self
            .lock()
            .rows
            .values()
            .filter(|row| row.table_id == table_id)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.order);
        Ok(rows)
    }

    async fn delete_row(&self, table_id: TableId, id: RowId) -> Result<bool, GridError> {
        let mut state = self.lock();

        let referencing = state.cells.keys().filter(|(row, _)| *row == id).count();
        if referencing > 0 {
            return Err(still_referenced("row", referencing));
        }

        match state.rows.get(&id) {
            Some(row) if row.table_id == table_id => Ok(state.rows.shift_remove(&id).is_some()),
            _ => Ok(false),
        }
    }

    async fn delete_rows(&self, table_id: TableId) -> Result<u64, GridError> {
        let mut state = self.lock();

        let ids: Vec<RowId> = state
            .rows
            .values()
            .filter(|row| row.table_id == table_id)
            .map(|row| row.id)
            .collect();
        let referencing = state
            .cells
            .keys()
            .filter(|(row, _)| ids.contains(row))
            .count();
        if referencing > 0 {
            return Err(still_referenced("rows", referencing));
        }

        state.rows.retain(|_, row| row.table_id != table_id);
        Ok(ids.len() as u64)
    }

    async fn create_column(
        &self,
        table_id: TableId,
        label: &str,
        order: i64,
        column_type: ColumnType,
    ) -> Result<Column, GridError> {
        let mut state = self.lock();
        if !state.tables.contains_key(&table_id) {
            return Err(GridError::storage(format!("table {table_id} does not exist")));
        }

        let column = Column {
            id: ColumnId::new(),
            table_id,
            label: label.to_string(),
            order,
            column_type,
        };
        state.columns.insert(column.id, column.clone());
        Ok(column)
    }

    async fn column(&self, id: ColumnId) -> Result<Option<Column>, GridError> {
        Ok(self.lock().columns.get(&id).cloned())
    }

    async fn columns(&self, table_id: TableId) -> Result<Vec<Column>, GridError> {
        let mut columns: Vec<Column> = self
            .lock()
            .columns
            .values()
            .filter(|column| column.table_id == table_id)
            .cloned()
            .collect();
        columns.sort_by_key(|column| column.order);
        Ok(columns)
    }

    async fn rename_column(
        &self,
        table_id: TableId,
        id: ColumnId,
        label: &str,
    ) -> Result<bool, GridError> {
        Ok(match self.lock().columns.get_mut(&id) {
            Some(column) if column.table_id == table_id => {
                column.label = label.to_string();
                true
            }
            _ => false,
        })
    }

    async fn delete_column(&self, table_id: TableId, id: ColumnId) -> Result<bool, GridError> {
        let mut state = self.lock();

        let referencing = state
            .cells
            .keys()
            .filter(|(_, column)| *column == id)
            .count();
        if referencing > 0 {
            return Err(still_referenced("column", referencing));
        }

        match state.columns.get(&id) {
            Some(column) if column.table_id == table_id => {
                Ok(state.columns.shift_remove(&id).is_some())
            }
            _ => Ok(false),
        }
    }

    async fn delete_columns(&self, table_id: TableId) -> Result<u64, GridError> {
        let mut state = self.lock();

        let ids: Vec<ColumnId> = state
            .columns
            .values()
            .filter(|column| column.table_id == table_id)
            .map(|column| column.id)
            .collect();
        let referencing = state
            .cells
            .keys()
            .filter(|(_, column)| ids.contains(column))
            .count();
        if referencing > 0 {
            return Err(still_referenced("columns", referencing));
        }

        state.columns.retain(|_, column| column.table_id != table_id);
        Ok(ids.len() as u64)
    }

    async fn upsert_cells(&self, table_id: TableId, cells: &[Cell]) -> Result<usize, GridError> {
        let mut state = self.lock();
        let mut written = 0;

        for cell in cells {
            let row_ok = state
                .rows
                .get(&cell.row_id)
                .is_some_and(|row| row.table_id == table_id);
            let column_ok = state
                .columns
                .get(&cell.column_id)
                .is_some_and(|column| column.table_id == table_id);

            if row_ok && column_ok {
                state.cells.insert(cell.key(), cell.clone());
                written += 1;
            }
        }

        Ok(written)
    }

    async fn cells(&self, table_id: TableId) -> Result<Vec<Cell>, GridError> {
        let state = self.lock();
        Ok(state
            .cells
            .values()
            .filter(|cell| {
                state
                    .rows
                    .get(&cell.row_id)
                    .is_some_and(|row| row.table_id == table_id)
            })
            .cloned()
            .collect())
    }

    async fn delete_cells_for_row(&self, row_id: RowId) -> Result<u64, GridError> {
        let mut state = self.lock();
        let before = state.cells.len();
        state.cells.retain(|(row, _), _| *row != row_id);
        Ok((before - state.cells.len()) as u64)
    }

    async fn delete_cells_for_column(&self, column_id: ColumnId) -> Result<u64, GridError> {
        let mut state = self.lock();
        let before = state.cells.len();
        state.cells.retain(|(_, column), _| *column != column_id);
        Ok((before - state.cells.len()) as u64)
    }

    async fn delete_cells(&self, table_id: TableId) -> Result<u64, GridError> {
        let mut state = self.lock();
        let before = state.cells.len();

        let MemoryState { rows, cells, .. } = &mut *state;
        cells.retain(|(row, _), _| rows.get(row).is_none_or(|r| r.table_id != table_id));

        Ok((before - state.cells.len()) as u64)
    }

    async fn create_view(&self, table_id: TableId, view: &NewView) -> Result<View, GridError> {
        let mut state = self.lock();
        if !state.tables.contains_key(&table_id) {
            return Err(GridError::storage(format!("table {table_id} does not exist")));
        }

        let view = View {
            id: ViewId::new(),
            table_id,
            name: view.name.clone(),
            config: view.config.clone(),
            is_default: view.is_default,
            created_at: Utc::now(),
        };
        state.views.insert(view.id, view.clone());
        Ok(view)
    }

    async fn view(&self, id: ViewId) -> Result<Option<View>, GridError> {
        Ok(self.lock().views.get(&id).cloned())
    }

    async fn views(&self, table_id: TableId) -> Result<Vec<View>, GridError> {
        Ok(self
            .lock()
            .views
            .values()
            .filter(|view| view.table_id == table_id)
            .cloned()
            .collect())
    }

    async fn update_view(&self, id: ViewId, patch: &ViewPatch) -> Result<bool, GridError> {
        Ok(match self.lock().views.get_mut(&id) {
            Some(view) => {
                patch.apply_to(view);
                true
            }
            None => false,
        })
    }

    async fn clear_default_views(&self, table_id: TableId) -> Result<u64, GridError> {
        let mut cleared = 0;
        for view in self.lock().views.values_mut() {
            if view.table_id == table_id && view.is_default {
                view.is_default = false;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn promote_default(
        &self,
        table_id: TableId,
        exclude: ViewId,
    ) -> Result<Option<ViewId>, GridError> {
        let mut state = self.lock();

        let promoted = state
            .views
            .values()
            .find(|view| view.table_id == table_id && view.id != exclude)
            .map(|view| view.id);
        for view in state.views.values_mut() {
            if view.table_id == table_id {
                view.is_default = Some(view.id) == promoted;
            }
        }

        Ok(promoted)
    }

    async fn delete_view(&self, id: ViewId) -> Result<bool, GridError> {
        Ok(self.lock().views.shift_remove(&id).is_some())
    }

    async fn delete_views(&self, table_id: TableId) -> Result<u64, GridError> {
        let mut state = self.lock();
        let before = state.views.len();
        state.views.retain(|_, view| view.table_id != table_id);
        Ok((before - state.views.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn table_with_cell(store: &MemoryStore) -> (TableId, RowId, ColumnId) {
        let table = store
            .create_table(&CallerId::new("owner"), "Leads")
            .await
            .unwrap();
        let row = store.create_row(table.id, 0).await.unwrap();
        let column = store
            .create_column(table.id, "Name", 0, ColumnType::Text)
            .await
            .unwrap();
        store
            .upsert_cells(table.id, &[Cell::new(row.id, column.id, "Ada")])
            .await
            .unwrap();
        (table.id, row.id, column.id)
    }

    #[tokio::test]
    async fn refuses_to_delete_referenced_row() {
        let store = MemoryStore::new();
        let (table_id, row_id, _) = table_with_cell(&store).await;

        assert!(store.delete_row(table_id, row_id).await.is_err());

        store.delete_cells_for_row(row_id).await.unwrap();
        assert!(store.delete_row(table_id, row_id).await.unwrap());
        assert!(!store.delete_row(table_id, row_id).await.unwrap());
    }

    #[tokio::test]
    async fn skips_cells_for_missing_targets() {
        let store = MemoryStore::new();
        let (table_id, row_id, _) = table_with_cell(&store).await;

        let written = store
            .upsert_cells(table_id, &[Cell::new(row_id, ColumnId::new(), "orphan")])
            .await
            .unwrap();

        assert_eq!(written, 0);
        assert_eq!(store.cell_count(), 1);
    }

    #[tokio::test]
    async fn rows_come_back_in_display_order() {
        let store = MemoryStore::new();
        let table = store
            .create_table(&CallerId::new("owner"), "Leads")
            .await
            .unwrap();
        store.create_row(table.id, 20).await.unwrap();
        store.create_row(table.id, 5).await.unwrap();
        store.create_row(table.id, 10).await.unwrap();

        let orders: Vec<i64> = store
            .rows(table.id)
            .await
            .unwrap()
            .iter()
            .map(|row| row.order)
            .collect();

        assert_eq!(orders, vec![5, 10, 20]);
    }
}
