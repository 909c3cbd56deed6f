use async_trait::async_trait;

use crate::{
    CallerId, Cell, Column, ColumnId, ColumnType, GridError, NewView, Row, RowId, Table, TableId,
    View, ViewId, ViewPatch,
};

/// Durable record store the executor applies mutations against.
///
/// Deletes report whether anything was removed and never fail because the
/// target is already gone. Dependent records are not cascaded: callers delete
/// cells before rows/columns, and rows/columns/views before their table.
#[async_trait]
pub trait RecordStore: Send + Sync {
    // === Tables ===

    async fn create_table(&self, owner: &CallerId, name: &str) -> Result<Table, GridError>;

    async fn table(&self, id: TableId) -> Result<Option<Table>, GridError>;

    async fn tables_for_owner(&self, owner: &CallerId) -> Result<Vec<Table>, GridError>;

    async fn rename_table(&self, id: TableId, name: &str) -> Result<bool, GridError>;

    async fn delete_table(&self, id: TableId) -> Result<bool, GridError>;

    // === Rows ===

    async fn create_row(&self, table_id: TableId, order: i64) -> Result<Row, GridError>;

    async fn row(&self, id: RowId) -> Result<Option<Row>, GridError>;

    /// Rows of a table, `order` ascending.
    async fn rows(&self, table_id: TableId) -> Result<Vec<Row>, GridError>;

    async fn delete_row(&self, table_id: TableId, id: RowId) -> Result<bool, GridError>;

    async fn delete_rows(&self, table_id: TableId) -> Result<u64, GridError>;

    // === Columns ===

    async fn create_column(
        &self,
        table_id: TableId,
        label: &str,
        order: i64,
        column_type: ColumnType,
    ) -> Result<Column, GridError>;

    async fn column(&self, id: ColumnId) -> Result<Option<Column>, GridError>;

    /// Columns of a table, `order` ascending.
    async fn columns(&self, table_id: TableId) -> Result<Vec<Column>, GridError>;

    async fn rename_column(
        &self,
        table_id: TableId,
        id: ColumnId,
        label: &str,
    ) -> Result<bool, GridError>;

    async fn delete_column(&self, table_id: TableId, id: ColumnId) -> Result<bool, GridError>;

    async fn delete_columns(&self, table_id: TableId) -> Result<u64, GridError>;

    // === Cells ===

    /// Upserts each cell. Writes whose row or column is not part of the table
    /// are skipped; returns how many were written.
    async fn upsert_cells(&self, table_id: TableId, cells: &[Cell]) -> Result<usize, GridError>;

    async fn cells(&self, table_id: TableId) -> Result<Vec<Cell>, GridError>;

    async fn delete_cells_for_row(&self, row_id: RowId) -> Result<u64, GridError>;

    async fn delete_cells_for_column(&self, column_id: ColumnId) -> Result<u64, GridError>;

    async fn delete_cells(&self, table_id: TableId) -> Result<u64, GridError>;

    // === Views ===

    async fn create_view(&self, table_id: TableId, view: &NewView) -> Result<View, GridError>;

    async fn view(&self, id: ViewId) -> Result<Option<View>, GridError>;

    /// Views of a table in creation order.
    async fn views(&self, table_id: TableId) -> Result<Vec<View>, GridError>;

    async fn update_view(&self, id: ViewId, patch: &ViewPatch) -> Result<bool, GridError>;

    /// Sets `is_default = false` on every view of the table.
    async fn clear_default_views(&self, table_id: TableId) -> Result<u64, GridError>;

    /// Moves the default to the oldest view other than `exclude` in one atomic
    /// step. With no other view the table is left without a default.
    async fn promote_default(
        &self,
        table_id: TableId,
        exclude: ViewId,
    ) -> Result<Option<ViewId>, GridError>;

    async fn delete_view(&self, id: ViewId) -> Result<bool, GridError>;

    async fn delete_views(&self, table_id: TableId) -> Result<u64, GridError>;
}
