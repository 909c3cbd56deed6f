use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gridflux_core::{
    CallerId, Cell, CellValue, Column, ColumnId, ColumnType, GridError, NewView, RecordStore, Row,
    RowId, Table, TableId, View, ViewConfig, ViewId, ViewPatch,
};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::schema;

/// `RecordStore` backed by a single SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, GridError> {
        log::info!("[SQLITE] opening store at {}", path.display());
        let conn = Connection::open(path).map_err(storage_error)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, GridError> {
        let conn = Connection::open_in_memory().map_err(storage_error)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, GridError> {
        schema::initialize(&conn).map_err(storage_error)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, GridError> {
        self.conn
            .lock()
            .map_err(|e| GridError::Storage(format!("Lock error: {}", e)))
    }
}

fn storage_error(e: rusqlite::Error) -> GridError {
    log::error!("[SQLITE] {}", e);
    GridError::Storage(e.to_string())
}

fn parse_id<Id: From<Uuid>>(index: usize, value: String) -> rusqlite::Result<Id> {
    Uuid::parse_str(&value)
        .map(Id::from)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e)))
}

fn parse_timestamp(index: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e)))
}

fn table_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Table> {
    Ok(Table {
        id: parse_id(0, row.get(0)?)?,
        owner: CallerId::new(row.get::<_, String>(1)?),
        name: row.get(2)?,
        created_at: parse_timestamp(3, row.get(3)?)?,
    })
}

fn grid_row_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
    Ok(Row {
        id: parse_id(0, row.get(0)?)?,
        table_id: parse_id(1, row.get(1)?)?,
        order: row.get(2)?,
    })
}

fn column_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Column> {
    let column_type: String = row.get(4)?;
    Ok(Column {
        id: parse_id(0, row.get(0)?)?,
        table_id: parse_id(1, row.get(1)?)?,
        label: row.get(2)?,
        order: row.get(3)?,
        column_type: ColumnType::parse(&column_type).unwrap_or_default(),
    })
}

fn cell_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Cell> {
    let text: Option<String> = row.get(2)?;
    let number: Option<f64> = row.get(3)?;
    let value = match number {
        Some(number) => CellValue::Number(number),
        None => CellValue::Text(text.unwrap_or_default()),
    };

    Ok(Cell {
        row_id: parse_id(0, row.get(0)?)?,
        column_id: parse_id(1, row.get(1)?)?,
        value,
    })
}

fn view_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<View> {
    let config: String = row.get(3)?;
    let config: ViewConfig = serde_json::from_str(&config)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;

    Ok(View {
        id: parse_id(0, row.get(0)?)?,
        table_id: parse_id(1, row.get(1)?)?,
        name: row.get(2)?,
        config,
        is_default: row.get(4)?,
        created_at: parse_timestamp(5, row.get(5)?)?,
    })
}

fn cell_columns(value: &CellValue) -> (Option<&str>, Option<f64>) {
    match value {
        CellValue::Text(text) => (Some(text.as_str()), None),
        CellValue::Number(number) => (None, Some(*number)),
    }
}

fn encode_config(config: &ViewConfig) -> Result<String, GridError> {
    serde_json::to_string(config).map_err(|e| GridError::storage(format!("view config: {e}")))
}

const VIEW_COLUMNS: &str = "id, table_id, name, config, is_default, created_at";

#[async_trait]
impl RecordStore for SqliteStore {
    async fn create_table(&self, owner: &CallerId, name: &str) -> Result<Table, GridError> {
        let table = Table {
            id: TableId::new(),
            owner: owner.clone(),
            name: name.to_string(),
            created_at: Utc::now(),
        };

        self.conn()?
            .execute(
                "INSERT INTO grid_tables (id, owner, name, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    table.id.to_string(),
                    owner.as_str(),
                    table.name,
                    table.created_at.to_rfc3339()
                ],
            )
            .map_err(storage_error)?;

        Ok(table)
    }

    async fn table(&self, id: TableId) -> Result<Option<Table>, GridError> {
        self.conn()?
            .query_row(
                "SELECT id, owner, name, created_at FROM grid_tables WHERE id = ?1",
                params![id.to_string()],
                table_from_row,
            )
            .optional()
            .map_err(storage_error)
    }

    async fn tables_for_owner(&self, owner: &CallerId) -> Result<Vec<Table>, GridError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, owner, name, created_at FROM grid_tables WHERE owner = ?1 ORDER BY rowid",
            )
            .map_err(storage_error)?;

        stmt.query_map(params![owner.as_str()], table_from_row)
            .map_err(storage_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_error)
    }

    async fn rename_table(&self, id: TableId, name: &str) -> Result<bool, GridError> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE grid_tables SET name = ?2 WHERE id = ?1",
                params![id.to_string(), name],
            )
            .map_err(storage_error)?;
        Ok(changed > 0)
    }

    async fn delete_table(&self, id: TableId) -> Result<bool, GridError> {
        let changed = self
            .conn()?
            .execute("DELETE FROM grid_tables WHERE id = ?1", params![id.to_string()])
            .map_err(storage_error)?;
        Ok(changed > 0)
    }

    async fn create_row(&self, table_id: TableId, order: i64) -> Result<Row, GridError> {
        let row = Row {
            id: RowId::new(),
            table_id,
            order,
        };

        self.conn()?
            .execute(
                "INSERT INTO grid_rows (id, table_id, sort_order) VALUES (?1, ?2, ?3)",
                params![row.id.to_string(), table_id.to_string(), order],
            )
            .map_err(storage_error)?;

        Ok(row)
    }

    async fn row(&self, id: RowId) -> Result<Option<Row>, GridError> {
        self.conn()?
            .query_row(
                "SELECT id, table_id, sort_order FROM grid_rows WHERE id = ?1",
                params![id.to_string()],
                grid_row_from_row,
            )
            .optional()
            .map_err(storage_error)
    }

    async fn rows(&self, table_id: TableId) -> Result<Vec<Row>, GridError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, table_id, sort_order FROM grid_rows
                 WHERE table_id = ?1 ORDER BY sort_order ASC, rowid ASC",
            )
            .map_err(storage_error)?;

        stmt.query_map(params![table_id.to_string()], grid_row_from_row)
            .map_err(storage_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_error)
    }

    async fn delete_row(&self, table_id: TableId, id: RowId) -> Result<bool, GridError> {
        let changed = self
            .conn()?
            .execute(
                "DELETE FROM grid_rows WHERE id = ?1 AND table_id = ?2",
                params![id.to_string(), table_id.to_string()],
            )
            .map_err(storage_error)?;
        Ok(changed > 0)
    }

    async fn delete_rows(&self, table_id: TableId) -> Result<u64, GridError> {
        let changed = self
            .conn()?
            .execute(
                "DELETE FROM grid_rows WHERE table_id = ?1",
                params![table_id.to_string()],
            )
            .map_err(storage_error)?;
        Ok(changed as u64)
    }

    async fn create_column(
        &self,
        table_id: TableId,
        label: &str,
        order: i64,
        column_type: ColumnType,
    ) -> Result<Column, GridError> {
        let column = Column {
            id: ColumnId::new(),
            table_id,
            label: label.to_string(),
            order,
            column_type,
        };

        self.conn()?
            .execute(
                "INSERT INTO grid_columns (id, table_id, label, sort_order, column_type)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    column.id.to_string(),
                    table_id.to_string(),
                    label,
                    order,
                    column_type.as_str()
                ],
            )
            .map_err(storage_error)?;

        Ok(column)
    }

    async fn column(&self, id: ColumnId) -> Result<Option<Column>, GridError> {
        self.conn()?
            .query_row(
                "SELECT id, table_id, label, sort_order, column_type FROM grid_columns WHERE id = ?1",
                params![id.to_string()],
                column_from_row,
            )
            .optional()
            .map_err(storage_error)
    }

    async fn columns(&self, table_id: TableId) -> Result<Vec<Column>, GridError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, table_id, label, sort_order, column_type FROM grid_columns
                 WHERE table_id = ?1 ORDER BY sort_order ASC, rowid ASC",
            )
            .map_err(storage_error)?;

        stmt.query_map(params![table_id.to_string()], column_from_row)
            .map_err(storage_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_error)
    }

    async fn rename_column(
        &self,
        table_id: TableId,
        id: ColumnId,
        label: &str,
    ) -> Result<bool, GridError> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE grid_columns SET label = ?3 WHERE id = ?1 AND table_id = ?2",
                params![id.to_string(), table_id.to_string(), label],
            )
            .map_err(storage_error)?;
        Ok(changed > 0)
    }

    async fn delete_column(&self, table_id: TableId, id: ColumnId) -> Result<bool, GridError> {
        let changed = self
            .conn()?
            .execute(
                "DELETE FROM grid_columns WHERE id = ?1 AND table_id = ?2",
                params![id.to_string(), table_id.to_string()],
            )
            .map_err(storage_error)?;
        Ok(changed > 0)
    }

    async fn delete_columns(&self, table_id: TableId) -> Result<u64, GridError> {
        let changed = self
            .conn()?
            .execute(
                "DELETE FROM grid_columns WHERE table_id = ?1",
                params![table_id.to_string()],
            )
            .map_err(storage_error)?;
        Ok(changed as u64)
    }

    async fn upsert_cells(&self, table_id: TableId, cells: &[Cell]) -> Result<usize, GridError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage_error)?;
        let table = table_id.to_string();
        let mut written = 0;

        {
            // The WHERE clause skips writes whose row or column is gone.
            let mut stmt = tx
                .prepare(
                    "INSERT INTO grid_cells (row_id, column_id, table_id, text_value, number_value)
                     SELECT ?1, ?2, ?3, ?4, ?5
                     WHERE EXISTS (SELECT 1 FROM grid_rows WHERE id = ?1 AND table_id = ?3)
                       AND EXISTS (SELECT 1 FROM grid_columns WHERE id = ?2 AND table_id = ?3)
                     ON CONFLICT (row_id, column_id) DO UPDATE SET
                         text_value = excluded.text_value,
                         number_value = excluded.number_value",
                )
                .map_err(storage_error)?;

            for cell in cells {
                let (text, number) = cell_columns(&cell.value);
                written += stmt
                    .execute(params![
                        cell.row_id.to_string(),
                        cell.column_id.to_string(),
                        table,
                        text,
                        number
                    ])
                    .map_err(storage_error)?;
            }
        }

        tx.commit().map_err(storage_error)?;
        Ok(written)
    }

    async fn cells(&self, table_id: TableId) -> Result<Vec<Cell>, GridError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT row_id, column_id, text_value, number_value FROM grid_cells
                 WHERE table_id = ?1",
            )
            .map_err(storage_error)?;

        stmt.query_map(params![table_id.to_string()], cell_from_row)
            .map_err(storage_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_error)
    }

    async fn delete_cells_for_row(&self, row_id: RowId) -> Result<u64, GridError> {
        let changed = self
            .conn()?
            .execute(
                "DELETE FROM grid_cells WHERE row_id = ?1",
                params![row_id.to_string()],
            )
            .map_err(storage_error)?;
        Ok(changed as u64)
    }

    async fn delete_cells_for_column(&self, column_id: ColumnId) -> Result<u64, GridError> {
        let changed = self
            .conn()?
            .execute(
                "DELETE FROM grid_cells WHERE column_id = ?1",
                params![column_id.to_string()],
            )
            .map_err(storage_error)?;
        Ok(changed as u64)
    }

    async fn delete_cells(&self, table_id: TableId) -> Result<u64, GridError> {
        let changed = self
            .conn()?
            .execute(
                "DELETE FROM grid_cells WHERE table_id = ?1",
                params![table_id.to_string()],
            )
            .map_err(storage_error)?;
        Ok(changed as u64)
    }

    async fn create_view(&self, table_id: TableId, view: &NewView) -> Result<View, GridError> {
        let created = View {
            id: ViewId::new(),
            table_id,
            name: view.name.clone(),
            config: view.config.clone(),
            is_default: view.is_default,
            created_at: Utc::now(),
        };
        let config = encode_config(&created.config)?;

        self.conn()?
            .execute(
                "INSERT INTO grid_views (id, table_id, name, config, is_default, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    created.id.to_string(),
                    table_id.to_string(),
                    created.name,
                    config,
                    created.is_default,
                    created.created_at.to_rfc3339()
                ],
            )
            .map_err(storage_error)?;

        Ok(created)
    }

    async fn view(&self, id: ViewId) -> Result<Option<View>, GridError> {
        self.conn()?
            .query_row(
                &format!("SELECT {VIEW_COLUMNS} FROM grid_views WHERE id = ?1"),
                params![id.to_string()],
                view_from_row,
            )
            .optional()
            .map_err(storage_error)
    }

    async fn views(&self, table_id: TableId) -> Result<Vec<View>, GridError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {VIEW_COLUMNS} FROM grid_views WHERE table_id = ?1 ORDER BY rowid ASC"
            ))
            .map_err(storage_error)?;

        stmt.query_map(params![table_id.to_string()], view_from_row)
            .map_err(storage_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_error)
    }

    async fn update_view(&self, id: ViewId, patch: &ViewPatch) -> Result<bool, GridError> {
        let conn = self.conn()?;

        let current = conn
            .query_row(
                &format!("SELECT {VIEW_COLUMNS} FROM grid_views WHERE id = ?1"),
                params![id.to_string()],
                view_from_row,
            )
            .optional()
            .map_err(storage_error)?;

        let Some(mut view) = current else {
            return Ok(false);
        };
        patch.apply_to(&mut view);
        let config = encode_config(&view.config)?;

        conn.execute(
            "UPDATE grid_views SET name = ?2, config = ?3, is_default = ?4 WHERE id = ?1",
            params![id.to_string(), view.name, config, view.is_default],
        )
        .map_err(storage_error)?;

        Ok(true)
    }

    async fn clear_default_views(&self, table_id: TableId) -> Result<u64, GridError> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE grid_views SET is_default = 0 WHERE table_id = ?1 AND is_default = 1",
                params![table_id.to_string()],
            )
            .map_err(storage_error)?;
        Ok(changed as u64)
    }

    async fn promote_default(
        &self,
        table_id: TableId,
        exclude: ViewId,
    ) -> Result<Option<ViewId>, GridError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage_error)?;
        let table = table_id.to_string();

        tx.execute(
            "UPDATE grid_views SET is_default = 0 WHERE table_id = ?1 AND is_default = 1",
            params![table],
        )
        .map_err(storage_error)?;

        let promoted: Option<ViewId> = tx
            .query_row(
                "SELECT id FROM grid_views WHERE table_id = ?1 AND id <> ?2
                 ORDER BY rowid ASC LIMIT 1",
                params![table, exclude.to_string()],
                |row| parse_id(0, row.get(0)?),
            )
            .optional()
            .map_err(storage_error)?;

        if let Some(id) = promoted {
            tx.execute(
                "UPDATE grid_views SET is_default = 1 WHERE id = ?1",
                params![id.to_string()],
            )
            .map_err(storage_error)?;
        }

        tx.commit().map_err(storage_error)?;
        Ok(promoted)
    }

    async fn delete_view(&self, id: ViewId) -> Result<bool, GridError> {
        let changed = self
            .conn()?
            .execute("DELETE FROM grid_views WHERE id = ?1", params![id.to_string()])
            .map_err(storage_error)?;
        Ok(changed > 0)
    }

    async fn delete_views(&self, table_id: TableId) -> Result<u64, GridError> {
        let changed = self
            .conn()?
            .execute(
                "DELETE FROM grid_views WHERE table_id = ?1",
                params![table_id.to_string()],
            )
            .map_err(storage_error)?;
        Ok(changed as u64)
    }
}
