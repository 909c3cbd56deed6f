use rusqlite::Connection;

/// Foreign keys are enforced and never cascade; the executor deletes
/// dependents explicitly. The partial index keeps at most one default view
/// per table.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS grid_tables (
    id          TEXT PRIMARY KEY,
    owner       TEXT NOT NULL,
    name        TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS grid_tables_owner ON grid_tables(owner);

CREATE TABLE IF NOT EXISTS grid_rows (
    id          TEXT PRIMARY KEY,
    table_id    TEXT NOT NULL REFERENCES grid_tables(id),
    sort_order  INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS grid_rows_table ON grid_rows(table_id, sort_order);

CREATE TABLE IF NOT EXISTS grid_columns (
    id           TEXT PRIMARY KEY,
    table_id     TEXT NOT NULL REFERENCES grid_tables(id),
    label        TEXT NOT NULL,
    sort_order   INTEGER NOT NULL,
    column_type  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS grid_columns_table ON grid_columns(table_id, sort_order);

CREATE TABLE IF NOT EXISTS grid_cells (
    row_id        TEXT NOT NULL REFERENCES grid_rows(id),
    column_id     TEXT NOT NULL REFERENCES grid_columns(id),
    table_id      TEXT NOT NULL REFERENCES grid_tables(id),
    text_value    TEXT,
    number_value  REAL,
    PRIMARY KEY (row_id, column_id)
);

CREATE INDEX IF NOT EXISTS grid_cells_table ON grid_cells(table_id);
CREATE INDEX IF NOT EXISTS grid_cells_column ON grid_cells(column_id);

CREATE TABLE IF NOT EXISTS grid_views (
    id          TEXT PRIMARY KEY,
    table_id    TEXT NOT NULL REFERENCES grid_tables(id),
    name        TEXT NOT NULL,
    config      TEXT NOT NULL,
    is_default  INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS grid_views_table ON grid_views(table_id);
CREATE UNIQUE INDEX IF NOT EXISTS grid_views_one_default
    ON grid_views(table_id) WHERE is_default = 1;
"#;

pub(crate) fn initialize(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(SCHEMA)
}
