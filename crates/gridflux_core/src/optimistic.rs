use indexmap::IndexMap;
use std::collections::HashMap;
use uuid::Uuid;

use crate::{
    CellValue, ColumnId, ColumnType, EntityId, OptimisticId, RowId, Table, TableId, TableSnapshot,
    Target, View, ViewConfig, ViewId,
};

/// Stable client-side key. Never changes for the lifetime of the entity.
pub type LocalId = OptimisticId;

/// Identity of a client-visible entity that may not be confirmed yet.
///
/// Entities are always keyed by `local_id`; confirmation only fills in
/// `server_id`, so nothing keyed on the entity moves or disappears.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Provisional<Id> {
    pub local_id: LocalId,
    pub server_id: Option<Id>,
}

impl<Id: EntityId> Provisional<Id> {
    pub fn pending() -> Self {
        Self {
            local_id: OptimisticId::new(),
            server_id: None,
        }
    }

    /// Identity for an entity loaded from the store. The local id is derived
    /// from the server id so it can be looked up either way.
    pub fn confirmed(id: Id) -> Self {
        let uuid: Uuid = id.into();
        Self {
            local_id: OptimisticId::from(uuid),
            server_id: Some(id),
        }
    }

    pub fn is_optimistic(&self) -> bool {
        self.server_id.is_none()
    }

    pub fn target(&self) -> Target<Id> {
        match self.server_id {
            Some(id) => Target::Id(id),
            None => Target::Optimistic(self.local_id),
        }
    }

    pub fn confirm(&mut self, id: Id) {
        self.server_id = Some(id);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientRow {
    pub identity: Provisional<RowId>,
    pub order: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientColumn {
    pub identity: Provisional<ColumnId>,
    pub label: String,
    pub order: i64,
    pub column_type: ColumnType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientView {
    pub identity: Provisional<ViewId>,
    pub name: String,
    pub config: ViewConfig,
    pub is_default: bool,
}

impl From<&View> for ClientView {
    fn from(view: &View) -> Self {
        Self {
            identity: Provisional::confirmed(view.id),
            name: view.name.clone(),
            config: view.config.clone(),
            is_default: view.is_default,
        }
    }
}

/// A removed row or column, kept so a failed delete can put it back.
#[derive(Debug, Clone)]
pub struct Removed<T> {
    pub index: usize,
    pub entity: T,
    pub cells: Vec<(LocalId, CellValue)>,
}

/// What the user currently sees for one table.
#[derive(Debug, Clone)]
pub struct GridState {
    table: Table,
    rows: IndexMap<LocalId, ClientRow>,
    columns: IndexMap<LocalId, ClientColumn>,
    views: IndexMap<LocalId, ClientView>,
    /// Keyed by (row local id, column local id).
    cells: HashMap<(LocalId, LocalId), CellValue>,
}

impl GridState {
    pub fn from_snapshot(snapshot: &TableSnapshot) -> Self {
        let rows = snapshot
            .rows
            .iter()
            .map(|row| {
                let identity = Provisional::confirmed(row.id);
                (
                    identity.local_id,
                    ClientRow {
                        identity,
                        order: row.order,
                    },
                )
            })
            .collect();

        let columns = snapshot
            .columns
            .iter()
            .map(|column| {
                let identity = Provisional::confirmed(column.id);
                (
                    identity.local_id,
                    ClientColumn {
                        identity,
                        label: column.label.clone(),
                        order: column.order,
                        column_type: column.column_type,
                    },
                )
            })
            .collect();

        let views = snapshot
            .views
            .iter()
            .map(|view| {
                let client = ClientView::from(view);
                (client.identity.local_id, client)
            })
            .collect();

        let cells = snapshot
            .cells
            .iter()
            .map(|cell| {
                let row = OptimisticId::from(cell.row_id.as_uuid());
                let column = OptimisticId::from(cell.column_id.as_uuid());
                ((row, column), cell.value.clone())
            })
            .collect();

        Self {
            table: snapshot.table.clone(),
            rows,
            columns,
            views,
            cells,
        }
    }

    pub fn table_id(&self) -> TableId {
        self.table.id
    }

    pub fn table_name(&self) -> &str {
        &self.table.name
    }

    /// Returns the previous name.
    pub fn set_table_name(&mut self, name: impl Into<String>) -> String {
        std::mem::replace(&mut self.table.name, name.into())
    }

    // === Rows ===

    pub fn rows(&self) -> impl Iterator<Item = &ClientRow> {
        self.rows.values()
    }

    pub fn row(&self, local_id: LocalId) -> Option<&ClientRow> {
        self.rows.get(&local_id)
    }

    pub fn row_by_server_id(&self, id: RowId) -> Option<&ClientRow> {
        self.rows
            .values()
            .find(|row| row.identity.server_id == Some(id))
    }

    pub fn next_row_order(&self) -> i64 {
        self.rows.values().map(|row| row.order).max().map_or(0, |max| max + 1)
    }

    pub fn insert_row(&mut self, row: ClientRow) {
        self.rows.insert(row.identity.local_id, row);
    }

    pub fn confirm_row(&mut self, local_id: LocalId, id: RowId) -> bool {
        match self.rows.get_mut(&local_id) {
            Some(row) => {
                row.identity.confirm(id);
                true
            }
            None => false,
        }
    }

    pub fn remove_row(&mut self, local_id: LocalId) -> Option<Removed<ClientRow>> {
        let (index, _, row) = self.rows.shift_remove_full(&local_id)?;
        let mut cells = Vec::new();
        self.cells.retain(|(row_id, column_id), value| {
            if *row_id == local_id {
                cells.push((*column_id, value.clone()));
                false
            } else {
                true
            }
        });

        Some(Removed {
            index,
            entity: row,
            cells,
        })
    }

    pub fn restore_row(&mut self, removed: Removed<ClientRow>) {
        let local_id = removed.entity.identity.local_id;
        let index = removed.index.min(self.rows.len());
        self.rows.shift_insert(index, local_id, removed.entity);

        for (column_id, value) in removed.cells {
            if self.columns.contains_key(&column_id) {
                self.cells.insert((local_id, column_id), value);
            }
        }
    }

    // === Columns ===

    pub fn columns(&self) -> impl Iterator<Item = &ClientColumn> {
        self.columns.values()
    }

    pub fn column(&self, local_id: LocalId) -> Option<&ClientColumn> {
        self.columns.get(&local_id)
    }

    pub fn next_column_order(&self) -> i64 {
        self.columns
            .values()
            .map(|column| column.order)
            .max()
            .map_or(0, |max| max + 1)
    }

    pub fn insert_column(&mut self, column: ClientColumn) {
        self.columns.insert(column.identity.local_id, column);
    }

    pub fn confirm_column(&mut self, local_id: LocalId, id: ColumnId) -> bool {
        match self.columns.get_mut(&local_id) {
            Some(column) => {
                column.identity.confirm(id);
                true
            }
            None => false,
        }
    }

    /// Returns the previous label.
    pub fn rename_column(&mut self, local_id: LocalId, label: impl Into<String>) -> Option<String> {
        self.columns
            .get_mut(&local_id)
            .map(|column| std::mem::replace(&mut column.label, label.into()))
    }

    pub fn remove_column(&mut self, local_id: LocalId) -> Option<Removed<ClientColumn>> {
        let (index, _, column) = self.columns.shift_remove_full(&local_id)?;
        let mut cells = Vec::new();
        self.cells.retain(|(row_id, column_id), value| {
            if *column_id == local_id {
                cells.push((*row_id, value.clone()));
                false
            } else {
                true
            }
        });

        Some(Removed {
            index,
            entity: column,
            cells,
        })
    }

    pub fn restore_column(&mut self, removed: Removed<ClientColumn>) {
        let local_id = removed.entity.identity.local_id;
        let index = removed.index.min(self.columns.len());
        self.columns.shift_insert(index, local_id, removed.entity);

        for (row_id, value) in removed.cells {
            if self.rows.contains_key(&row_id) {
                self.cells.insert((row_id, local_id), value);
            }
        }
    }

    // === Cells ===

    pub fn cell(&self, row: LocalId, column: LocalId) -> Option<&CellValue> {
        self.cells.get(&(row, column))
    }

    /// Ignored (returns false) when the row or column is not visible.
    pub fn set_cell(&mut self, row: LocalId, column: LocalId, value: CellValue) -> bool {
        if !self.rows.contains_key(&row) || !self.columns.contains_key(&column) {
            return false;
        }
        self.cells.insert((row, column), value);
        true
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    pub fn cells_referencing(&self, local_id: LocalId) -> usize {
        self.cells
            .keys()
            .filter(|(row, column)| *row == local_id || *column == local_id)
            .count()
    }

    /// Rows in display order, keeping only those with a cell matching the
    /// search text (case-insensitive). An empty search keeps every row.
    pub fn visible_rows(&self, search: &str) -> Vec<&ClientRow> {
        let needle = search.trim().to_lowercase();
        let mut rows: Vec<&ClientRow> = self
            .rows
            .values()
            .filter(|row| {
                needle.is_empty()
                    || self.columns.keys().any(|column| {
                        self.cells
                            .get(&(row.identity.local_id, *column))
                            .is_some_and(|value| value.matches_search(&needle))
                    })
            })
            .collect();

        rows.sort_by_key(|row| row.order);
        rows
    }

    // === Views ===

    pub fn views(&self) -> impl Iterator<Item = &ClientView> {
        self.views.values()
    }

    pub fn view(&self, local_id: LocalId) -> Option<&ClientView> {
        self.views.get(&local_id)
    }

    pub fn default_view(&self) -> Option<&ClientView> {
        self.views.values().find(|view| view.is_default)
    }

    pub fn insert_view(&mut self, view: ClientView) {
        if view.is_default {
            self.clear_default_views();
        }
        self.views.insert(view.identity.local_id, view);
    }

    pub fn confirm_view(&mut self, local_id: LocalId, id: ViewId) -> bool {
        match self.views.get_mut(&local_id) {
            Some(view) => {
                view.identity.confirm(id);
                true
            }
            None => false,
        }
    }

    /// Replaces a view's attributes, returning the previous ones.
    pub fn replace_view(&mut self, view: ClientView) -> Option<ClientView> {
        let local_id = view.identity.local_id;
        if !self.views.contains_key(&local_id) {
            return None;
        }
        if view.is_default {
            self.clear_default_views();
        }
        self.views.insert(local_id, view)
    }

    /// Removes a view. A removed default hands its flag to the oldest remaining view.
    pub fn remove_view(&mut self, local_id: LocalId) -> Option<(usize, ClientView)> {
        let (index, _, view) = self.views.shift_remove_full(&local_id)?;
        if view.is_default
            && let Some((_, fallback)) = self.views.first_mut()
        {
            fallback.is_default = true;
        }
        Some((index, view))
    }

    pub fn restore_view(&mut self, index: usize, view: ClientView) {
        if view.is_default {
            self.clear_default_views();
        }
        let index = index.min(self.views.len());
        self.views.shift_insert(index, view.identity.local_id, view);
    }

    /// Makes the given view the only default, or leaves the table without one.
    pub fn set_default_view(&mut self, local_id: Option<LocalId>) {
        self.clear_default_views();
        if let Some(view) = local_id.and_then(|id| self.views.get_mut(&id)) {
            view.is_default = true;
        }
    }

    fn clear_default_views(&mut self) {
        for view in self.views.values_mut() {
            view.is_default = false;
        }
    }
}
