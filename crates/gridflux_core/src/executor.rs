use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::{
    Cell, CellChange, ColumnId, ColumnType, EntityId, GridError, Mutation, MutationOutcome,
    NewView, OptimisticId, RecordStore, RowId, TableId, Target, ViewId, ViewPatch,
};

/// Applies one mutation durably.
#[async_trait]
pub trait MutationExecutor: Send + Sync {
    async fn execute(&self, mutation: &Mutation) -> Result<MutationOutcome, GridError>;
}

/// Optimistic id -> store id, per table, for every add this process applied.
#[derive(Default)]
pub struct IdMap {
    tables: Mutex<HashMap<TableId, HashMap<OptimisticId, Uuid>>>,
}

impl IdMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TableId, HashMap<OptimisticId, Uuid>>> {
        match self.tables.lock() {
            Ok(guard) => guard,
            Err(poison_error) => poison_error.into_inner(),
        }
    }

    pub fn record(&self, table_id: TableId, optimistic_id: OptimisticId, id: impl Into<Uuid>) {
        self.lock()
            .entry(table_id)
            .or_default()
            .insert(optimistic_id, id.into());
    }

    pub fn lookup<Id: EntityId>(
        &self,
        table_id: TableId,
        optimistic_id: OptimisticId,
    ) -> Option<Id> {
        self.lock()
            .get(&table_id)
            .and_then(|ids| ids.get(&optimistic_id))
            .map(|id| Id::from(*id))
    }

    pub fn resolve<Id: EntityId>(&self, table_id: TableId, target: Target<Id>) -> Option<Id> {
        match target {
            Target::Id(id) => Some(id),
            Target::Optimistic(optimistic_id) => self.lookup(table_id, optimistic_id),
        }
    }

    pub fn forget_table(&self, table_id: TableId) {
        self.lock().remove(&table_id);
    }
}

/// Dispatches each mutation kind to the store operations that perform it.
///
/// Every operation can be re-run after a partial failure: deletes and renames
/// of missing targets are no-ops, and adds whose optimistic id is already
/// mapped return the record created by the earlier attempt.
pub struct StoreExecutor<S: RecordStore + ?Sized> {
    store: Arc<S>,
    ids: IdMap,
}

impl<S: RecordStore + ?Sized> StoreExecutor<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            ids: IdMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn ids(&self) -> &IdMap {
        &self.ids
    }

    async fn add_row(
        &self,
        table_id: TableId,
        optimistic_id: OptimisticId,
        order: i64,
    ) -> Result<MutationOutcome, GridError> {
        if let Some(existing) = self.ids.lookup::<RowId>(table_id, optimistic_id)
            && let Some(row) = self.store.row(existing).await?
        {
            log::debug!("[EXEC] addRow {optimistic_id} already applied as {}", row.id);
            return Ok(MutationOutcome::RowCreated { optimistic_id, row });
        }

        let row = self.store.create_row(table_id, order).await?;
        self.ids.record(table_id, optimistic_id, row.id);
        Ok(MutationOutcome::RowCreated { optimistic_id, row })
    }

    async fn add_column(
        &self,
        table_id: TableId,
        optimistic_id: OptimisticId,
        label: &str,
        order: i64,
        column_type: ColumnType,
    ) -> Result<MutationOutcome, GridError> {
        if let Some(existing) = self.ids.lookup::<ColumnId>(table_id, optimistic_id)
            && let Some(column) = self.store.column(existing).await?
        {
            log::debug!(
                "[EXEC] addColumn {optimistic_id} already applied as {}",
                column.id
            );
            return Ok(MutationOutcome::ColumnCreated {
                optimistic_id,
                column,
            });
        }

        let column = self
            .store
            .create_column(table_id, label, order, column_type)
            .await?;
        self.ids.record(table_id, optimistic_id, column.id);
        Ok(MutationOutcome::ColumnCreated {
            optimistic_id,
            column,
        })
    }

    async fn delete_row(
        &self,
        table_id: TableId,
        target: Target<RowId>,
    ) -> Result<MutationOutcome, GridError> {
        let Some(row_id) = self.ids.resolve(table_id, target) else {
            log::debug!("[EXEC] deleteRow target {target:?} was never created, nothing to do");
            return Ok(MutationOutcome::Applied);
        };

        // Only sweep cells of rows that belong to this table.
        match self.store.row(row_id).await? {
            Some(row) if row.table_id == table_id => {
                self.store.delete_cells_for_row(row_id).await?;
                self.store.delete_row(table_id, row_id).await?;
            }
            _ => log::debug!("[EXEC] deleteRow {row_id} already gone"),
        }

        Ok(MutationOutcome::Applied)
    }

    async fn delete_column(
        &self,
        table_id: TableId,
        target: Target<ColumnId>,
    ) -> Result<MutationOutcome, GridError> {
        let Some(column_id) = self.ids.resolve(table_id, target) else {
            log::debug!("[EXEC] deleteColumn target {target:?} was never created, nothing to do");
            return Ok(MutationOutcome::Applied);
        };

        match self.store.column(column_id).await? {
            Some(column) if column.table_id == table_id => {
                self.store.delete_cells_for_column(column_id).await?;
                self.store.delete_column(table_id, column_id).await?;
            }
            _ => log::debug!("[EXEC] deleteColumn {column_id} already gone"),
        }

        Ok(MutationOutcome::Applied)
    }

    async fn rename_column(
        &self,
        table_id: TableId,
        target: Target<ColumnId>,
        label: &str,
    ) -> Result<MutationOutcome, GridError> {
        if let Some(column_id) = self.ids.resolve(table_id, target)
            && !self.store.rename_column(table_id, column_id, label).await?
        {
            log::debug!("[EXEC] renameColumn {column_id} no longer exists");
        }
        Ok(MutationOutcome::Applied)
    }

    async fn delete_table(&self, table_id: TableId) -> Result<MutationOutcome, GridError> {
        let cells = self.store.delete_cells(table_id).await?;
        let rows = self.store.delete_rows(table_id).await?;
        let columns = self.store.delete_columns(table_id).await?;
        let views = self.store.delete_views(table_id).await?;
        let deleted = self.store.delete_table(table_id).await?;

        log::debug!(
            "[EXEC] deleteTable {table_id}: cells={cells} rows={rows} columns={columns} views={views} table={deleted}"
        );

        self.ids.forget_table(table_id);
        Ok(MutationOutcome::Applied)
    }

    async fn create_view(
        &self,
        table_id: TableId,
        optimistic_id: Option<OptimisticId>,
        new_view: NewView,
    ) -> Result<MutationOutcome, GridError> {
        if let Some(optimistic_id) = optimistic_id
            && let Some(existing) = self.ids.lookup::<ViewId>(table_id, optimistic_id)
            && let Some(view) = self.store.view(existing).await?
        {
            return Ok(MutationOutcome::ViewCreated {
                optimistic_id: Some(optimistic_id),
                view,
            });
        }

        if new_view.is_default {
            self.store.clear_default_views(table_id).await?;
        }

        let view = self.store.create_view(table_id, &new_view).await?;
        if let Some(optimistic_id) = optimistic_id {
            self.ids.record(table_id, optimistic_id, view.id);
        }

        Ok(MutationOutcome::ViewCreated {
            optimistic_id,
            view,
        })
    }

    async fn update_view(
        &self,
        table_id: TableId,
        target: Target<ViewId>,
        patch: &ViewPatch,
    ) -> Result<MutationOutcome, GridError> {
        let Some(view_id) = self.ids.resolve(table_id, target) else {
            return Ok(MutationOutcome::Applied);
        };

        match self.store.view(view_id).await? {
            Some(view) if view.table_id == table_id => {
                if patch.is_default == Some(true) {
                    self.store.clear_default_views(table_id).await?;
                }
                self.store.update_view(view_id, patch).await?;
            }
            _ => log::debug!("[EXEC] updateView {view_id} no longer exists"),
        }

        Ok(MutationOutcome::Applied)
    }

    async fn delete_view(
        &self,
        table_id: TableId,
        target: Target<ViewId>,
    ) -> Result<MutationOutcome, GridError> {
        let Some(view_id) = self.ids.resolve(table_id, target) else {
            return Ok(MutationOutcome::Applied);
        };

        let Some(view) = self.store.view(view_id).await? else {
            return Ok(MutationOutcome::Applied);
        };
        if view.table_id != table_id {
            return Ok(MutationOutcome::Applied);
        }

        // Promotion is atomic, so a retry after a failed delete finds the view
        // already demoted and does not promote again.
        if view.is_default {
            match self.store.promote_default(table_id, view_id).await? {
                Some(promoted) => log::debug!("[EXEC] promoted view {promoted} to default"),
                None => log::debug!("[EXEC] table {table_id} has no view left to promote"),
            }
        }

        self.store.delete_view(view_id).await?;
        Ok(MutationOutcome::Applied)
    }

    async fn update_cells(
        &self,
        table_id: TableId,
        changes: &[CellChange],
    ) -> Result<MutationOutcome, GridError> {
        let mut cells = Vec::with_capacity(changes.len());

        for change in changes {
            let row = self.ids.resolve(table_id, change.row);
            let column = self.ids.resolve(table_id, change.column);

            match (row, column) {
                (Some(row_id), Some(column_id)) => {
                    cells.push(Cell::new(row_id, column_id, change.value.clone()));
                }
                _ => log::warn!(
                    "[EXEC] dropping cell change for unresolved target {:?}/{:?}",
                    change.row,
                    change.column
                ),
            }
        }

        let written = if cells.is_empty() {
            0
        } else {
            self.store.upsert_cells(table_id, &cells).await?
        };

        if written < changes.len() {
            log::debug!(
                "[EXEC] updateCells wrote {written} of {} changes",
                changes.len()
            );
        }

        Ok(MutationOutcome::CellsWritten { written })
    }
}

#[async_trait]
impl<S: RecordStore + ?Sized> MutationExecutor for StoreExecutor<S> {
    async fn execute(&self, mutation: &Mutation) -> Result<MutationOutcome, GridError> {
        log::debug!(
            "[EXEC] {} on table {}",
            mutation.kind().label(),
            mutation.table_id()
        );

        match mutation {
            Mutation::AddRow {
                table_id,
                optimistic_id,
                order,
            } => self.add_row(*table_id, *optimistic_id, *order).await,
            Mutation::AddColumn {
                table_id,
                optimistic_id,
                label,
                order,
                column_type,
            } => {
                self.add_column(*table_id, *optimistic_id, label, *order, *column_type)
                    .await
            }
            Mutation::DeleteRow { table_id, row } => self.delete_row(*table_id, *row).await,
            Mutation::DeleteColumn { table_id, column } => {
                self.delete_column(*table_id, *column).await
            }
            Mutation::RenameColumn {
                table_id,
                column,
                label,
            } => self.rename_column(*table_id, *column, label).await,
            Mutation::RenameTable { table_id, name } => {
                if !self.store.rename_table(*table_id, name).await? {
                    log::debug!("[EXEC] renameTable {table_id} no longer exists");
                }
                Ok(MutationOutcome::Applied)
            }
            Mutation::DeleteTable { table_id } => self.delete_table(*table_id).await,
            Mutation::CreateView {
                table_id,
                optimistic_id,
                name,
                config,
                is_default,
            } => {
                let new_view = NewView {
                    name: name.clone(),
                    config: config.clone(),
                    is_default: *is_default,
                };
                self.create_view(*table_id, *optimistic_id, new_view).await
            }
            Mutation::UpdateView {
                table_id,
                view,
                patch,
            } => self.update_view(*table_id, *view, patch).await,
            Mutation::DeleteView { table_id, view } => self.delete_view(*table_id, *view).await,
            Mutation::UpdateCells { table_id, changes } => {
                self.update_cells(*table_id, changes).await
            }
        }
    }
}
