use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::{
    CellValue, Column, ColumnId, ColumnType, GridError, OptimisticId, Row, RowId, TableId, View,
    ViewConfig, ViewId, ViewPatch,
};

/// Reference to an entity that may not have a store-assigned id yet.
///
/// `Optimistic` targets are resolved by the executor through the ids recorded
/// when the corresponding add was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Target<Id> {
    Id(Id),
    Optimistic(OptimisticId),
}

impl<Id> From<OptimisticId> for Target<Id> {
    fn from(value: OptimisticId) -> Self {
        Target::Optimistic(value)
    }
}

impl From<RowId> for Target<RowId> {
    fn from(value: RowId) -> Self {
        Target::Id(value)
    }
}

impl From<ColumnId> for Target<ColumnId> {
    fn from(value: ColumnId) -> Self {
        Target::Id(value)
    }
}

impl From<ViewId> for Target<ViewId> {
    fn from(value: ViewId) -> Self {
        Target::Id(value)
    }
}

/// One cell write inside an `updateCells` batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellChange {
    pub row: Target<RowId>,
    pub column: Target<ColumnId>,
    pub value: CellValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    AddRow,
    DeleteRow,
    AddColumn,
    DeleteColumn,
    RenameColumn,
    RenameTable,
    DeleteTable,
    CreateView,
    UpdateView,
    DeleteView,
    UpdateCells,
}

impl MutationKind {
    pub fn label(&self) -> &'static str {
        match self {
            MutationKind::AddRow => "addRow",
            MutationKind::DeleteRow => "deleteRow",
            MutationKind::AddColumn => "addColumn",
            MutationKind::DeleteColumn => "deleteColumn",
            MutationKind::RenameColumn => "renameColumn",
            MutationKind::RenameTable => "renameTable",
            MutationKind::DeleteTable => "deleteTable",
            MutationKind::CreateView => "createView",
            MutationKind::UpdateView => "updateView",
            MutationKind::DeleteView => "deleteView",
            MutationKind::UpdateCells => "updateCells",
        }
    }

    /// Everything except cell content changes the shape of the table.
    pub fn is_structural(&self) -> bool {
        !matches!(self, MutationKind::UpdateCells)
    }
}

/// A single structural or content intent against one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Mutation {
    AddRow {
        table_id: TableId,
        optimistic_id: OptimisticId,
        order: i64,
    },
    DeleteRow {
        table_id: TableId,
        row: Target<RowId>,
    },
    AddColumn {
        table_id: TableId,
        optimistic_id: OptimisticId,
        label: String,
        order: i64,
        #[serde(default)]
        column_type: ColumnType,
    },
    DeleteColumn {
        table_id: TableId,
        column: Target<ColumnId>,
    },
    RenameColumn {
        table_id: TableId,
        column: Target<ColumnId>,
        label: String,
    },
    RenameTable {
        table_id: TableId,
        name: String,
    },
    DeleteTable {
        table_id: TableId,
    },
    CreateView {
        table_id: TableId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        optimistic_id: Option<OptimisticId>,
        name: String,
        #[serde(default)]
        config: ViewConfig,
        #[serde(default)]
        is_default: bool,
    },
    UpdateView {
        table_id: TableId,
        view: Target<ViewId>,
        patch: ViewPatch,
    },
    DeleteView {
        table_id: TableId,
        view: Target<ViewId>,
    },
    UpdateCells {
        table_id: TableId,
        changes: Vec<CellChange>,
    },
}

impl Mutation {
    pub fn kind(&self) -> MutationKind {
        match self {
            Mutation::AddRow { .. } => MutationKind::AddRow,
            Mutation::DeleteRow { .. } => MutationKind::DeleteRow,
            Mutation::AddColumn { .. } => MutationKind::AddColumn,
            Mutation::DeleteColumn { .. } => MutationKind::DeleteColumn,
            Mutation::RenameColumn { .. } => MutationKind::RenameColumn,
            Mutation::RenameTable { .. } => MutationKind::RenameTable,
            Mutation::DeleteTable { .. } => MutationKind::DeleteTable,
            Mutation::CreateView { .. } => MutationKind::CreateView,
            Mutation::UpdateView { .. } => MutationKind::UpdateView,
            Mutation::DeleteView { .. } => MutationKind::DeleteView,
            Mutation::UpdateCells { .. } => MutationKind::UpdateCells,
        }
    }

    pub fn table_id(&self) -> TableId {
        match self {
            Mutation::AddRow { table_id, .. }
            | Mutation::DeleteRow { table_id, .. }
            | Mutation::AddColumn { table_id, .. }
            | Mutation::DeleteColumn { table_id, .. }
            | Mutation::RenameColumn { table_id, .. }
            | Mutation::RenameTable { table_id, .. }
            | Mutation::DeleteTable { table_id }
            | Mutation::CreateView { table_id, .. }
            | Mutation::UpdateView { table_id, .. }
            | Mutation::DeleteView { table_id, .. }
            | Mutation::UpdateCells { table_id, .. } => *table_id,
        }
    }

    pub fn optimistic_id(&self) -> Option<OptimisticId> {
        match self {
            Mutation::AddRow { optimistic_id, .. } | Mutation::AddColumn { optimistic_id, .. } => {
                Some(*optimistic_id)
            }
            Mutation::CreateView { optimistic_id, .. } => *optimistic_id,
            _ => None,
        }
    }

    /// Rejects malformed input before it can reach the queue.
    pub fn validate(&self) -> Result<(), GridError> {
        match self {
            Mutation::AddColumn { label, .. } | Mutation::RenameColumn { label, .. } => {
                require_non_blank(label, "column label")
            }
            Mutation::RenameTable { name, .. } => require_non_blank(name, "table name"),
            Mutation::CreateView { name, .. } => require_non_blank(name, "view name"),
            Mutation::UpdateView { patch, .. } => {
                if patch.is_empty() {
                    return Err(GridError::invalid("view update has no fields to change"));
                }
                match &patch.name {
                    Some(name) => require_non_blank(name, "view name"),
                    None => Ok(()),
                }
            }
            Mutation::UpdateCells { changes, .. } => {
                if changes.is_empty() {
                    return Err(GridError::invalid("cell batch is empty"));
                }

                let mut seen = HashSet::with_capacity(changes.len());
                for change in changes {
                    if !seen.insert((change.row, change.column)) {
                        return Err(GridError::invalid(
                            "cell batch contains more than one change for the same cell",
                        ));
                    }
                }
                Ok(())
            }
            Mutation::AddRow { .. }
            | Mutation::DeleteRow { .. }
            | Mutation::DeleteColumn { .. }
            | Mutation::DeleteTable { .. }
            | Mutation::DeleteView { .. } => Ok(()),
        }
    }
}

fn require_non_blank(value: &str, what: &str) -> Result<(), GridError> {
    if value.trim().is_empty() {
        Err(GridError::invalid(format!("{what} must not be empty")))
    } else {
        Ok(())
    }
}

/// Authoritative result of an applied mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    RowCreated {
        optimistic_id: OptimisticId,
        row: Row,
    },
    ColumnCreated {
        optimistic_id: OptimisticId,
        column: Column,
    },
    ViewCreated {
        optimistic_id: Option<OptimisticId>,
        view: View,
    },
    CellsWritten {
        written: usize,
    },
    Applied,
}
