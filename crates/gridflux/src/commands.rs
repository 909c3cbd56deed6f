use futures::future::join_all;
use gridflux_core::{
    CallerId, GridConfig, GridError, MutationGateway, MutationOutcome, OwnerAccess, QueueManager,
    RecordStore, StoreExecutor, TableId,
};
use gridflux_store_sqlite::SqliteStore;
use std::path::Path;
use std::sync::Arc;

use crate::script::ScriptEntry;

/// Opens the store at `db` and wires the gateway in front of it. Must run
/// inside the tokio runtime that will host the queue workers.
pub fn open_gateway(db: &Path, config: &GridConfig) -> Result<Arc<MutationGateway>, GridError> {
    if let Some(parent) = db.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::open(db)?);
    let executor = Arc::new(StoreExecutor::new(store.clone()));
    let access = Arc::new(OwnerAccess::new(store.clone()));
    let queue = QueueManager::new(executor, config.queue.clone())?;

    Ok(Arc::new(MutationGateway::new(store, access, queue)))
}

pub fn parse_table_id(value: &str) -> Result<TableId, GridError> {
    uuid::Uuid::parse_str(value)
        .map(TableId::from)
        .map_err(|e| GridError::invalid(format!("'{value}' is not a table id: {e}")))
}

pub async fn create_table(
    gateway: &MutationGateway,
    caller: &CallerId,
    name: &str,
) -> Result<TableId, GridError> {
    let table = gateway.create_table(caller, name).await?;
    println!("{}\t{}", table.id, table.name);
    Ok(table.id)
}

pub async fn list_tables(gateway: &MutationGateway, caller: &CallerId) -> Result<(), GridError> {
    for table in gateway.tables(caller).await? {
        println!("{}\t{}\t{}", table.id, table.name, table.created_at.to_rfc3339());
    }
    Ok(())
}

pub async fn show_table(
    gateway: &MutationGateway,
    caller: &CallerId,
    table_id: TableId,
) -> Result<(), GridError> {
    let snapshot = gateway.snapshot(caller, table_id).await?;
    let json = serde_json::to_string_pretty(&snapshot)
        .map_err(|e| GridError::storage(format!("failed to encode snapshot: {e}")))?;
    println!("{json}");
    Ok(())
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub rejected: usize,
    pub failed: usize,
}

impl ApplyReport {
    pub fn is_clean(&self) -> bool {
        self.rejected == 0 && self.failed == 0
    }
}

/// Submits every entry in order, then waits for all of them to settle.
///
/// Entries for the same table run in script order; different tables proceed
/// concurrently. Rejected entries are reported and skipped.
pub async fn apply_script(
    gateway: &MutationGateway,
    caller: &CallerId,
    entries: Vec<ScriptEntry>,
) -> ApplyReport {
    let mut report = ApplyReport::default();
    let mut tickets = Vec::with_capacity(entries.len());

    for entry in entries {
        let kind = entry.mutation.kind();
        match gateway.submit(caller, entry.mutation).await {
            Ok(ticket) => tickets.push((entry.line, ticket)),
            Err(e) => {
                log::warn!("line {}: {} rejected: {e}", entry.line, kind.label());
                report.rejected += 1;
            }
        }
    }

    let settlements = join_all(tickets.into_iter().map(|(line, ticket)| async move {
        let kind = ticket.kind;
        (line, kind, ticket.settled().await)
    }))
    .await;

    for (line, kind, settlement) in settlements {
        match settlement {
            Ok(outcome) => {
                report.applied += 1;
                println!("{line}\t{}\t{}", kind.label(), describe(&outcome));
            }
            Err(failure) => {
                report.failed += 1;
                println!("{line}\t{}\tfailed: {}", kind.label(), failure.reason);
            }
        }
    }

    gateway.queue().wait_idle().await;
    log::info!(
        "Script finished: applied={}, rejected={}, failed={}",
        report.applied,
        report.rejected,
        report.failed
    );

    report
}

fn describe(outcome: &MutationOutcome) -> String {
    match outcome {
        MutationOutcome::RowCreated { row, .. } => format!("row {}", row.id),
        MutationOutcome::ColumnCreated { column, .. } => format!("column {}", column.id),
        MutationOutcome::ViewCreated { view, .. } => format!("view {}", view.id),
        MutationOutcome::CellsWritten { written } => format!("{written} cells"),
        MutationOutcome::Applied => "ok".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::parse_script;
    use gridflux_core::{CellValue, QueueConfig};
    use gridflux_test_support::fixtures::{owner, stranger};

    fn quick_config() -> GridConfig {
        GridConfig {
            queue: QueueConfig::immediate(),
            ..GridConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn script_builds_a_table_through_optimistic_ids() {
        let temp_dir = tempfile::tempdir().unwrap();
        let gateway = open_gateway(&temp_dir.path().join("nested/grid.sqlite"), &quick_config())
            .unwrap();
        let table_id = create_table(&gateway, &owner(), "Orders").await.unwrap();

        let row = uuid::Uuid::new_v4();
        let column = uuid::Uuid::new_v4();
        let script = format!(
            r#"{{"kind":"addRow","tableId":"{table_id}","optimisticId":"{row}","order":0}}
{{"kind":"addColumn","tableId":"{table_id}","optimisticId":"{column}","label":"Name","order":0}}
{{"kind":"updateCells","tableId":"{table_id}","changes":[{{"row":{{"optimistic":"{row}"}},"column":{{"optimistic":"{column}"}},"value":"Acme"}}]}}
{{"kind":"renameTable","tableId":"{table_id}","name":"  "}}
"#
        );

        let report = apply_script(&gateway, &owner(), parse_script(&script).unwrap()).await;

        assert_eq!(
            report,
            ApplyReport {
                applied: 3,
                rejected: 1,
                failed: 0
            }
        );

        let snapshot = gateway.snapshot(&owner(), table_id).await.unwrap();
        assert_eq!(snapshot.rows.len(), 1);
        assert_eq!(snapshot.columns[0].label, "Name");
        assert_eq!(snapshot.cells[0].value, CellValue::from("Acme"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn strangers_are_rejected_before_queueing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let gateway = open_gateway(&temp_dir.path().join("grid.sqlite"), &quick_config()).unwrap();
        let table_id = create_table(&gateway, &owner(), "Orders").await.unwrap();

        let script = format!(r#"{{"kind":"deleteTable","tableId":"{table_id}"}}"#);
        let report = apply_script(&gateway, &stranger(), parse_script(&script).unwrap()).await;

        assert_eq!(report.rejected, 1);
        assert!(!report.is_clean());
        assert!(gateway.snapshot(&owner(), table_id).await.is_ok());
    }

    #[test]
    fn table_ids_must_be_uuids() {
        assert!(parse_table_id("not-a-uuid").is_err());
        assert!(parse_table_id(&TableId::new().to_string()).is_ok());
    }
}
