use gridflux_core::{
    BatchConfig, CellValue, ColumnType, GridError, GridSession, LocalId, MemoryStore, Mutation,
    MutationKind, MutationSubmitter, QueueManager, RecordStore, StoreExecutor, SubmitPolicy,
    TableSnapshot, ViewConfig, ViewPatch,
};
use gridflux_test_support::ScriptedExecutor;
use gridflux_test_support::fixtures::{immediate_queue, owner, seed_table, snapshot};
use std::sync::Arc;
use std::time::Duration;

const HOUR: Duration = Duration::from_secs(3600);

type Script = fn(ScriptedExecutor) -> ScriptedExecutor;

fn as_is(executor: ScriptedExecutor) -> ScriptedExecutor {
    executor
}

struct Harness {
    store: Arc<MemoryStore>,
    executor: ScriptedExecutor,
    queue: QueueManager,
    snapshot: TableSnapshot,
    session: GridSession,
}

impl Harness {
    async fn open(script: Script, flush_every: Duration) -> Self {
        let store = Arc::new(MemoryStore::new());
        let snapshot = seed_table(store.as_ref(), &owner(), &["Name", "Amount"], 3)
            .await
            .unwrap();
        Self::open_with(store, snapshot, script, flush_every)
    }

    /// `script` configures an executor that applies to `store` underneath.
    fn open_with(
        store: Arc<MemoryStore>,
        snapshot: TableSnapshot,
        script: impl FnOnce(ScriptedExecutor) -> ScriptedExecutor,
        flush_every: Duration,
    ) -> Self {
        let executor = script(ScriptedExecutor::wrapping(Arc::new(StoreExecutor::new(
            store.clone(),
        ))));
        let queue = immediate_queue(Arc::new(executor.clone()));
        let submitter: Arc<dyn MutationSubmitter> = Arc::new(queue.clone());
        let config = BatchConfig {
            flush_interval_ms: flush_every.as_millis() as u64,
        };
        let session = GridSession::open(&snapshot, submitter, &config).unwrap();

        Self {
            store,
            executor,
            queue,
            snapshot,
            session,
        }
    }

    fn row(&self, index: usize) -> LocalId {
        self.snapshot.rows[index].id.as_uuid().into()
    }

    fn column(&self, index: usize) -> LocalId {
        self.snapshot.columns[index].id.as_uuid().into()
    }

    fn row_ids(&self) -> Vec<LocalId> {
        self.session
            .with_state(|state| state.rows().map(|row| row.identity.local_id).collect())
    }

    /// What the store holds once every queued mutation has run.
    async fn stored(&self) -> TableSnapshot {
        self.queue.wait_idle().await;
        snapshot(self.store.as_ref(), self.snapshot.table.id)
            .await
            .unwrap()
    }
}

struct Refuse(MutationKind);

impl SubmitPolicy for Refuse {
    fn confirm(&self, mutation: &Mutation) -> bool {
        mutation.kind() != self.0
    }
}

// ---------------------------------------------------------------------------
// Structural reconciliation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn confirmed_rows_keep_their_local_key() {
    let harness = Harness::open(as_is, HOUR).await;

    let local_id = harness.session.add_row().await.unwrap();
    assert!(
        harness
            .session
            .with_state(|state| state.row(local_id).unwrap().identity.is_optimistic())
    );

    harness.session.wait_stable().await;

    let server_id = harness
        .session
        .with_state(|state| state.row(local_id).unwrap().identity.server_id)
        .expect("row confirmed");
    assert_eq!(harness.row_ids().last(), Some(&local_id));
    assert!(harness.store.row(server_id).await.unwrap().is_some());
    assert_eq!(harness.stored().await.rows.len(), 4);
}

#[tokio::test]
async fn a_row_that_never_lands_is_removed_with_its_cells() {
    let harness = Harness::open(|e| e.fail_always(MutationKind::AddRow), HOUR).await;

    let local_id = harness.session.add_row().await.unwrap();
    harness
        .session
        .update_cell(local_id, harness.column(0), "orphan")
        .unwrap();
    assert_eq!(harness.session.pending_edits(), 1);

    harness.session.wait_stable().await;

    harness.session.with_state(|state| {
        assert!(state.row(local_id).is_none());
        assert_eq!(state.cells_referencing(local_id), 0);
    });
    assert_eq!(harness.session.pending_edits(), 0);
    assert_eq!(harness.executor.attempts(MutationKind::AddRow), 6);
    assert_eq!(harness.row_ids().len(), 3);
}

#[tokio::test]
async fn a_failed_row_delete_puts_the_row_back_where_it_was() {
    let store = Arc::new(MemoryStore::new());
    let seeded = seed_table(store.as_ref(), &owner(), &["Name"], 3).await.unwrap();
    store
        .upsert_cells(
            seeded.table.id,
            &[gridflux_core::Cell::new(seeded.rows[1].id, seeded.columns[0].id, "middle")],
        )
        .await
        .unwrap();
    let loaded = snapshot(store.as_ref(), seeded.table.id).await.unwrap();
    let harness = Harness::open_with(
        store,
        loaded,
        |e| e.fail_always(MutationKind::DeleteRow),
        HOUR,
    );
    let before = harness.row_ids();
    let middle = harness.row(1);

    harness.session.delete_row(middle).await.unwrap();
    assert!(!harness.row_ids().contains(&middle));

    harness.session.wait_stable().await;

    assert_eq!(harness.row_ids(), before);
    assert_eq!(
        harness.session.with_state(|state| state.cell(middle, harness.column(0)).cloned()),
        Some(CellValue::from("middle"))
    );
}

#[tokio::test]
async fn a_failed_rename_restores_the_previous_label() {
    let harness = Harness::open(|e| e.fail_always(MutationKind::RenameColumn), HOUR).await;
    let column = harness.column(1);

    harness.session.rename_column(column, "Total").await.unwrap();
    assert_eq!(
        harness.session.with_state(|state| state.column(column).unwrap().label.clone()),
        "Total"
    );

    harness.session.wait_stable().await;

    assert_eq!(
        harness.session.with_state(|state| state.column(column).unwrap().label.clone()),
        "Amount"
    );
}

#[tokio::test]
async fn a_failed_rename_does_not_undo_a_later_confirmed_one() {
    let harness = Harness::open(|e| e.fail_next(MutationKind::RenameColumn, 6), HOUR).await;
    let column = harness.column(0);

    harness.session.rename_column(column, "First").await.unwrap();
    harness.session.rename_column(column, "Second").await.unwrap();
    harness.session.wait_stable().await;

    assert_eq!(
        harness.session.with_state(|state| state.column(column).unwrap().label.clone()),
        "Second"
    );
    assert_eq!(harness.stored().await.columns[0].label, "Second");
    assert_eq!(harness.executor.attempts(MutationKind::RenameColumn), 7);
}

#[tokio::test]
async fn renames_that_all_fail_fall_back_to_the_original_label() {
    let harness = Harness::open(|e| e.fail_always(MutationKind::RenameColumn), HOUR).await;
    let column = harness.column(0);

    harness.session.rename_column(column, "First").await.unwrap();
    harness.session.rename_column(column, "Second").await.unwrap();
    harness.session.wait_stable().await;

    assert_eq!(
        harness.session.with_state(|state| state.column(column).unwrap().label.clone()),
        "Name"
    );
}

#[tokio::test]
async fn a_failed_table_rename_keeps_a_later_confirmed_name() {
    let harness = Harness::open(|e| e.fail_next(MutationKind::RenameTable, 6), HOUR).await;

    harness.session.rename_table("Draft").await.unwrap();
    harness.session.rename_table("Final").await.unwrap();
    harness.session.wait_stable().await;

    assert_eq!(
        harness.session.with_state(|state| state.table_name().to_string()),
        "Final"
    );
    assert_eq!(harness.stored().await.table.name, "Final");
}

#[tokio::test]
async fn added_columns_can_be_edited_and_deleted_before_they_confirm() {
    let harness = Harness::open(as_is, HOUR).await;

    let column = harness
        .session
        .add_column("Notes", ColumnType::Text)
        .await
        .unwrap();
    harness.session.delete_column(column).await.unwrap();
    harness.session.wait_stable().await;

    assert!(harness.session.with_state(|state| state.column(column).is_none()));
    assert_eq!(harness.stored().await.columns.len(), 2);
}

#[tokio::test]
async fn invalid_names_are_rejected_before_anything_changes() {
    let harness = Harness::open(as_is, HOUR).await;

    let result = harness.session.rename_table("   ").await;

    assert!(matches!(result, Err(GridError::InvalidInput(_))));
    assert_eq!(
        harness.session.with_state(|state| state.table_name().to_string()),
        "Fixture"
    );
    assert_eq!(harness.session.in_flight(), 0);
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unsaved_view_changes_block_row_and_column_changes() {
    let harness = Harness::open(as_is, HOUR).await;

    harness
        .session
        .set_view_draft(ViewConfig {
            global_search: "acme".to_string(),
            ..ViewConfig::default()
        })
        .unwrap();
    assert!(harness.session.is_view_dirty());

    assert!(matches!(
        harness.session.add_row().await,
        Err(GridError::ViewDirty)
    ));
    assert!(matches!(
        harness.session.delete_column(harness.column(0)).await,
        Err(GridError::ViewDirty)
    ));

    harness.session.discard_view_draft();
    assert!(!harness.session.is_view_dirty());
    assert!(harness.session.add_row().await.is_ok());
}

#[tokio::test]
async fn saving_the_draft_persists_it() {
    let harness = Harness::open(as_is, HOUR).await;
    let draft = ViewConfig {
        global_search: "acme".to_string(),
        ..ViewConfig::default()
    };

    harness.session.set_view_draft(draft.clone()).unwrap();
    harness.session.save_view_draft().await.unwrap();
    assert!(!harness.session.is_view_dirty());
    harness.session.wait_stable().await;

    let stored = harness.stored().await;
    assert_eq!(stored.default_view().unwrap().config, draft);
}

#[tokio::test]
async fn declined_changes_are_never_applied() {
    let harness = Harness::open(as_is, HOUR).await;
    harness
        .session
        .set_policy(Arc::new(Refuse(MutationKind::DeleteRow)));

    let result = harness.session.delete_row(harness.row(0)).await;

    assert!(matches!(result, Err(GridError::Declined)));
    assert_eq!(harness.row_ids().len(), 3);
    assert!(harness.executor.records().is_empty());
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

#[tokio::test]
async fn a_new_default_view_takes_over_and_is_confirmed() {
    let harness = Harness::open(as_is, HOUR).await;

    let local_id = harness
        .session
        .create_view("Focus", ViewConfig::default(), true)
        .await
        .unwrap();
    harness.session.wait_stable().await;

    harness.session.with_state(|state| {
        let default = state.default_view().unwrap();
        assert_eq!(default.identity.local_id, local_id);
        assert!(!default.identity.is_optimistic());
        assert_eq!(state.views().filter(|view| view.is_default).count(), 1);
    });
}

#[tokio::test]
async fn a_failed_view_create_restores_the_previous_default() {
    let harness = Harness::open(|e| e.fail_always(MutationKind::CreateView), HOUR).await;
    let original: LocalId = harness.snapshot.views[0].id.as_uuid().into();

    let local_id = harness
        .session
        .create_view("Focus", ViewConfig::default(), true)
        .await
        .unwrap();
    harness.session.apply_view(local_id).unwrap();
    harness.session.wait_stable().await;

    harness.session.with_state(|state| {
        assert!(state.view(local_id).is_none());
        assert_eq!(state.default_view().unwrap().identity.local_id, original);
    });
    assert_eq!(harness.session.active_view(), Some(original));
}

#[tokio::test]
async fn deleting_the_active_view_falls_back_to_the_default() {
    let harness = Harness::open(as_is, HOUR).await;
    let original: LocalId = harness.snapshot.views[0].id.as_uuid().into();
    let side = harness
        .session
        .create_view("Side", ViewConfig::default(), false)
        .await
        .unwrap();
    harness.session.wait_stable().await;
    harness.session.apply_view(side).unwrap();

    harness.session.delete_view(side).await.unwrap();
    harness.session.wait_stable().await;

    assert_eq!(harness.session.active_view(), Some(original));
    assert_eq!(harness.stored().await.views.len(), 1);
}

#[tokio::test]
async fn renaming_a_view_is_reverted_on_failure() {
    let harness = Harness::open(|e| e.fail_always(MutationKind::UpdateView), HOUR).await;
    let view: LocalId = harness.snapshot.views[0].id.as_uuid().into();

    harness
        .session
        .update_view(
            view,
            ViewPatch {
                name: Some("Renamed".to_string()),
                ..ViewPatch::default()
            },
        )
        .await
        .unwrap();
    harness.session.wait_stable().await;

    assert_eq!(
        harness.session.with_state(|state| state.view(view).unwrap().name.clone()),
        gridflux_core::DEFAULT_VIEW_NAME
    );
}

#[tokio::test]
async fn a_failed_default_switch_keeps_a_later_confirmed_default() {
    let harness = Harness::open(|e| e.fail_next(MutationKind::UpdateView, 6), HOUR).await;
    let side = harness
        .session
        .create_view("Side", ViewConfig::default(), false)
        .await
        .unwrap();
    harness.session.wait_stable().await;

    harness
        .session
        .update_view(
            side,
            ViewPatch {
                is_default: Some(true),
                ..ViewPatch::default()
            },
        )
        .await
        .unwrap();
    let focus = harness
        .session
        .create_view("Focus", ViewConfig::default(), true)
        .await
        .unwrap();
    harness.session.wait_stable().await;

    harness.session.with_state(|state| {
        assert_eq!(state.default_view().unwrap().identity.local_id, focus);
        assert_eq!(state.views().filter(|view| view.is_default).count(), 1);
    });
    let stored = harness.stored().await;
    let defaults: Vec<_> = stored.views.iter().filter(|view| view.is_default).collect();
    assert_eq!(defaults.len(), 1);
    assert_eq!(defaults[0].name, "Focus");
}

// ---------------------------------------------------------------------------
// Cell batching
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_edits_to_a_cell_send_only_the_last_value() {
    let harness = Harness::open(as_is, HOUR).await;
    let (row, column) = (harness.row(0), harness.column(0));

    for value in ["A", "Ac", "Acme"] {
        harness.session.update_cell(row, column, value).unwrap();
    }
    assert_eq!(harness.session.pending_edits(), 1);

    assert_eq!(harness.session.flush_now().await.unwrap(), 1);
    assert_eq!(harness.session.close().await.unwrap(), 0);

    let stored = harness.stored().await;
    assert_eq!(stored.cells.len(), 1);
    assert_eq!(stored.cells[0].value, CellValue::from("Acme"));
}

#[tokio::test]
async fn edits_to_hidden_cells_are_rejected() {
    let harness = Harness::open(as_is, HOUR).await;

    let result = harness
        .session
        .update_cell(gridflux_core::OptimisticId::new(), harness.column(0), "x");

    assert!(matches!(result, Err(GridError::NotFound(_))));
    assert_eq!(harness.session.pending_edits(), 0);
}

#[tokio::test(start_paused = true)]
async fn edits_wait_for_structural_changes_to_settle() {
    let store = Arc::new(MemoryStore::new());
    let seeded = seed_table(store.as_ref(), &owner(), &["Name"], 1).await.unwrap();
    let table_id = seeded.table.id;
    let harness = Harness::open_with(
        store,
        seeded,
        move |e| e.delay_table(table_id, [Duration::from_secs(2)]),
        Duration::from_millis(300),
    );

    let new_row = harness.session.add_row().await.unwrap();
    harness
        .session
        .update_cell(new_row, harness.column(0), "fresh")
        .unwrap();
    harness
        .session
        .update_cell(harness.row(0), harness.column(0), "old")
        .unwrap();

    // Several flush ticks pass while the add is still running.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(harness.session.pending_edits(), 2);
    assert_eq!(harness.executor.attempts(MutationKind::UpdateCells), 0);

    harness.session.wait_stable().await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(harness.session.pending_edits(), 0);

    let kinds: Vec<MutationKind> = harness
        .executor
        .records()
        .iter()
        .map(|record| record.mutation.kind())
        .collect();
    assert_eq!(kinds, vec![MutationKind::AddRow, MutationKind::UpdateCells]);

    let stored = harness.stored().await;
    assert_eq!(stored.cells.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn close_sends_what_the_timer_has_not() {
    let harness = Harness::open(as_is, HOUR).await;
    harness
        .session
        .update_cell(harness.row(2), harness.column(1), 42.0)
        .unwrap();

    assert_eq!(harness.session.close().await.unwrap(), 1);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(harness.executor.attempts(MutationKind::UpdateCells), 1);
}

#[tokio::test]
async fn search_filters_rows_by_cell_text() {
    let harness = Harness::open(as_is, HOUR).await;
    harness
        .session
        .update_cell(harness.row(1), harness.column(0), "Acme Corp")
        .unwrap();

    let matches = harness.session.visible_rows("acme");

    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].identity.local_id, harness.row(1));
    assert_eq!(harness.session.visible_rows("").len(), 3);
}
