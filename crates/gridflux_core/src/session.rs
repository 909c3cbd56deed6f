use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::{
    BatchConfig, BatchSink, CancelToken, CellBatchWriter, CellChange, CellEdit, CellValue,
    ClientColumn, ClientRow, ClientView, ColumnType, GridError, GridState, LocalId, Mutation,
    MutationOutcome, MutationSubmitter, Provisional, Removed, Settlement, StructureGate,
    StructureGuard, TableId, TableSnapshot, ViewConfig, ViewPatch,
};

/// Prompt-before-submit hook for structural changes.
pub trait SubmitPolicy: Send + Sync {
    fn confirm(&self, mutation: &Mutation) -> bool;
}

pub struct AcceptAll;

impl SubmitPolicy for AcceptAll {
    fn confirm(&self, _mutation: &Mutation) -> bool {
        true
    }
}

struct ActiveView {
    local_id: LocalId,
    draft: ViewConfig,
}

/// A single value in client state that a change can overwrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Field {
    ColumnLabel(LocalId),
    TableName,
    ViewName(LocalId),
    ViewConfig(LocalId),
    DefaultView,
}

#[derive(Debug, Clone, PartialEq)]
enum FieldValue {
    Text(String),
    Config(ViewConfig),
    View(Option<LocalId>),
}

impl Field {
    fn read(self, state: &GridState) -> Option<FieldValue> {
        match self {
            Field::ColumnLabel(id) => state
                .column(id)
                .map(|column| FieldValue::Text(column.label.clone())),
            Field::TableName => Some(FieldValue::Text(state.table_name().to_string())),
            Field::ViewName(id) => state.view(id).map(|view| FieldValue::Text(view.name.clone())),
            Field::ViewConfig(id) => state
                .view(id)
                .map(|view| FieldValue::Config(view.config.clone())),
            Field::DefaultView => Some(FieldValue::View(
                state.default_view().map(|view| view.identity.local_id),
            )),
        }
    }

    fn write(self, state: &mut GridState, value: FieldValue) {
        match (self, value) {
            (Field::ColumnLabel(id), FieldValue::Text(label)) => {
                state.rename_column(id, label);
            }
            (Field::TableName, FieldValue::Text(name)) => {
                state.set_table_name(name);
            }
            (Field::ViewName(id), FieldValue::Text(name)) => {
                if let Some(mut view) = state.view(id).cloned() {
                    view.name = name;
                    state.replace_view(view);
                }
            }
            (Field::ViewConfig(id), FieldValue::Config(config)) => {
                if let Some(mut view) = state.view(id).cloned() {
                    view.config = config;
                    state.replace_view(view);
                }
            }
            (Field::DefaultView, FieldValue::View(id)) => state.set_default_view(id),
            (field, value) => log::warn!("[SESSION] cannot write {value:?} to {field:?}"),
        }
    }
}

/// `previous` is put back only while the field still shows `written`.
struct Revert {
    field: Field,
    previous: FieldValue,
    written: FieldValue,
}

impl Revert {
    fn new(field: Field, previous: FieldValue, written: FieldValue) -> Self {
        Self {
            field,
            previous,
            written,
        }
    }
}

/// How to undo an optimistic change if its mutation never lands.
enum Undo {
    AddRow(LocalId),
    AddColumn(LocalId),
    DeleteRow(Removed<ClientRow>),
    DeleteColumn(Removed<ClientColumn>),
    Overwrite(Vec<Revert>),
    DeleteTable,
    CreateView {
        local_id: LocalId,
        made_default: bool,
        previous_default: Option<LocalId>,
    },
    DeleteView {
        index: usize,
        view: ClientView,
    },
}

struct SessionInner {
    submitter: Arc<dyn MutationSubmitter>,
    state: Mutex<GridState>,
    /// Value to fall back to for a field whose failed change was already
    /// covered by a newer one. Cleared when a change to the field lands.
    superseded: Mutex<HashMap<Field, FieldValue>>,
    active_view: Mutex<Option<ActiveView>>,
    policy: Mutex<Arc<dyn SubmitPolicy>>,
    gate: StructureGate,
    writer: Arc<CellBatchWriter>,
    runtime: Handle,
}

impl SessionInner {
    fn state(&self) -> MutexGuard<'_, GridState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poison_error) => poison_error.into_inner(),
        }
    }

    fn superseded(&self) -> MutexGuard<'_, HashMap<Field, FieldValue>> {
        match self.superseded.lock() {
            Ok(guard) => guard,
            Err(poison_error) => poison_error.into_inner(),
        }
    }

    fn active_view(&self) -> MutexGuard<'_, Option<ActiveView>> {
        match self.active_view.lock() {
            Ok(guard) => guard,
            Err(poison_error) => poison_error.into_inner(),
        }
    }

    fn is_view_dirty(&self) -> bool {
        let (local_id, draft) = match &*self.active_view() {
            Some(active) => (active.local_id, active.draft.clone()),
            None => return false,
        };

        self.state()
            .view(local_id)
            .is_some_and(|view| view.config != draft)
    }

    fn ensure_view_clean(&self) -> Result<(), GridError> {
        if self.is_view_dirty() {
            Err(GridError::ViewDirty)
        } else {
            Ok(())
        }
    }

    fn confirm(&self, mutation: &Mutation) -> Result<(), GridError> {
        let policy = match self.policy.lock() {
            Ok(guard) => Arc::clone(&guard),
            Err(poison_error) => Arc::clone(&poison_error.into_inner()),
        };

        if policy.confirm(mutation) {
            Ok(())
        } else {
            log::info!("[SESSION] {} declined", mutation.kind().label());
            Err(GridError::Declined)
        }
    }

    fn settle(&self, undo: Undo, settlement: Settlement) {
        match settlement {
            Ok(outcome) => {
                self.commit(outcome);
                let mut superseded = self.superseded();
                match &undo {
                    Undo::Overwrite(reverts) => {
                        for revert in reverts {
                            superseded.remove(&revert.field);
                        }
                    }
                    Undo::CreateView {
                        made_default: true,
                        ..
                    } => {
                        superseded.remove(&Field::DefaultView);
                    }
                    _ => {}
                }
            }
            Err(failure) => {
                log::warn!("[SESSION] rolling back: {failure}");
                self.roll_back(undo);
            }
        }
    }

    fn commit(&self, outcome: MutationOutcome) {
        let mut state = self.state();

        let confirmed = match outcome {
            MutationOutcome::RowCreated { optimistic_id, row } => {
                state.confirm_row(optimistic_id, row.id)
            }
            MutationOutcome::ColumnCreated {
                optimistic_id,
                column,
            } => state.confirm_column(optimistic_id, column.id),
            MutationOutcome::ViewCreated {
                optimistic_id: Some(optimistic_id),
                view,
            } => state.confirm_view(optimistic_id, view.id),
            _ => true,
        };

        if !confirmed {
            log::debug!("[SESSION] confirmed entity was removed locally before it settled");
        }
    }

    fn roll_back(&self, undo: Undo) {
        let mut state = self.state();

        match undo {
            Undo::AddRow(local_id) => {
                state.remove_row(local_id);
                self.writer.discard_referencing(local_id);
            }
            Undo::AddColumn(local_id) => {
                state.remove_column(local_id);
                self.writer.discard_referencing(local_id);
            }
            Undo::DeleteRow(removed) => state.restore_row(removed),
            Undo::DeleteColumn(removed) => state.restore_column(removed),
            Undo::Overwrite(reverts) => {
                let mut superseded = self.superseded();
                for revert in reverts {
                    match revert.field.read(&state) {
                        Some(shown) if shown == revert.written => {
                            let previous = superseded
                                .remove(&revert.field)
                                .unwrap_or(revert.previous);
                            revert.field.write(&mut state, previous);
                        }
                        Some(_) => {
                            log::debug!(
                                "[SESSION] {:?} changed again since; keeping the newer value",
                                revert.field
                            );
                            superseded.entry(revert.field).or_insert(revert.previous);
                        }
                        None => {}
                    }
                }
            }
            Undo::DeleteTable => {
                log::error!("[SESSION] table {} could not be deleted", state.table_id());
            }
            Undo::CreateView {
                local_id,
                made_default,
                previous_default,
            } => {
                let still_default = state
                    .default_view()
                    .is_some_and(|view| view.identity.local_id == local_id);
                state.remove_view(local_id);
                if made_default && still_default {
                    let fallback = match self.superseded().remove(&Field::DefaultView) {
                        Some(FieldValue::View(id)) => id,
                        _ => previous_default,
                    };
                    state.set_default_view(fallback);
                }
                drop(state);
                self.reset_active_view_if(local_id);
            }
            Undo::DeleteView { index, view } => state.restore_view(index, view),
        }
    }

    /// Falls back to the default view when the active one disappears.
    fn reset_active_view_if(&self, removed: LocalId) {
        let fallback = self.state().default_view().map(|view| ActiveView {
            local_id: view.identity.local_id,
            draft: view.config.clone(),
        });

        let mut active = self.active_view();
        if active.as_ref().is_some_and(|view| view.local_id == removed) {
            *active = fallback;
        }
    }

    async fn submit_edits(&self, edits: Vec<CellEdit>) -> Result<usize, GridError> {
        let total = edits.len();
        let (table_id, changes) = {
            let state = self.state();
            let changes: Vec<CellChange> = edits
                .into_iter()
                .filter_map(|edit| {
                    let row = state.row(edit.row)?.identity.target();
                    let column = state.column(edit.column)?.identity.target();
                    Some(CellChange {
                        row,
                        column,
                        value: edit.value,
                    })
                })
                .collect();
            (state.table_id(), changes)
        };

        if changes.len() < total {
            log::debug!(
                "[SESSION] skipped {} edit(s) for removed rows or columns",
                total - changes.len()
            );
        }
        if changes.is_empty() {
            return Ok(0);
        }

        let count = changes.len();
        let ticket = self
            .submitter
            .submit(Mutation::UpdateCells { table_id, changes })
            .await?;

        self.runtime.spawn(async move {
            if let Err(failure) = ticket.settled().await {
                log::error!("[SESSION] cell edits were not saved: {failure}");
            }
        });

        log::debug!("[SESSION] submitted {count} cell edit(s)");
        Ok(count)
    }
}

#[async_trait]
impl BatchSink for SessionInner {
    async fn flush(&self, edits: Vec<CellEdit>) -> Result<(), GridError> {
        self.submit_edits(edits).await.map(|_| ())
    }
}

/// Client-side coordinator for one open table.
///
/// Every change is applied to the local [`GridState`] immediately and then
/// submitted. Structural changes are reconciled when their mutation settles:
/// adds get their server id, failures are undone. Cell edits go through the
/// batch writer and are only sent while no structural change is in flight.
pub struct GridSession {
    inner: Arc<SessionInner>,
    cancel: CancelToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl GridSession {
    pub fn open(
        snapshot: &TableSnapshot,
        submitter: Arc<dyn MutationSubmitter>,
        config: &BatchConfig,
    ) -> Result<Self, GridError> {
        let runtime = Handle::try_current()
            .map_err(|e| GridError::QueueUnavailable(format!("no tokio runtime: {e}")))?;

        let state = GridState::from_snapshot(snapshot);
        let active_view = state.default_view().map(|view| ActiveView {
            local_id: view.identity.local_id,
            draft: view.config.clone(),
        });

        let gate = StructureGate::new();
        let writer = Arc::new(CellBatchWriter::new(gate.clone()));
        let inner = Arc::new(SessionInner {
            submitter,
            state: Mutex::new(state),
            superseded: Mutex::new(HashMap::new()),
            active_view: Mutex::new(active_view),
            policy: Mutex::new(Arc::new(AcceptAll)),
            gate,
            writer: Arc::clone(&writer),
            runtime: runtime.clone(),
        });

        let cancel = CancelToken::new();
        let flusher = writer.spawn_flush_loop(
            inner.clone(),
            config.flush_interval(),
            cancel.clone(),
            &runtime,
        );

        log::info!(
            "[SESSION] opened table {} ({} rows, {} columns)",
            snapshot.table.id,
            snapshot.rows.len(),
            snapshot.columns.len()
        );

        Ok(Self {
            inner,
            cancel,
            flusher: Mutex::new(Some(flusher)),
        })
    }

    pub fn set_policy(&self, policy: Arc<dyn SubmitPolicy>) {
        match self.inner.policy.lock() {
            Ok(mut guard) => *guard = policy,
            Err(poison_error) => *poison_error.into_inner() = policy,
        }
    }

    pub fn table_id(&self) -> TableId {
        self.inner.state().table_id()
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&GridState) -> R) -> R {
        f(&self.inner.state())
    }

    pub fn visible_rows(&self, search: &str) -> Vec<ClientRow> {
        self.inner
            .state()
            .visible_rows(search)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn pending_edits(&self) -> usize {
        self.inner.writer.pending()
    }

    /// Structural mutations submitted but not yet reconciled.
    pub fn in_flight(&self) -> usize {
        self.inner.gate.in_flight()
    }

    async fn dispatch(
        &self,
        mutation: Mutation,
        undo: Undo,
        guard: StructureGuard,
    ) -> Result<(), GridError> {
        match self.inner.submitter.submit(mutation).await {
            Ok(ticket) => {
                let inner = Arc::clone(&self.inner);
                self.inner.runtime.spawn(async move {
                    let settlement = ticket.settled().await;
                    inner.settle(undo, settlement);
                    drop(guard);
                });
                Ok(())
            }
            Err(error) => {
                self.inner.roll_back(undo);
                Err(error)
            }
        }
    }

    // === Rows and columns ===

    pub async fn add_row(&self) -> Result<LocalId, GridError> {
        self.inner.ensure_view_clean()?;

        let identity = Provisional::pending();
        let (table_id, order) = {
            let state = self.inner.state();
            (state.table_id(), state.next_row_order())
        };
        let mutation = Mutation::AddRow {
            table_id,
            optimistic_id: identity.local_id,
            order,
        };
        self.inner.confirm(&mutation)?;

        let guard = self.inner.gate.begin();
        self.inner.state().insert_row(ClientRow { identity, order });

        self.dispatch(mutation, Undo::AddRow(identity.local_id), guard)
            .await?;
        Ok(identity.local_id)
    }

    pub async fn add_column(
        &self,
        label: &str,
        column_type: ColumnType,
    ) -> Result<LocalId, GridError> {
        self.inner.ensure_view_clean()?;

        let identity = Provisional::pending();
        let (table_id, order) = {
            let state = self.inner.state();
            (state.table_id(), state.next_column_order())
        };
        let mutation = Mutation::AddColumn {
            table_id,
            optimistic_id: identity.local_id,
            label: label.to_string(),
            order,
            column_type,
        };
        mutation.validate()?;
        self.inner.confirm(&mutation)?;

        let guard = self.inner.gate.begin();
        self.inner.state().insert_column(ClientColumn {
            identity,
            label: label.to_string(),
            order,
            column_type,
        });

        self.dispatch(mutation, Undo::AddColumn(identity.local_id), guard)
            .await?;
        Ok(identity.local_id)
    }

    pub async fn delete_row(&self, local_id: LocalId) -> Result<(), GridError> {
        self.inner.ensure_view_clean()?;

        let mutation = {
            let state = self.inner.state();
            let row = state
                .row(local_id)
                .ok_or_else(|| GridError::NotFound(format!("row {local_id}")))?;
            Mutation::DeleteRow {
                table_id: state.table_id(),
                row: row.identity.target(),
            }
        };
        self.inner.confirm(&mutation)?;

        let guard = self.inner.gate.begin();
        let removed = self
            .inner
            .state()
            .remove_row(local_id)
            .ok_or_else(|| GridError::NotFound(format!("row {local_id}")))?;
        self.inner.writer.discard_referencing(local_id);

        self.dispatch(mutation, Undo::DeleteRow(removed), guard).await
    }

    pub async fn delete_column(&self, local_id: LocalId) -> Result<(), GridError> {
        self.inner.ensure_view_clean()?;

        let mutation = {
            let state = self.inner.state();
            let column = state
                .column(local_id)
                .ok_or_else(|| GridError::NotFound(format!("column {local_id}")))?;
            Mutation::DeleteColumn {
                table_id: state.table_id(),
                column: column.identity.target(),
            }
        };
        self.inner.confirm(&mutation)?;

        let guard = self.inner.gate.begin();
        let removed = self
            .inner
            .state()
            .remove_column(local_id)
            .ok_or_else(|| GridError::NotFound(format!("column {local_id}")))?;
        self.inner.writer.discard_referencing(local_id);

        self.dispatch(mutation, Undo::DeleteColumn(removed), guard)
            .await
    }

    pub async fn rename_column(&self, local_id: LocalId, label: &str) -> Result<(), GridError> {
        self.inner.ensure_view_clean()?;

        let mutation = {
            let state = self.inner.state();
            let column = state
                .column(local_id)
                .ok_or_else(|| GridError::NotFound(format!("column {local_id}")))?;
            Mutation::RenameColumn {
                table_id: state.table_id(),
                column: column.identity.target(),
                label: label.to_string(),
            }
        };
        mutation.validate()?;
        self.inner.confirm(&mutation)?;

        let guard = self.inner.gate.begin();
        let previous = self
            .inner
            .state()
            .rename_column(local_id, label)
            .ok_or_else(|| GridError::NotFound(format!("column {local_id}")))?;

        let revert = Revert::new(
            Field::ColumnLabel(local_id),
            FieldValue::Text(previous),
            FieldValue::Text(label.to_string()),
        );
        self.dispatch(mutation, Undo::Overwrite(vec![revert]), guard)
            .await
    }

    // === Table ===

    pub async fn rename_table(&self, name: &str) -> Result<(), GridError> {
        let mutation = Mutation::RenameTable {
            table_id: self.table_id(),
            name: name.to_string(),
        };
        mutation.validate()?;
        self.inner.confirm(&mutation)?;

        let guard = self.inner.gate.begin();
        let previous = self.inner.state().set_table_name(name);

        let revert = Revert::new(
            Field::TableName,
            FieldValue::Text(previous),
            FieldValue::Text(name.to_string()),
        );
        self.dispatch(mutation, Undo::Overwrite(vec![revert]), guard)
            .await
    }

    /// Pending cell edits are dropped; the table is going away.
    pub async fn delete_table(&self) -> Result<(), GridError> {
        let mutation = Mutation::DeleteTable {
            table_id: self.table_id(),
        };
        self.inner.confirm(&mutation)?;

        let guard = self.inner.gate.begin();
        let dropped = self.inner.writer.clear();
        if dropped > 0 {
            log::debug!("[SESSION] dropped {dropped} pending edit(s) of deleted table");
        }

        self.dispatch(mutation, Undo::DeleteTable, guard).await
    }

    // === Views ===

    pub async fn create_view(
        &self,
        name: &str,
        config: ViewConfig,
        is_default: bool,
    ) -> Result<LocalId, GridError> {
        let identity = Provisional::pending();
        let mutation = Mutation::CreateView {
            table_id: self.table_id(),
            optimistic_id: Some(identity.local_id),
            name: name.to_string(),
            config: config.clone(),
            is_default,
        };
        mutation.validate()?;
        self.inner.confirm(&mutation)?;

        let guard = self.inner.gate.begin();
        let previous_default = {
            let mut state = self.inner.state();
            let previous_default = state.default_view().map(|view| view.identity.local_id);
            state.insert_view(ClientView {
                identity,
                name: name.to_string(),
                config,
                is_default,
            });
            previous_default
        };

        let undo = Undo::CreateView {
            local_id: identity.local_id,
            made_default: is_default,
            previous_default,
        };
        self.dispatch(mutation, undo, guard).await?;
        Ok(identity.local_id)
    }

    pub async fn update_view(&self, local_id: LocalId, patch: ViewPatch) -> Result<(), GridError> {
        let (mutation, previous, previous_default) = {
            let state = self.inner.state();
            let view = state
                .view(local_id)
                .ok_or_else(|| GridError::NotFound(format!("view {local_id}")))?;
            let mutation = Mutation::UpdateView {
                table_id: state.table_id(),
                view: view.identity.target(),
                patch: patch.clone(),
            };
            let previous_default = state.default_view().map(|view| view.identity.local_id);
            (mutation, view.clone(), previous_default)
        };
        mutation.validate()?;
        self.inner.confirm(&mutation)?;

        let guard = self.inner.gate.begin();

        let mut updated = previous.clone();
        if let Some(name) = &patch.name {
            updated.name = name.clone();
        }
        if let Some(config) = &patch.config {
            updated.config = config.clone();
        }
        if let Some(is_default) = patch.is_default {
            updated.is_default = is_default;
        }
        let mut reverts = Vec::new();
        if let Some(name) = &patch.name {
            reverts.push(Revert::new(
                Field::ViewName(local_id),
                FieldValue::Text(previous.name.clone()),
                FieldValue::Text(name.clone()),
            ));
        }
        if let Some(config) = &patch.config {
            reverts.push(Revert::new(
                Field::ViewConfig(local_id),
                FieldValue::Config(previous.config.clone()),
                FieldValue::Config(config.clone()),
            ));
        }

        {
            let mut state = self.inner.state();
            state.replace_view(updated);
            if patch.is_default.is_some() {
                let written = state.default_view().map(|view| view.identity.local_id);
                reverts.push(Revert::new(
                    Field::DefaultView,
                    FieldValue::View(previous_default),
                    FieldValue::View(written),
                ));
            }
        }

        if let Some(config) = &patch.config
            && let Some(active) = self.inner.active_view().as_mut()
            && active.local_id == local_id
        {
            active.draft = config.clone();
        }

        self.dispatch(mutation, Undo::Overwrite(reverts), guard)
            .await
    }

    pub async fn delete_view(&self, local_id: LocalId) -> Result<(), GridError> {
        let mutation = {
            let state = self.inner.state();
            let view = state
                .view(local_id)
                .ok_or_else(|| GridError::NotFound(format!("view {local_id}")))?;
            Mutation::DeleteView {
                table_id: state.table_id(),
                view: view.identity.target(),
            }
        };
        self.inner.confirm(&mutation)?;

        let guard = self.inner.gate.begin();
        let (index, view) = self
            .inner
            .state()
            .remove_view(local_id)
            .ok_or_else(|| GridError::NotFound(format!("view {local_id}")))?;
        self.inner.reset_active_view_if(local_id);

        self.dispatch(mutation, Undo::DeleteView { index, view }, guard)
            .await
    }

    pub fn apply_view(&self, local_id: LocalId) -> Result<(), GridError> {
        let config = self
            .inner
            .state()
            .view(local_id)
            .map(|view| view.config.clone())
            .ok_or_else(|| GridError::NotFound(format!("view {local_id}")))?;

        *self.inner.active_view() = Some(ActiveView {
            local_id,
            draft: config,
        });
        Ok(())
    }

    pub fn active_view(&self) -> Option<LocalId> {
        self.inner.active_view().as_ref().map(|view| view.local_id)
    }

    pub fn view_draft(&self) -> Option<ViewConfig> {
        self.inner
            .active_view()
            .as_ref()
            .map(|view| view.draft.clone())
    }

    pub fn set_view_draft(&self, config: ViewConfig) -> Result<(), GridError> {
        match self.inner.active_view().as_mut() {
            Some(active) => {
                active.draft = config;
                Ok(())
            }
            None => Err(GridError::NotFound("no active view".to_string())),
        }
    }

    pub fn is_view_dirty(&self) -> bool {
        self.inner.is_view_dirty()
    }

    pub fn discard_view_draft(&self) {
        let Some(local_id) = self.active_view() else {
            return;
        };
        let saved = self
            .inner
            .state()
            .view(local_id)
            .map(|view| view.config.clone());

        if let Some(config) = saved
            && let Some(active) = self.inner.active_view().as_mut()
        {
            active.draft = config;
        }
    }

    /// Persists the active view's draft configuration.
    pub async fn save_view_draft(&self) -> Result<(), GridError> {
        let (local_id, draft) = self
            .inner
            .active_view()
            .as_ref()
            .map(|view| (view.local_id, view.draft.clone()))
            .ok_or_else(|| GridError::NotFound("no active view".to_string()))?;

        let patch = ViewPatch {
            config: Some(draft),
            ..ViewPatch::default()
        };
        self.update_view(local_id, patch).await
    }

    // === Content ===

    /// Shows the value at once and queues it for the next batch.
    pub fn update_cell(
        &self,
        row: LocalId,
        column: LocalId,
        value: impl Into<CellValue>,
    ) -> Result<(), GridError> {
        let value = value.into();
        if !self.inner.state().set_cell(row, column, value.clone()) {
            return Err(GridError::NotFound(format!("cell {row}/{column}")));
        }

        self.inner.writer.push(CellEdit { row, column, value });
        Ok(())
    }

    // === Lifecycle ===

    pub async fn wait_stable(&self) {
        self.inner.gate.wait_stable().await;
    }

    /// Submits buffered edits now if no structural change is in flight.
    pub async fn flush_now(&self) -> Result<usize, GridError> {
        match self.inner.writer.take_ready() {
            Some(edits) => self.inner.submit_edits(edits).await,
            None => Ok(0),
        }
    }

    /// Waits for structural changes to settle, stops the timer and sends
    /// whatever edits remain.
    pub async fn close(&self) -> Result<usize, GridError> {
        self.wait_stable().await;

        self.cancel.cancel();
        self.inner.writer.wake();
        let flusher = match self.flusher.lock() {
            Ok(mut guard) => guard.take(),
            Err(poison_error) => poison_error.into_inner().take(),
        };
        if let Some(flusher) = flusher
            && let Err(error) = flusher.await
        {
            log::warn!("[SESSION] flush loop ended abnormally: {error}");
        }

        let sent = self.flush_now().await?;
        log::info!("[SESSION] closed table {}", self.table_id());
        Ok(sent)
    }
}

impl Drop for GridSession {
    fn drop(&mut self) {
        self.cancel.cancel();
        let flusher = match self.flusher.get_mut() {
            Ok(flusher) => flusher.take(),
            Err(poison_error) => poison_error.into_inner().take(),
        };
        if let Some(flusher) = flusher {
            flusher.abort();
        }
    }
}
