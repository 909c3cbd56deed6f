use async_trait::async_trait;
use gridflux_core::{
    GridError, Mutation, MutationExecutor, MutationKind, MutationOutcome, TableId,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub mutation: Mutation,
    pub succeeded: bool,
}

#[derive(Default)]
struct ScriptState {
    records: Vec<ExecutionRecord>,
    failures: HashMap<MutationKind, usize>,
    always_fail: Vec<MutationKind>,
    delays: HashMap<TableId, VecDeque<Duration>>,
    running: HashMap<TableId, usize>,
    running_total: usize,
    max_per_table: usize,
    max_total: usize,
}

/// Executor double that records every call and can be told to fail or stall.
///
/// Without an inner executor every successful call returns
/// `MutationOutcome::Applied`.
#[derive(Clone)]
pub struct ScriptedExecutor {
    inner: Option<Arc<dyn MutationExecutor>>,
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            inner: None,
            state: Arc::new(Mutex::new(ScriptState::default())),
        }
    }

    pub fn wrapping(inner: Arc<dyn MutationExecutor>) -> Self {
        Self {
            inner: Some(inner),
            state: Arc::new(Mutex::new(ScriptState::default())),
        }
    }

    pub fn fail_next(self, kind: MutationKind, times: usize) -> Self {
        *mutex_lock(&self.state).failures.entry(kind).or_default() += times;
        self
    }

    pub fn fail_always(self, kind: MutationKind) -> Self {
        mutex_lock(&self.state).always_fail.push(kind);
        self
    }

    /// Each delay is consumed by one call on the table, in order.
    pub fn delay_table(
        self,
        table_id: TableId,
        delays: impl IntoIterator<Item = Duration>,
    ) -> Self {
        mutex_lock(&self.state)
            .delays
            .entry(table_id)
            .or_default()
            .extend(delays);
        self
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        mutex_lock(&self.state).records.clone()
    }

    pub fn attempts(&self, kind: MutationKind) -> usize {
        mutex_lock(&self.state)
            .records
            .iter()
            .filter(|record| record.mutation.kind() == kind)
            .count()
    }

    /// Successful mutations of one table, in execution order.
    pub fn applied_on(&self, table_id: TableId) -> Vec<Mutation> {
        mutex_lock(&self.state)
            .records
            .iter()
            .filter(|record| record.succeeded && record.mutation.table_id() == table_id)
            .map(|record| record.mutation.clone())
            .collect()
    }

    /// Most calls ever running at once on a single table.
    pub fn max_concurrent_per_table(&self) -> usize {
        mutex_lock(&self.state).max_per_table
    }

    /// Most calls ever running at once across all tables.
    pub fn max_concurrent_total(&self) -> usize {
        mutex_lock(&self.state).max_total
    }

    fn begin(&self, table_id: TableId) -> (RunningGuard, Option<Duration>) {
        let mut state = mutex_lock(&self.state);
        let running = {
            let running = state.running.entry(table_id).or_default();
            *running += 1;
            *running
        };
        state.running_total += 1;
        state.max_per_table = state.max_per_table.max(running);
        state.max_total = state.max_total.max(state.running_total);
        let delay = state
            .delays
            .get_mut(&table_id)
            .and_then(|delays| delays.pop_front());

        let guard = RunningGuard {
            state: Arc::clone(&self.state),
            table_id,
        };
        (guard, delay)
    }

    fn finish(&self, mutation: &Mutation, succeeded: bool) {
        mutex_lock(&self.state).records.push(ExecutionRecord {
            mutation: mutation.clone(),
            succeeded,
        });
    }

    fn scripted_failure(&self, kind: MutationKind) -> bool {
        let mut state = mutex_lock(&self.state);
        if state.always_fail.contains(&kind) {
            return true;
        }
        match state.failures.get_mut(&kind) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MutationExecutor for ScriptedExecutor {
    async fn execute(&self, mutation: &Mutation) -> Result<MutationOutcome, GridError> {
        // Dropped even when the queue times the call out mid-sleep.
        let (_running, delay) = self.begin(mutation.table_id());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = if self.scripted_failure(mutation.kind()) {
            Err(GridError::storage(format!(
                "scripted failure for {}",
                mutation.kind().label()
            )))
        } else {
            match &self.inner {
                Some(inner) => inner.execute(mutation).await,
                None => Ok(MutationOutcome::Applied),
            }
        };

        self.finish(mutation, result.is_ok());
        result
    }
}

struct RunningGuard {
    state: Arc<Mutex<ScriptState>>,
    table_id: TableId,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut state = mutex_lock(&self.state);
        if let Some(running) = state.running.get_mut(&self.table_id) {
            *running = running.saturating_sub(1);
        }
        state.running_total = state.running_total.saturating_sub(1);
    }
}

fn mutex_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poison_error) => poison_error.into_inner(),
    }
}
