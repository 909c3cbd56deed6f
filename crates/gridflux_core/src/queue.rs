use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::SendError};
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

use crate::{
    GridError, Mutation, MutationExecutor, MutationId, MutationKind, MutationOutcome,
    MutationTracker, OptimisticId, QueueConfig, TableId,
};

/// A mutation that exhausted its attempts and was dropped from its table's queue.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{} on table {table_id} dropped after {attempts} attempts: {reason}", .kind.label())]
pub struct MutationFailure {
    pub mutation_id: MutationId,
    pub kind: MutationKind,
    pub table_id: TableId,
    pub attempts: u32,
    pub reason: String,
}

pub type Settlement = Result<MutationOutcome, MutationFailure>;

/// Handle returned by `enqueue`; resolves once the mutation completes or is dropped.
#[derive(Debug)]
pub struct MutationTicket {
    pub mutation_id: MutationId,
    pub kind: MutationKind,
    pub table_id: TableId,
    pub optimistic_id: Option<OptimisticId>,
    receiver: oneshot::Receiver<Settlement>,
}

impl MutationTicket {
    pub async fn settled(self) -> Settlement {
        match self.receiver.await {
            Ok(settlement) => settlement,
            Err(_) => Err(MutationFailure {
                mutation_id: self.mutation_id,
                kind: self.kind,
                table_id: self.table_id,
                attempts: 0,
                reason: "queue worker stopped before settling".to_string(),
            }),
        }
    }
}

struct QueueItem {
    id: MutationId,
    mutation: Mutation,
    created_at: Instant,
    attempt: u32,
    reply: oneshot::Sender<Settlement>,
}

struct TableQueue {
    sender: UnboundedSender<QueueItem>,
    pending: usize,
}

struct QueueInner {
    executor: Arc<dyn MutationExecutor>,
    config: QueueConfig,
    tables: Mutex<HashMap<TableId, TableQueue>>,
    tracker: Mutex<MutationTracker>,
    active_workers: watch::Sender<usize>,
    runtime: Handle,
}

/// Serializes mutations per table.
///
/// Each table with pending work has exactly one worker task draining its
/// channel in submission order. A worker exits as soon as its channel is
/// empty, so idle tables cost nothing. Tables never wait on each other.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<QueueInner>,
}

impl QueueManager {
    /// Must be called from inside a tokio runtime; workers are spawned onto it.
    pub fn new(
        executor: Arc<dyn MutationExecutor>,
        config: QueueConfig,
    ) -> Result<Self, GridError> {
        let runtime = Handle::try_current()
            .map_err(|e| GridError::QueueUnavailable(format!("no tokio runtime: {e}")))?;
        Ok(Self::with_handle(executor, config, runtime))
    }

    pub fn with_handle(
        executor: Arc<dyn MutationExecutor>,
        config: QueueConfig,
        runtime: Handle,
    ) -> Self {
        let (active_workers, _) = watch::channel(0);

        Self {
            inner: Arc::new(QueueInner {
                executor,
                config,
                tables: Mutex::new(HashMap::new()),
                tracker: Mutex::new(MutationTracker::new()),
                active_workers,
                runtime,
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Appends the mutation to its table's queue and returns without waiting.
    pub fn enqueue(&self, mutation: Mutation) -> MutationTicket {
        let (reply, receiver) = oneshot::channel();
        let id = Uuid::new_v4();
        let table_id = mutation.table_id();
        let kind = mutation.kind();
        let optimistic_id = mutation.optimistic_id();

        self.inner.tracker().queued(id, kind, table_id);

        let item = QueueItem {
            id,
            mutation,
            created_at: Instant::now(),
            attempt: 0,
            reply,
        };

        let mut tables = self.inner.lock_tables();

        let item = match tables.get_mut(&table_id) {
            Some(queue) => match queue.sender.send(item) {
                Ok(()) => {
                    queue.pending += 1;
                    None
                }
                Err(SendError(item)) => {
                    log::warn!("[QUEUE] worker for table {table_id} is gone, restarting");
                    tables.remove(&table_id);
                    self.inner.active_workers.send_modify(|n| *n = n.saturating_sub(1));
                    Some(item)
                }
            },
            None => Some(item),
        };

        if let Some(item) = item {
            let (sender, worker_receiver) = mpsc::unbounded_channel();
            // Receiver is alive, send cannot fail.
            let _ = sender.send(item);
            tables.insert(table_id, TableQueue { sender, pending: 1 });
            self.inner.active_workers.send_modify(|n| *n += 1);

            let inner = Arc::clone(&self.inner);
            self.inner
                .runtime
                .spawn(drain_table(inner, table_id, worker_receiver));
        }

        drop(tables);

        log::debug!("[QUEUE] enqueued {} {id} on table {table_id}", kind.label());

        MutationTicket {
            mutation_id: id,
            kind,
            table_id,
            optimistic_id,
            receiver,
        }
    }

    /// Mutations of the table not yet settled, including the one running.
    pub fn pending(&self, table_id: TableId) -> usize {
        self.inner
            .lock_tables()
            .get(&table_id)
            .map(|queue| queue.pending)
            .unwrap_or(0)
    }

    pub fn active_tables(&self) -> Vec<TableId> {
        self.inner.lock_tables().keys().copied().collect()
    }

    /// Resolves once no table has a running worker.
    pub async fn wait_idle(&self) {
        let mut active = self.inner.active_workers.subscribe();
        let _ = active.wait_for(|count| *count == 0).await;
    }

    pub fn with_tracker<R>(&self, f: impl FnOnce(&mut MutationTracker) -> R) -> R {
        f(&mut self.inner.tracker())
    }
}

impl QueueInner {
    fn lock_tables(&self) -> MutexGuard<'_, HashMap<TableId, TableQueue>> {
        match self.tables.lock() {
            Ok(guard) => guard,
            Err(poison_error) => poison_error.into_inner(),
        }
    }

    fn tracker(&self) -> MutexGuard<'_, MutationTracker> {
        match self.tracker.lock() {
            Ok(guard) => guard,
            Err(poison_error) => poison_error.into_inner(),
        }
    }

    /// Takes the next item, or retires the worker if the channel is empty.
    ///
    /// Runs under the table lock so an enqueue cannot slip in between the
    /// empty check and the removal of the table entry.
    fn next_item(
        &self,
        table_id: TableId,
        receiver: &mut UnboundedReceiver<QueueItem>,
    ) -> Option<QueueItem> {
        let mut tables = self.lock_tables();

        match receiver.try_recv() {
            Ok(item) => Some(item),
            Err(_) => {
                tables.remove(&table_id);
                self.active_workers.send_modify(|n| *n = n.saturating_sub(1));
                None
            }
        }
    }

    fn item_settled(&self, table_id: TableId) {
        if let Some(queue) = self.lock_tables().get_mut(&table_id) {
            queue.pending = queue.pending.saturating_sub(1);
        }
    }

    async fn run_item(&self, item: QueueItem) {
        let QueueItem {
            id,
            mutation,
            created_at,
            mut attempt,
            reply,
        } = item;

        let kind = mutation.kind();
        let table_id = mutation.table_id();
        let max_attempts = self.config.max_attempts();

        let settlement = loop {
            attempt += 1;
            self.tracker().started(id, attempt);

            let result = match tokio::time::timeout(
                self.config.execute_timeout(),
                self.executor.execute(&mutation),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(GridError::Timeout),
            };

            match result {
                Ok(outcome) => {
                    self.tracker().complete(id);
                    log::debug!(
                        "[QUEUE] {} {id} applied after {attempt} attempt(s) in {:?}",
                        kind.label(),
                        created_at.elapsed()
                    );
                    break Ok(outcome);
                }
                Err(error) if attempt >= max_attempts => {
                    log::error!(
                        "[QUEUE] dropping {} {id} on table {table_id} after {attempt} attempts: {error}",
                        kind.label()
                    );
                    self.tracker().fail(id, error.to_string());
                    break Err(MutationFailure {
                        mutation_id: id,
                        kind,
                        table_id,
                        attempts: attempt,
                        reason: error.to_string(),
                    });
                }
                Err(error) => {
                    log::warn!(
                        "[QUEUE] {} {id} attempt {attempt}/{max_attempts} failed: {error}",
                        kind.label()
                    );

                    let delay = self.config.backoff(attempt);
                    if delay.is_zero() {
                        tokio::task::yield_now().await;
                    } else {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        };

        self.tracker().prune_settled(self.config.tracker_retention);

        if reply.send(settlement).is_err() {
            log::debug!("[QUEUE] submitter of {id} no longer waiting");
        }
    }
}

async fn drain_table(
    inner: Arc<QueueInner>,
    table_id: TableId,
    mut receiver: UnboundedReceiver<QueueItem>,
) {
    log::debug!("[QUEUE] worker started for table {table_id}");

    while let Some(item) = inner.next_item(table_id, &mut receiver) {
        inner.run_item(item).await;
        inner.item_settled(table_id);
    }

    log::debug!("[QUEUE] worker for table {table_id} idle, exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingExecutor {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl MutationExecutor for CountingExecutor {
        async fn execute(&self, _mutation: &Mutation) -> Result<MutationOutcome, GridError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                Err(GridError::storage("transient"))
            } else {
                Ok(MutationOutcome::Applied)
            }
        }
    }

    fn rename(table_id: TableId) -> Mutation {
        Mutation::RenameTable {
            table_id,
            name: "Renamed".to_string(),
        }
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let executor = Arc::new(CountingExecutor {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        let queue = QueueManager::new(executor.clone(), QueueConfig::immediate()).unwrap();

        let ticket = queue.enqueue(rename(TableId::new()));
        let id = ticket.mutation_id;

        assert_eq!(ticket.settled().await, Ok(MutationOutcome::Applied));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);

        let snapshot = queue.with_tracker(|tracker| tracker.get(id)).unwrap();
        assert_eq!(snapshot.attempts, 3);
    }

    #[tokio::test]
    async fn drops_after_ceiling() {
        let executor = Arc::new(CountingExecutor {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        });
        let queue = QueueManager::new(executor.clone(), QueueConfig::immediate()).unwrap();

        let failure = queue
            .enqueue(rename(TableId::new()))
            .settled()
            .await
            .unwrap_err();

        assert_eq!(failure.attempts, 6);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 6);
        assert_eq!(queue.with_tracker(|tracker| tracker.failed_total()), 1);
    }

    #[tokio::test]
    async fn idle_tables_release_their_worker() {
        let executor = Arc::new(CountingExecutor {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        let queue = QueueManager::new(executor, QueueConfig::immediate()).unwrap();
        let table_id = TableId::new();

        let ticket = queue.enqueue(rename(table_id));
        ticket.settled().await.unwrap();
        queue.wait_idle().await;

        assert!(queue.active_tables().is_empty());
        assert_eq!(queue.pending(table_id), 0);
    }

    #[test]
    fn construction_outside_runtime_is_an_error() {
        let executor = Arc::new(CountingExecutor {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });

        let result = QueueManager::new(executor, QueueConfig::default());

        assert!(matches!(result, Err(GridError::QueueUnavailable(_))));
    }
}
