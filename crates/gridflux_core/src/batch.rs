use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::{CancelToken, CellValue, GridError, LocalId};

/// Counts structural mutations that have been submitted but not reconciled.
#[derive(Clone)]
pub struct StructureGate {
    in_flight: Arc<watch::Sender<usize>>,
}

impl StructureGate {
    pub fn new() -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            in_flight: Arc::new(in_flight),
        }
    }

    /// Marks one structural mutation in flight until the guard is dropped.
    pub fn begin(&self) -> StructureGuard {
        self.in_flight.send_modify(|n| *n += 1);
        StructureGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    pub fn is_stable(&self) -> bool {
        self.in_flight() == 0
    }

    pub async fn wait_stable(&self) {
        let mut receiver = self.in_flight.subscribe();
        let _ = receiver.wait_for(|n| *n == 0).await;
    }
}

impl Default for StructureGate {
    fn default() -> Self {
        Self::new()
    }
}

pub struct StructureGuard {
    in_flight: Arc<watch::Sender<usize>>,
}

impl Drop for StructureGuard {
    fn drop(&mut self) {
        self.in_flight.send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CellEdit {
    pub row: LocalId,
    pub column: LocalId,
    pub value: CellValue,
}

/// Receives each flushed batch of edits.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn flush(&self, edits: Vec<CellEdit>) -> Result<(), GridError>;
}

/// Buffers cell edits between flushes.
///
/// Repeated edits to the same cell inside one window collapse into the
/// latest value. Nothing is released while the gate reports structural
/// work in flight.
pub struct CellBatchWriter {
    buffer: Mutex<IndexMap<(LocalId, LocalId), CellValue>>,
    gate: StructureGate,
    wake: Notify,
}

impl CellBatchWriter {
    pub fn new(gate: StructureGate) -> Self {
        Self {
            buffer: Mutex::new(IndexMap::new()),
            gate,
            wake: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<(LocalId, LocalId), CellValue>> {
        match self.buffer.lock() {
            Ok(guard) => guard,
            Err(poison_error) => poison_error.into_inner(),
        }
    }

    pub fn push(&self, edit: CellEdit) {
        self.lock().insert((edit.row, edit.column), edit.value);
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Drops buffered edits touching the given row or column.
    pub fn discard_referencing(&self, local_id: LocalId) -> usize {
        let mut buffer = self.lock();
        let before = buffer.len();
        buffer.retain(|(row, column), _| *row != local_id && *column != local_id);
        before - buffer.len()
    }

    pub fn clear(&self) -> usize {
        let mut buffer = self.lock();
        let dropped = buffer.len();
        buffer.clear();
        dropped
    }

    /// Swaps the buffer out if there is anything to send and no structural
    /// mutation is in flight. Edits pushed afterwards start a fresh buffer.
    pub fn take_ready(&self) -> Option<Vec<CellEdit>> {
        if !self.gate.is_stable() {
            return None;
        }

        let mut buffer = self.lock();
        if buffer.is_empty() {
            return None;
        }

        let edits = std::mem::take(&mut *buffer);
        Some(
            edits
                .into_iter()
                .map(|((row, column), value)| CellEdit { row, column, value })
                .collect(),
        )
    }

    /// Wakes the flush loop ahead of its next tick, e.g. to observe cancellation.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Flushes on a fixed interval until cancelled.
    pub fn spawn_flush_loop(
        self: &Arc<Self>,
        sink: Arc<dyn BatchSink>,
        period: Duration,
        cancel: CancelToken,
        runtime: &Handle,
    ) -> JoinHandle<()> {
        let writer = Arc::clone(self);

        runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = writer.wake.notified() => {}
                }
                if cancel.is_cancelled() {
                    break;
                }

                let Some(edits) = writer.take_ready() else {
                    continue;
                };

                let count = edits.len();
                if let Err(error) = sink.flush(edits).await {
                    log::error!("[BATCH] failed to submit {count} cell edit(s): {error}");
                }
            }

            log::debug!("[BATCH] flush loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OptimisticId;

    fn edit(row: LocalId, column: LocalId, value: &str) -> CellEdit {
        CellEdit {
            row,
            column,
            value: value.into(),
        }
    }

    #[test]
    fn repeated_edits_coalesce_in_place() {
        let writer = CellBatchWriter::new(StructureGate::new());
        let (a, b, column) = (OptimisticId::new(), OptimisticId::new(), OptimisticId::new());

        writer.push(edit(a, column, "h"));
        writer.push(edit(b, column, "x"));
        writer.push(edit(a, column, "hello"));

        let edits = writer.take_ready().unwrap();
        assert_eq!(edits.len(), 2);
        assert_eq!(edits[0], edit(a, column, "hello"));
        assert_eq!(writer.pending(), 0);
    }

    #[test]
    fn holds_edits_while_structure_in_flight() {
        let gate = StructureGate::new();
        let writer = CellBatchWriter::new(gate.clone());
        writer.push(edit(OptimisticId::new(), OptimisticId::new(), "v"));

        let guard = gate.begin();
        assert!(writer.take_ready().is_none());
        assert_eq!(writer.pending(), 1);

        drop(guard);
        assert!(gate.is_stable());
        assert_eq!(writer.take_ready().map(|edits| edits.len()), Some(1));
    }

    #[test]
    fn discards_edits_for_removed_entities() {
        let writer = CellBatchWriter::new(StructureGate::new());
        let (row, other, column) = (OptimisticId::new(), OptimisticId::new(), OptimisticId::new());
        writer.push(edit(row, column, "a"));
        writer.push(edit(other, column, "b"));

        assert_eq!(writer.discard_referencing(row), 1);
        assert_eq!(writer.pending(), 1);
    }

    #[derive(Default)]
    struct CountingSink {
        sent: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl BatchSink for CountingSink {
        async fn flush(&self, edits: Vec<CellEdit>) -> Result<(), GridError> {
            self.sent
                .fetch_add(edits.len(), std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn flush_loop_sends_on_each_tick_until_cancelled() {
        let writer = Arc::new(CellBatchWriter::new(StructureGate::new()));
        let sink = Arc::new(CountingSink::default());
        let cancel = CancelToken::new();
        let handle = writer.spawn_flush_loop(
            sink.clone(),
            Duration::from_millis(300),
            cancel.clone(),
            &Handle::current(),
        );

        writer.push(edit(OptimisticId::new(), OptimisticId::new(), "a"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.sent.load(std::sync::atomic::Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(sink.sent.load(std::sync::atomic::Ordering::SeqCst), 1);

        cancel.cancel();
        writer.wake();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn wait_stable_resolves_when_guards_drop() {
        let gate = StructureGate::new();
        let guard = gate.begin();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_stable().await })
        };

        assert_eq!(gate.in_flight(), 1);
        drop(guard);

        waiter.await.unwrap();
        assert!(gate.is_stable());
    }
}
