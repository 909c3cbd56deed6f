use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use uuid::Uuid;

use crate::{MutationKind, TableId};

pub type MutationId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationStatus {
    Queued,
    Running { attempt: u32 },
    Completed,
    Failed(String),
}

impl MutationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MutationStatus::Completed | MutationStatus::Failed(_))
    }
}

/// Cooperative stop signal for background loops.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

struct TrackedMutation {
    id: MutationId,
    kind: MutationKind,
    table_id: TableId,
    status: MutationStatus,
    attempts: u32,
    queued_at: Instant,
    completed_at: Option<Instant>,
}

impl TrackedMutation {
    fn elapsed(&self) -> std::time::Duration {
        match self.completed_at {
            Some(completed) => completed.duration_since(self.queued_at),
            None => self.queued_at.elapsed(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MutationSnapshot {
    pub id: MutationId,
    pub kind: MutationKind,
    pub table_id: TableId,
    pub status: MutationStatus,
    pub attempts: u32,
    pub elapsed_secs: f64,
}

impl From<&TrackedMutation> for MutationSnapshot {
    fn from(tracked: &TrackedMutation) -> Self {
        Self {
            id: tracked.id,
            kind: tracked.kind,
            table_id: tracked.table_id,
            status: tracked.status.clone(),
            attempts: tracked.attempts,
            elapsed_secs: tracked.elapsed().as_secs_f64(),
        }
    }
}

/// Operator-facing record of what the queue has been asked to do.
#[derive(Default)]
pub struct MutationTracker {
    mutations: HashMap<MutationId, TrackedMutation>,
    failed_total: u64,
}

impl MutationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queued(&mut self, id: MutationId, kind: MutationKind, table_id: TableId) {
        self.mutations.insert(
            id,
            TrackedMutation {
                id,
                kind,
                table_id,
                status: MutationStatus::Queued,
                attempts: 0,
                queued_at: Instant::now(),
                completed_at: None,
            },
        );
    }

    pub fn started(&mut self, id: MutationId, attempt: u32) {
        if let Some(tracked) = self.mutations.get_mut(&id)
            && !tracked.status.is_terminal()
        {
            tracked.status = MutationStatus::Running { attempt };
            tracked.attempts = attempt;
        }
    }

    pub fn complete(&mut self, id: MutationId) {
        if let Some(tracked) = self.mutations.get_mut(&id)
            && !tracked.status.is_terminal()
        {
            tracked.status = MutationStatus::Completed;
            tracked.completed_at = Some(Instant::now());
        }
    }

    pub fn fail(&mut self, id: MutationId, error: impl Into<String>) {
        if let Some(tracked) = self.mutations.get_mut(&id)
            && !tracked.status.is_terminal()
        {
            tracked.status = MutationStatus::Failed(error.into());
            tracked.completed_at = Some(Instant::now());
            self.failed_total += 1;
        }
    }

    pub fn get(&self, id: MutationId) -> Option<MutationSnapshot> {
        self.mutations.get(&id).map(MutationSnapshot::from)
    }

    pub fn pending(&self) -> Vec<MutationSnapshot> {
        let mut pending: Vec<_> = self
            .mutations
            .values()
            .filter(|m| !m.status.is_terminal())
            .collect();
        pending.sort_by_key(|m| m.queued_at);
        pending.into_iter().map(MutationSnapshot::from).collect()
    }

    pub fn recent(&self, limit: usize) -> Vec<MutationSnapshot> {
        let mut mutations: Vec<_> = self.mutations.values().collect();
        mutations.sort_by(|a, b| b.queued_at.cmp(&a.queued_at));
        mutations
            .into_iter()
            .take(limit)
            .map(MutationSnapshot::from)
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.mutations
            .values()
            .filter(|m| !m.status.is_terminal())
            .count()
    }

    /// Permanent failures since the tracker was created, including ones already cleaned up.
    pub fn failed_total(&self) -> u64 {
        self.failed_total
    }

    /// Drops the oldest settled entries beyond `keep`. Pending ones always stay.
    pub fn prune_settled(&mut self, keep: usize) {
        let mut settled: Vec<(Instant, MutationId)> = self
            .mutations
            .values()
            .filter(|m| m.status.is_terminal())
            .filter_map(|m| m.completed_at.map(|at| (at, m.id)))
            .collect();
        if settled.len() <= keep {
            return;
        }

        settled.sort_unstable();
        let excess = settled.len() - keep;
        for (_, id) in settled.into_iter().take(excess) {
            self.mutations.remove(&id);
        }
    }

    pub fn status_message(&self) -> Option<String> {
        let running: Vec<_> = self
            .mutations
            .values()
            .filter(|m| matches!(m.status, MutationStatus::Running { .. }))
            .collect();

        match running.len() {
            0 => None,
            1 => Some(format!(
                "Applying {} on table {}",
                running[0].kind.label(),
                running[0].table_id
            )),
            n => Some(format!("{n} mutations applying...")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_lifecycle() {
        let mut tracker = MutationTracker::new();
        let id = Uuid::new_v4();
        let table = TableId::new();

        tracker.queued(id, MutationKind::AddRow, table);
        assert_eq!(tracker.get(id).unwrap().status, MutationStatus::Queued);

        tracker.started(id, 1);
        assert_eq!(
            tracker.get(id).unwrap().status,
            MutationStatus::Running { attempt: 1 }
        );
        assert!(tracker.status_message().is_some());

        tracker.complete(id);
        assert_eq!(tracker.get(id).unwrap().status, MutationStatus::Completed);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn terminal_status_is_sticky() {
        let mut tracker = MutationTracker::new();
        let id = Uuid::new_v4();

        tracker.queued(id, MutationKind::DeleteRow, TableId::new());
        tracker.fail(id, "disk full");
        tracker.complete(id);
        tracker.fail(id, "again");

        assert_eq!(
            tracker.get(id).unwrap().status,
            MutationStatus::Failed("disk full".to_string())
        );
        assert_eq!(tracker.failed_total(), 1);
    }

    #[test]
    fn pruning_keeps_pending_entries() {
        let mut tracker = MutationTracker::new();
        let done = Uuid::new_v4();
        let waiting = Uuid::new_v4();
        let table = TableId::new();

        tracker.queued(done, MutationKind::RenameTable, table);
        tracker.queued(waiting, MutationKind::RenameTable, table);
        tracker.complete(done);

        tracker.prune_settled(0);

        assert!(tracker.get(done).is_none());
        assert_eq!(tracker.pending().len(), 1);
        assert_eq!(tracker.pending()[0].id, waiting);
    }

    #[test]
    fn pruning_drops_only_the_excess() {
        let mut tracker = MutationTracker::new();
        let table = TableId::new();

        for _ in 0..5 {
            let id = Uuid::new_v4();
            tracker.queued(id, MutationKind::AddRow, table);
            tracker.fail(id, "gone");
        }
        tracker.prune_settled(3);
        assert_eq!(tracker.recent(usize::MAX).len(), 3);

        tracker.prune_settled(3);
        assert_eq!(tracker.recent(usize::MAX).len(), 3);
        assert_eq!(tracker.failed_total(), 5);
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();

        clone.cancel();

        assert!(token.is_cancelled());
    }
}
