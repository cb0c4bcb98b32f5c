use std::collections::HashMap;

use uuid::Uuid;

use crate::concurrency::ConcurrencyController;
use crate::queue::{InstanceId, PriorityQueue, QueueItem, QueueOrder};
use crate::retry::RetryState;
use crate::task::{Origin, TaskDefinition};

/// Everything the coordinator mutates. Single owner, no locks.
///
/// Pending instances live in one of two heaps: `delayed` (not yet due,
/// ordered by due time) or `ready` (due, ordered by priority). Keeping them
/// apart stops a future high-priority instance from sitting in front of a
/// due low-priority one.
#[derive(Debug)]
pub(crate) struct SchedulerState {
    pub(crate) delayed: PriorityQueue,
    pub(crate) ready: PriorityQueue,
    pub(crate) retries: HashMap<InstanceId, RetryState>,
    /// Queued next firing per periodic task.
    pub(crate) armed: HashMap<String, InstanceId>,
    pub(crate) concurrency: ConcurrencyController,
    pub(crate) interrupted: bool,
    sequence: u64,
}

impl SchedulerState {
    pub(crate) fn new(concurrency: ConcurrencyController) -> Self {
        Self {
            delayed: PriorityQueue::new(QueueOrder::ByDueTime),
            ready: PriorityQueue::new(QueueOrder::ByPriority),
            retries: HashMap::new(),
            armed: HashMap::new(),
            concurrency,
            interrupted: false,
            sequence: 0,
        }
    }

    pub(crate) fn next_sequence(&mut self) -> u64 {
        let seq = self.sequence;
        self.sequence += 1;
        seq
    }

    /// Queue a fresh instance of `task` due at `due`.
    pub(crate) fn enqueue(&mut self, task: &TaskDefinition, origin: Origin, due: u64, now: u64) -> InstanceId {
        let item = QueueItem {
            instance_id: Uuid::new_v4(),
            task_id: task.id().to_string(),
            priority: task.priority(),
            next_run_at: due,
            sequence: self.next_sequence(),
            attempt: 0,
            origin,
            slot_at: due,
        };
        let id = item.instance_id;
        self.push(item, now);
        id
    }

    /// Queue the next interval firing of a periodic task, replacing any
    /// firing that is still queued for it.
    pub(crate) fn arm_periodic(&mut self, task: &TaskDefinition, due: u64, now: u64) -> InstanceId {
        let id = self.enqueue(task, Origin::Interval, due, now);
        if let Some(previous) = self.armed.insert(task.id().to_string(), id) {
            if self.remove(&previous).is_some() {
                tracing::warn!(task_id = %task.id(), "replaced a periodic firing that was still queued");
            }
        }
        id
    }

    pub(crate) fn push(&mut self, item: QueueItem, now: u64) {
        if item.next_run_at <= now {
            self.ready.insert(item);
        } else {
            self.delayed.insert(item);
        }
    }

    pub(crate) fn remove(&mut self, id: &InstanceId) -> Option<QueueItem> {
        self.delayed.remove(id).or_else(|| self.ready.remove(id))
    }

    /// Move every due instance from `delayed` into `ready`. Returns how many moved.
    pub(crate) fn promote_due(&mut self, now: u64) -> usize {
        let due = self.delayed.drain_due(now);
        let moved = due.len();
        self.ready.meld(PriorityQueue::from_items(QueueOrder::ByPriority, due));
        moved
    }

    /// Take the front ready instance if the controller admits it. A refused
    /// instance stays where it is.
    pub(crate) fn next_admitted(&mut self) -> Option<QueueItem> {
        if self.interrupted || self.ready.is_empty() {
            return None;
        }
        if !self.concurrency.try_admit() {
            return None;
        }
        self.ready.extract_min()
    }

    /// When the loop next needs to look at the clock. `None` means only an
    /// outside event (outcome, command, interrupt) can make progress.
    pub(crate) fn next_wake(&self) -> Option<u64> {
        if self.interrupted || !self.ready.is_empty() {
            return None;
        }
        self.delayed.peek_min().map(|item| item.next_run_at)
    }

    pub(crate) fn pending(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }

    /// Drop everything still queued. Returns what was dropped.
    pub(crate) fn discard_all(&mut self) -> Vec<QueueItem> {
        let mut items = self.ready.clear();
        items.extend(self.delayed.clear());
        self.retries.clear();
        self.armed.clear();
        items
    }
}
