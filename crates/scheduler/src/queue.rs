use std::collections::HashMap;

use serde::Serialize;
use uuid::Uuid;

use crate::task::{Origin, Priority};

/// Identity of one task instance. Stable across the retries of that instance.
pub type InstanceId = Uuid;

/// One pending run of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueItem {
    pub instance_id: InstanceId,
    pub task_id: String,
    pub priority: Priority,
    /// Epoch ms at which the instance becomes runnable.
    pub next_run_at: u64,
    /// Monotonic tie-break; FIFO among equal priority and due time.
    pub sequence: u64,
    /// Zero-based attempt counter.
    pub attempt: u32,
    pub origin: Origin,
    /// Due time this instance was originally scheduled for. Periodic
    /// re-arming steps from here, not from when the run finished.
    pub slot_at: u64,
}

impl QueueItem {
    pub fn priority_key(&self) -> (u8, u64, u64) {
        (self.priority.rank(), self.next_run_at, self.sequence)
    }

    pub fn due_key(&self) -> (u64, u8, u64) {
        (self.next_run_at, self.priority.rank(), self.sequence)
    }
}

/// Which key a [`PriorityQueue`] orders by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOrder {
    /// `(priority rank, next_run_at, sequence)`.
    ByPriority,
    /// `(next_run_at, priority rank, sequence)`.
    ByDueTime,
}

/// Array-backed binary min-heap of [`QueueItem`]s with removal by instance id.
///
/// Children of slot `i` live at `2i + 1` and `2i + 2`. A side index maps each
/// instance id to its slot so `remove` does not scan.
#[derive(Debug, Clone)]
pub struct PriorityQueue {
    order: QueueOrder,
    items: Vec<QueueItem>,
    positions: HashMap<InstanceId, usize>,
}

impl PriorityQueue {
    pub fn new(order: QueueOrder) -> Self {
        Self {
            order,
            items: Vec::new(),
            positions: HashMap::new(),
        }
    }

    /// Build a heap from arbitrary items in one O(n) pass.
    pub fn from_items(order: QueueOrder, items: Vec<QueueItem>) -> Self {
        let mut queue = Self {
            order,
            items,
            positions: HashMap::new(),
        };
        queue.heapify();
        queue
    }

    pub fn order(&self) -> QueueOrder {
        self.order
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, id: &InstanceId) -> bool {
        self.positions.contains_key(id)
    }

    /// Items in heap (not sorted) order.
    pub fn iter(&self) -> impl Iterator<Item = &QueueItem> {
        self.items.iter()
    }

    /// # Panics
    /// If an item with the same instance id is already queued.
    pub fn insert(&mut self, item: QueueItem) {
        let idx = self.items.len();
        let previous = self.positions.insert(item.instance_id, idx);
        assert!(previous.is_none(), "instance {} queued twice", item.instance_id);
        self.items.push(item);
        self.sift_up(idx);
    }

    pub fn peek_min(&self) -> Option<&QueueItem> {
        self.items.first()
    }

    pub fn extract_min(&mut self) -> Option<QueueItem> {
        if self.items.is_empty() {
            None
        } else {
            Some(self.remove_at(0))
        }
    }

    pub fn remove(&mut self, id: &InstanceId) -> Option<QueueItem> {
        let idx = *self.positions.get(id)?;
        assert_eq!(
            &self.items[idx].instance_id, id,
            "heap position index out of sync"
        );
        Some(self.remove_at(idx))
    }

    /// Absorb every item of `other`, re-heapifying once.
    pub fn meld(&mut self, other: PriorityQueue) {
        if other.is_empty() {
            return;
        }
        self.items.extend(other.items);
        self.heapify();
    }

    /// Pop every item whose `next_run_at <= now`, in this queue's order.
    pub fn drain_due(&mut self, now: u64) -> Vec<QueueItem> {
        let mut due = Vec::new();
        while self.peek_min().is_some_and(|item| item.next_run_at <= now) {
            if let Some(item) = self.extract_min() {
                due.push(item);
            }
        }
        due
    }

    /// Empty the queue, returning items in heap order.
    pub fn clear(&mut self) -> Vec<QueueItem> {
        self.positions.clear();
        std::mem::take(&mut self.items)
    }

    // ── Heap internals ────────────────────────────────────────

    fn less(&self, a: usize, b: usize) -> bool {
        let (a, b) = (&self.items[a], &self.items[b]);
        match self.order {
            QueueOrder::ByPriority => a.priority_key() < b.priority_key(),
            QueueOrder::ByDueTime => a.due_key() < b.due_key(),
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.items.swap(a, b);
        self.positions.insert(self.items[a].instance_id, a);
        self.positions.insert(self.items[b].instance_id, b);
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if !self.less(idx, parent) {
                break;
            }
            self.swap(idx, parent);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.items.len();
        loop {
            let left = 2 * idx + 1;
            let right = left + 1;
            let mut smallest = idx;
            if left < len && self.less(left, smallest) {
                smallest = left;
            }
            if right < len && self.less(right, smallest) {
                smallest = right;
            }
            if smallest == idx {
                break;
            }
            self.swap(idx, smallest);
            idx = smallest;
        }
    }

    fn remove_at(&mut self, idx: usize) -> QueueItem {
        let item = self.items.swap_remove(idx);
        self.positions.remove(&item.instance_id);
        if idx < self.items.len() {
            self.positions.insert(self.items[idx].instance_id, idx);
            self.sift_down(idx);
            self.sift_up(idx);
        }
        item
    }

    fn heapify(&mut self) {
        self.positions.clear();
        for (idx, item) in self.items.iter().enumerate() {
            let previous = self.positions.insert(item.instance_id, idx);
            assert!(previous.is_none(), "instance {} queued twice", item.instance_id);
        }
        for idx in (0..self.items.len() / 2).rev() {
            self.sift_down(idx);
        }
    }
}
