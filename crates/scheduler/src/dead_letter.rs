use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::queue::InstanceId;
use crate::task::{Origin, Priority};

/// A task instance that will not be retried again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub task_id: String,
    pub instance_id: InstanceId,
    pub priority: Priority,
    pub origin: Origin,
    /// Attempts made, including the last one.
    pub attempts: u32,
    pub last_error: String,
    /// The chain ended on a permanent error rather than an exhausted budget.
    pub permanent: bool,
    pub first_failed_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Where dead-lettered instances go.
///
/// `record` is called from the coordinator loop and must not block.
pub trait DeadLetterStore: Send + Sync {
    fn record(&self, record: DeadLetterRecord);

    /// Everything recorded so far, oldest first.
    fn snapshot(&self) -> Vec<DeadLetterRecord>;
}

impl<T: DeadLetterStore + ?Sized> DeadLetterStore for Arc<T> {
    fn record(&self, record: DeadLetterRecord) {
        (**self).record(record)
    }

    fn snapshot(&self) -> Vec<DeadLetterRecord> {
        (**self).snapshot()
    }
}

/// Aggregates for operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeadLetterStats {
    pub total: usize,
    pub by_task: HashMap<String, usize>,
    pub permanent: usize,
    pub exhausted: usize,
}

/// Process-local store. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    records: RwLock<Vec<DeadLetterRecord>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every record out of the store, e.g. to replay or archive them.
    pub fn drain(&self) -> Vec<DeadLetterRecord> {
        match self.records.write() {
            Ok(mut records) => std::mem::take(&mut *records),
            Err(_) => Vec::new(),
        }
    }

    pub fn stats(&self) -> DeadLetterStats {
        let mut stats = DeadLetterStats::default();
        if let Ok(records) = self.records.read() {
            for r in records.iter() {
                stats.total += 1;
                *stats.by_task.entry(r.task_id.clone()).or_default() += 1;
                if r.permanent {
                    stats.permanent += 1;
                } else {
                    stats.exhausted += 1;
                }
            }
        }
        stats
    }
}

impl DeadLetterStore for InMemoryDeadLetterStore {
    fn record(&self, record: DeadLetterRecord) {
        if let Ok(mut records) = self.records.write() {
            records.push(record);
        }
    }

    fn snapshot(&self) -> Vec<DeadLetterRecord> {
        self.records.read().map(|r| r.clone()).unwrap_or_default()
    }
}
