use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

/// Metric names emitted by the scheduler.
pub mod names {
    pub const TASK_REGISTERED: &str = "task.registered";
    pub const TASK_INTERVAL_MS: &str = "task.interval_ms";
    pub const TASK_RETRY: &str = "task.retry";
    pub const TASK_SUCCESS_LATENCY_MS: &str = "task.success_latency_ms";
    pub const TASK_FAILURE: &str = "task.failure";
    pub const TASK_DEAD_LETTER_COUNT: &str = "task.dead_letter_count";
    pub const SCHEDULER_INTERRUPTED: &str = "scheduler.interrupted";
    pub const SCHEDULER_SHUTDOWN_TIMEOUT: &str = "scheduler.shutdown_timeout";
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

impl MetricValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Number(_) => None,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for MetricValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

/// Telemetry outlet. Implementations must not block the caller.
pub trait MetricsSink: Send + Sync {
    fn emit(&self, name: &str, value: MetricValue);

    /// Push out anything buffered. Called once at the end of shutdown.
    fn flush(&self) {}
}

impl<T: MetricsSink + ?Sized> MetricsSink for Arc<T> {
    fn emit(&self, name: &str, value: MetricValue) {
        (**self).emit(name, value)
    }

    fn flush(&self) {
        (**self).flush()
    }
}

/// Writes every metric as a `debug!` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn emit(&self, name: &str, value: MetricValue) {
        debug!(metric = name, value = ?value, "metric");
    }
}

/// Keeps every emitted metric in memory.
#[derive(Debug, Default)]
pub struct MemoryMetrics {
    events: Mutex<Vec<(String, MetricValue)>>,
    flushes: Mutex<usize>,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, MetricValue)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn values(&self, name: &str) -> Vec<MetricValue> {
        self.events()
            .into_iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v)
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.values(name).len()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.lock().map(|f| *f).unwrap_or(0)
    }
}

impl MetricsSink for MemoryMetrics {
    fn emit(&self, name: &str, value: MetricValue) {
        if let Ok(mut events) = self.events.lock() {
            events.push((name.to_string(), value));
        }
    }

    fn flush(&self) {
        if let Ok(mut flushes) = self.flushes.lock() {
            *flushes += 1;
        }
    }
}

/// Point-in-time view of the scheduler, published by the coordinator.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    /// Successful runs by task id.
    pub tasks_executed: HashMap<String, u64>,
    /// Failed attempts by task id (each retry counts).
    pub tasks_failed: HashMap<String, u64>,
    pub retries_scheduled: u64,
    pub dead_lettered: u64,
    /// Mean successful run time by task id.
    pub avg_task_duration: HashMap<String, Duration>,
    pub last_run: HashMap<String, DateTime<Utc>>,
    pub current_limit: usize,
    pub in_flight: usize,
    pub ready_depth: usize,
    pub delayed_depth: usize,
}

impl SchedulerMetrics {
    /// Record a successful run.
    pub fn record_execution(&mut self, task_id: &str, duration: Duration) {
        *self.tasks_executed.entry(task_id.to_string()).or_default() += 1;
        self.last_run.insert(task_id.to_string(), Utc::now());

        let count = self.tasks_executed[task_id];
        let prev_avg = self
            .avg_task_duration
            .get(task_id)
            .copied()
            .unwrap_or_default();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count == 1 {
            duration
        } else {
            let prev_nanos = prev_avg.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };

        self.avg_task_duration.insert(task_id.to_string(), new_avg);
    }

    pub fn record_failure(&mut self, task_id: &str) {
        *self.tasks_failed.entry(task_id.to_string()).or_default() += 1;
        self.last_run.insert(task_id.to_string(), Utc::now());
    }

    pub fn executions(&self, task_id: &str) -> u64 {
        self.tasks_executed.get(task_id).copied().unwrap_or(0)
    }

    pub fn failures(&self, task_id: &str) -> u64 {
        self.tasks_failed.get(task_id).copied().unwrap_or(0)
    }
}
