use std::sync::Arc;

use tracing::{debug, error, warn};

use taktgeber_core::TaskError;

use crate::dead_letter::DeadLetterRecord;
use crate::execution::WorkerOutcome;
use crate::metrics::{names, MetricValue};
use crate::queue::QueueItem;
use crate::retry::{RetryDecision, RetryState};
use crate::task::{Origin, TaskDefinition};

use super::Coordinator;

impl Coordinator {
    /// Account for a finished attempt: release its slot, then succeed,
    /// retry or dead-letter it.
    pub(super) fn on_outcome(&mut self, outcome: WorkerOutcome) {
        let WorkerOutcome {
            item,
            result,
            latency,
        } = outcome;
        self.state.concurrency.release();
        let success = result.is_ok();
        if let Some(limit) = self.state.concurrency.on_outcome(success, latency) {
            debug!(limit, "concurrency limit adjusted");
        }

        let task = Arc::clone(&self.tasks[&item.task_id]);
        match result {
            Ok(()) => {
                self.state.retries.remove(&item.instance_id);
                self.sink.emit(
                    names::TASK_SUCCESS_LATENCY_MS,
                    MetricValue::Number(latency.as_secs_f64() * 1000.0),
                );
                if let Ok(mut m) = self.metrics.write() {
                    m.record_execution(&item.task_id, latency);
                }
                debug!(task_id = %item.task_id, attempt = item.attempt, ?latency, "task succeeded");
                self.rearm(&task, &item);
            }
            Err(err) => self.on_failure(&task, item, err),
        }
    }

    fn on_failure(&mut self, task: &TaskDefinition, item: QueueItem, err: TaskError) {
        self.sink.emit(names::TASK_FAILURE, MetricValue::Text(item.task_id.clone()));
        if let Ok(mut m) = self.metrics.write() {
            m.record_failure(&item.task_id);
        }

        let now = self.clock.now_ms();
        let max_retries = task.max_retries().unwrap_or(self.default_max_retries);
        let first_failed_at = self
            .state
            .retries
            .get(&item.instance_id)
            .map(|r| r.first_failed_at)
            .unwrap_or_else(|| self.clock.to_utc(now));

        match self.policy.decide(item.attempt, max_retries, &err, &mut self.rng) {
            RetryDecision::Retry { delay } => {
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                let attempt = item.attempt + 1;
                warn!(
                    task_id = %item.task_id,
                    attempt = item.attempt,
                    max_retries,
                    delay_ms,
                    error = %err,
                    "task failed, retrying"
                );
                self.state.retries.insert(
                    item.instance_id,
                    RetryState {
                        attempt,
                        last_error: err,
                        next_backoff_ms: delay_ms,
                        first_failed_at,
                    },
                );
                self.sink.emit(names::TASK_RETRY, MetricValue::Text(item.task_id.clone()));
                if let Ok(mut m) = self.metrics.write() {
                    m.retries_scheduled += 1;
                }
                let retry = QueueItem {
                    next_run_at: now.saturating_add(delay_ms),
                    sequence: self.state.next_sequence(),
                    attempt,
                    ..item
                };
                self.state.push(retry, now);
            }
            RetryDecision::DeadLetter => {
                self.state.retries.remove(&item.instance_id);
                let record = DeadLetterRecord {
                    task_id: item.task_id.clone(),
                    instance_id: item.instance_id,
                    priority: item.priority,
                    origin: item.origin,
                    attempts: item.attempt + 1,
                    last_error: err.message().to_string(),
                    permanent: err.is_permanent(),
                    first_failed_at,
                    dead_lettered_at: self.clock.to_utc(now),
                };
                error!(
                    task_id = %record.task_id,
                    attempts = record.attempts,
                    permanent = record.permanent,
                    error = %err,
                    "task dead-lettered"
                );
                self.dead_letters.record(record);
                self.dead_letter_count += 1;
                self.sink.emit(
                    names::TASK_DEAD_LETTER_COUNT,
                    MetricValue::Number(self.dead_letter_count as f64),
                );
                if let Ok(mut m) = self.metrics.write() {
                    m.dead_lettered = self.dead_letter_count;
                }
                self.rearm(task, &item);
            }
        }
    }

    /// Queue the next interval firing once a periodic instance is settled.
    /// Manual and event runs of a periodic task do not re-arm it.
    fn rearm(&mut self, task: &TaskDefinition, item: &QueueItem) {
        if self.state.interrupted || item.origin != Origin::Interval {
            return;
        }
        let Some(interval_ms) = task.interval_ms() else {
            return;
        };
        let now = self.clock.now_ms();
        let due = item.slot_at.saturating_add(interval_ms).max(now);
        self.state.arm_periodic(task, due, now);
    }
}
