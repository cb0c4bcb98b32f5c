use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

use taktgeber_core::TaskError;

use crate::queue::QueueItem;
use crate::task::TaskDefinition;

/// Result of one attempt, sent back to the coordinator.
#[derive(Debug)]
pub(crate) struct WorkerOutcome {
    pub item: QueueItem,
    pub result: Result<(), TaskError>,
    pub latency: Duration,
}

/// Run one attempt of `task` in the background and report on `outcomes`.
///
/// The handler runs in its own tokio task so a panic is caught at the join
/// and reported as a transient failure instead of taking the worker down.
pub(crate) fn spawn_worker(
    item: QueueItem,
    task: Arc<TaskDefinition>,
    timeout: Option<Duration>,
    token: CancellationToken,
    outcomes: mpsc::UnboundedSender<WorkerOutcome>,
) {
    let span = tracing::info_span!(
        "task",
        task_id = %item.task_id,
        instance = %item.instance_id,
        attempt = item.attempt,
    );
    tokio::spawn(
        async move {
            let started = Instant::now();
            let result = run_attempt(&task, timeout, token).await;
            let latency = started.elapsed();
            debug!(ok = result.is_ok(), ?latency, "attempt finished");
            // A closed channel means the coordinator has halted; nobody is
            // left to account for this attempt.
            let _ = outcomes.send(WorkerOutcome { item, result, latency });
        }
        .instrument(span),
    );
}

async fn run_attempt(
    task: &TaskDefinition,
    timeout: Option<Duration>,
    token: CancellationToken,
) -> Result<(), TaskError> {
    let mut handle = tokio::spawn(task.run(token.clone()));

    let joined = match timeout {
        Some(limit) => {
            let raced = tokio::time::timeout(limit, &mut handle).await;
            match raced {
                Ok(joined) => joined,
                Err(_) => {
                    // Never aborted: the handler winds down on its token and
                    // keeps its concurrency slot until it returns.
                    token.cancel();
                    debug!(?limit, "attempt timed out, waiting for handler to stop");
                    if let Err(e) = handle.await {
                        debug!(error = %e, "handler failed after timeout");
                    }
                    return Err(TaskError::transient(format!("timed out after {limit:?}")));
                }
            }
        }
        None => handle.await,
    };

    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(TaskError::transient(format!(
            "handler panicked: {}",
            panic_message(e.into_panic())
        ))),
        Err(e) => Err(TaskError::transient(format!("handler did not complete: {e}"))),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use uuid::Uuid;

    use super::*;
    use crate::task::{Origin, Priority};

    fn item(task_id: &str) -> QueueItem {
        QueueItem {
            instance_id: Uuid::new_v4(),
            task_id: task_id.to_string(),
            priority: Priority::Medium,
            next_run_at: 0,
            sequence: 0,
            attempt: 0,
            origin: Origin::Manual,
            slot_at: 0,
        }
    }

    async fn run_once(task: TaskDefinition, timeout: Option<Duration>) -> WorkerOutcome {
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_worker(item(task.id()), Arc::new(task), timeout, CancellationToken::new(), tx);
        rx.recv().await.unwrap()
    }

    #[tokio::test]
    async fn success_is_reported() {
        let task = TaskDefinition::on_event("ok", "t", Priority::Low, |_| async { Ok(()) });
        let outcome = run_once(task, None).await;
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.item.task_id, "ok");
    }

    #[tokio::test]
    async fn handler_error_passes_through() {
        let task = TaskDefinition::on_event("bad", "t", Priority::Low, |_| async {
            Err(TaskError::permanent("tenant deleted"))
        });
        let outcome = run_once(task, None).await;
        assert_eq!(outcome.result, Err(TaskError::permanent("tenant deleted")));
    }

    #[tokio::test]
    async fn panic_becomes_transient() {
        let task = TaskDefinition::on_event("boom", "t", Priority::Low, |_| async {
            let shards: Vec<u32> = Vec::new();
            std::hint::black_box(shards[3]);
            Ok(())
        });
        let outcome = run_once(task, None).await;
        match outcome.result {
            Err(TaskError::Transient(msg)) => assert!(msg.contains("index out of bounds"), "{msg}"),
            other => panic!("expected transient, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_token_and_lets_handler_clean_up() {
        let cleaned = Arc::new(AtomicBool::new(false));
        let c = cleaned.clone();
        let task = TaskDefinition::on_event("slow", "t", Priority::Low, move |token: CancellationToken| {
            let c = c.clone();
            async move {
                token.cancelled().await;
                tokio::time::sleep(Duration::from_millis(5)).await;
                c.store(true, Ordering::SeqCst);
                Ok(())
            }
        });

        let outcome = run_once(task, Some(Duration::from_millis(50))).await;
        match outcome.result {
            Err(TaskError::Transient(msg)) => assert!(msg.contains("timed out"), "{msg}"),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(cleaned.load(Ordering::SeqCst), "cleanup ran before the outcome");
        assert_eq!(outcome.latency, Duration::from_millis(55));
    }

    #[tokio::test(start_paused = true)]
    async fn handler_ignoring_cancellation_is_not_killed() {
        let finished = Arc::new(AtomicBool::new(false));
        let f = finished.clone();
        let task = TaskDefinition::on_event("stubborn", "t", Priority::Low, move |_| {
            let f = f.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                f.store(true, Ordering::SeqCst);
                Ok(())
            }
        });

        let outcome = run_once(task, Some(Duration::from_millis(50))).await;
        assert!(matches!(outcome.result, Err(TaskError::Transient(_))));
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(outcome.latency, Duration::from_secs(60));
    }
}
