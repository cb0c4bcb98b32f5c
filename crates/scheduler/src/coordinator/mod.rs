mod outcome;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::rngs::StdRng;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use taktgeber_core::SchedulerConfig;

use crate::clock::Clock;
use crate::dead_letter::DeadLetterStore;
use crate::execution::{self, WorkerOutcome};
use crate::metrics::{MetricsSink, SchedulerMetrics};
use crate::retry::RetryPolicy;
use crate::state::SchedulerState;
use crate::task::{Origin, TaskDefinition};

/// Requests from the handle and from event ingress.
#[derive(Debug)]
pub(crate) enum Command {
    Trigger {
        task_id: String,
        origin: Origin,
        correlation_id: Option<Uuid>,
    },
}

/// Channels and tokens tying the coordinator to the rest of the scheduler.
pub(crate) struct CoordinatorLinks {
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub interrupt: watch::Receiver<bool>,
    pub in_flight: watch::Sender<usize>,
    /// Parent of every worker's token.
    pub workers: CancellationToken,
    pub halt: CancellationToken,
}

/// The only writer of [`SchedulerState`].
///
/// Runs as one tokio task. Each turn it promotes due instances, dispatches
/// what the concurrency controller admits, publishes gauges, then sleeps
/// until a timer, a command, a worker outcome, interrupt or halt.
pub(crate) struct Coordinator {
    tasks: HashMap<String, Arc<TaskDefinition>>,
    state: SchedulerState,
    clock: Clock,
    policy: RetryPolicy,
    rng: StdRng,
    default_max_retries: u32,
    default_timeout: Option<Duration>,
    dead_letters: Arc<dyn DeadLetterStore>,
    dead_letter_count: u64,
    sink: Arc<dyn MetricsSink>,
    metrics: Arc<RwLock<SchedulerMetrics>>,
    outcome_tx: mpsc::UnboundedSender<WorkerOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<WorkerOutcome>,
    links: CoordinatorLinks,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: &SchedulerConfig,
        tasks: HashMap<String, Arc<TaskDefinition>>,
        state: SchedulerState,
        clock: Clock,
        rng: StdRng,
        dead_letters: Arc<dyn DeadLetterStore>,
        sink: Arc<dyn MetricsSink>,
        metrics: Arc<RwLock<SchedulerMetrics>>,
        links: CoordinatorLinks,
    ) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Self {
            tasks,
            state,
            clock,
            policy: RetryPolicy::from_config(&config.retry),
            rng,
            default_max_retries: config.default_max_retries,
            default_timeout: config.default_task_timeout(),
            dead_letters,
            dead_letter_count: 0,
            sink,
            metrics,
            outcome_tx,
            outcome_rx,
            links,
        }
    }

    /// Drive the loop until halted. Returns how many queued instances were discarded.
    pub(crate) async fn run(mut self) -> usize {
        info!(
            tasks = self.tasks.len(),
            limit = self.state.concurrency.current_limit(),
            "coordinator started"
        );

        loop {
            // The flag may flip between turns without waking the select.
            if !self.state.interrupted && *self.links.interrupt.borrow() {
                self.stop_dispatch();
            }
            let now = self.clock.now_ms();
            self.state.promote_due(now);
            self.dispatch_ready();
            self.publish_gauges();

            let wake = self.state.next_wake().map(|ms| self.clock.instant_at(ms));

            tokio::select! {
                biased;

                _ = self.links.halt.cancelled() => break,

                changed = self.links.interrupt.changed(), if !self.state.interrupted => {
                    // A dropped sender counts as an interrupt.
                    if changed.is_err() || *self.links.interrupt.borrow() {
                        self.stop_dispatch();
                    }
                }

                Some(outcome) = self.outcome_rx.recv() => self.on_outcome(outcome),

                Some(command) = self.links.commands.recv() => self.on_command(command),

                _ = sleep_until(wake) => {}
            }
        }

        let discarded = self.state.discard_all();
        if !discarded.is_empty() {
            let task_ids: Vec<&str> = discarded.iter().map(|i| i.task_id.as_str()).collect();
            warn!(count = discarded.len(), ?task_ids, "discarded queued instances at halt");
        }
        self.publish_gauges();
        info!("coordinator halted");
        discarded.len()
    }

    fn stop_dispatch(&mut self) {
        self.state.interrupted = true;
        info!(
            in_flight = self.state.concurrency.in_flight(),
            pending = self.state.pending(),
            "dispatch stopped"
        );
    }

    fn dispatch_ready(&mut self) {
        while let Some(item) = self.state.next_admitted() {
            let task = Arc::clone(&self.tasks[&item.task_id]);
            let timeout = task.timeout().or(self.default_timeout);
            debug!(
                task_id = %item.task_id,
                instance = %item.instance_id,
                attempt = item.attempt,
                origin = ?item.origin,
                "dispatching"
            );
            execution::spawn_worker(
                item,
                task,
                timeout,
                self.links.workers.child_token(),
                self.outcome_tx.clone(),
            );
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Trigger {
                task_id,
                origin,
                correlation_id,
            } => {
                if self.state.interrupted {
                    debug!(task_id = %task_id, "ignoring trigger after interrupt");
                    return;
                }
                let Some(task) = self.tasks.get(&task_id).cloned() else {
                    warn!(task_id = %task_id, "trigger for unknown task");
                    return;
                };
                let now = self.clock.now_ms();
                let instance = self.state.enqueue(&task, origin, now, now);
                debug!(
                    task_id = %task_id,
                    %instance,
                    ?origin,
                    correlation_id = ?correlation_id,
                    "enqueued"
                );
            }
        }
    }

    fn publish_gauges(&self) {
        let in_flight = self.state.concurrency.in_flight();
        self.links.in_flight.send_replace(in_flight);
        if let Ok(mut m) = self.metrics.write() {
            m.in_flight = in_flight;
            m.current_limit = self.state.concurrency.current_limit();
            m.ready_depth = self.state.ready.len();
            m.delayed_depth = self.state.delayed.len();
        }
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
