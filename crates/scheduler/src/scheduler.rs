use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::info;

use taktgeber_bus::EventSubscriber;
use taktgeber_core::{SchedulerConfig, SchedulerError, SchedulingError};

use crate::clock::Clock;
use crate::concurrency::ConcurrencyController;
use crate::coordinator::{Command, Coordinator, CoordinatorLinks};
use crate::dead_letter::{DeadLetterRecord, DeadLetterStore, InMemoryDeadLetterStore};
use crate::ingress::{self, Routes};
use crate::metrics::{names, MetricValue, MetricsSink, SchedulerMetrics, TracingMetrics};
use crate::shutdown::{Background, ShutdownCoordinator, ShutdownReport};
use crate::state::SchedulerState;
use crate::task::{Origin, TaskDefinition, Trigger};

/// Registration phase of the scheduler.
///
/// Collect task definitions with [`schedule`](Self::schedule), then call
/// [`start`](Self::start) to hand everything to the coordinator.
pub struct Scheduler {
    config: SchedulerConfig,
    tasks: Vec<Arc<TaskDefinition>>,
    sink: Arc<dyn MetricsSink>,
    dead_letters: Arc<dyn DeadLetterStore>,
    subscriber: Option<Arc<dyn EventSubscriber>>,
    rng_seed: Option<u64>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            tasks: Vec::new(),
            sink: Arc::new(TracingMetrics),
            dead_letters: Arc::new(InMemoryDeadLetterStore::new()),
            subscriber: None,
            rng_seed: None,
        }
    }

    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_dead_letter_store(mut self, store: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letters = store;
        self
    }

    /// Source of events for tasks built with [`TaskDefinition::on_event`].
    pub fn with_event_subscriber(mut self, subscriber: Arc<dyn EventSubscriber>) -> Self {
        self.subscriber = Some(subscriber);
        self
    }

    /// Fix the jitter sequence, for reproducible runs.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|t| t.id())
    }

    /// Register a task. Rejected definitions never reach the queue.
    pub fn schedule(&mut self, task: TaskDefinition) -> Result<(), SchedulingError> {
        let id = task.id();
        if id.trim().is_empty() {
            return Err(SchedulingError::EmptyId);
        }
        if self.tasks.iter().any(|t| t.id() == id) {
            return Err(SchedulingError::DuplicateId(id.to_string()));
        }
        let invalid = |reason: &str| SchedulingError::InvalidSchedule {
            id: id.to_string(),
            reason: reason.to_string(),
        };
        match task.trigger() {
            Trigger::Interval(interval) if interval.is_zero() => {
                return Err(invalid("interval must be greater than zero"));
            }
            Trigger::Interval(interval) if u64::try_from(interval.as_millis()).is_err() => {
                return Err(invalid("interval is too large"));
            }
            Trigger::Event(topic) if topic.trim().is_empty() => {
                return Err(invalid("trigger event must not be empty"));
            }
            _ => {}
        }
        if task.timeout().is_some_and(|t| t.is_zero()) {
            return Err(invalid("timeout must be greater than zero"));
        }

        self.sink.emit(names::TASK_REGISTERED, MetricValue::Text(id.to_string()));
        if let Some(interval) = task.interval() {
            self.sink.emit(
                names::TASK_INTERVAL_MS,
                MetricValue::Number(interval.as_millis() as f64),
            );
        }
        info!(
            task_id = %id,
            priority = ?task.priority(),
            trigger = ?task.trigger(),
            "registered task"
        );
        self.tasks.push(Arc::new(task));
        Ok(())
    }

    /// Start the coordinator (and event ingress if any task needs it).
    ///
    /// Event subscriptions are in place before this returns, so events
    /// published afterwards are not missed.
    pub async fn start(self) -> Result<SchedulerHandle, SchedulerError> {
        self.config.validate()?;

        let mut routes = Routes::new();
        for task in &self.tasks {
            if let Some(topic) = task.trigger_event() {
                routes
                    .entry(topic.to_string())
                    .or_default()
                    .push(task.id().to_string());
            }
        }

        let subscriber = match (&self.subscriber, routes.values().flatten().next()) {
            (None, Some(task_id)) => return Err(SchedulerError::NoEventSource(task_id.clone())),
            (Some(subscriber), Some(_)) => {
                ingress::subscribe_all(&**subscriber, &routes)
                    .await
                    .map_err(|e| SchedulerError::Bus(e.to_string()))?;
                Some(Arc::clone(subscriber))
            }
            (_, None) => None,
        };

        let clock = Clock::new();
        let now = clock.now_ms();
        let mut state = SchedulerState::new(ConcurrencyController::from_config(&self.config.concurrency));
        for task in &self.tasks {
            if let Some(interval_ms) = task.interval_ms() {
                state.arm_periodic(task, now.saturating_add(interval_ms), now);
            }
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (interrupt_tx, interrupt_rx) = watch::channel(false);
        let (in_flight_tx, in_flight_rx) = watch::channel(0usize);
        let workers = CancellationToken::new();
        let halt = CancellationToken::new();
        let ingress_stop = CancellationToken::new();
        let metrics = Arc::new(RwLock::new(SchedulerMetrics::default()));
        let rng = match self.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let tasks: HashMap<String, Arc<TaskDefinition>> = self
            .tasks
            .iter()
            .map(|t| (t.id().to_string(), Arc::clone(t)))
            .collect();
        let task_ids: HashSet<String> = tasks.keys().cloned().collect();

        let coordinator = Coordinator::new(
            &self.config,
            tasks,
            state,
            clock,
            rng,
            Arc::clone(&self.dead_letters),
            Arc::clone(&self.sink),
            Arc::clone(&metrics),
            CoordinatorLinks {
                commands: command_rx,
                interrupt: interrupt_rx,
                in_flight: in_flight_tx,
                workers: workers.clone(),
                halt: halt.clone(),
            },
        );
        let coordinator = tokio::spawn(coordinator.run());

        let ingress = subscriber.map(|subscriber| {
            ingress::spawn_ingress(subscriber, routes, command_tx.clone(), ingress_stop.clone())
        });

        info!(
            tasks = task_ids.len(),
            grace = ?self.config.grace_period(),
            "scheduler started"
        );

        let shutdown = ShutdownCoordinator::new(
            interrupt_tx,
            ingress_stop,
            workers,
            halt,
            in_flight_rx.clone(),
            self.config.grace_period(),
            Arc::clone(&self.sink),
            Background { coordinator, ingress },
        );

        Ok(SchedulerHandle {
            inner: Arc::new(HandleInner {
                commands: command_tx,
                task_ids,
                metrics,
                in_flight: in_flight_rx,
                dead_letters: self.dead_letters,
                shutdown,
            }),
        })
    }
}

struct HandleInner {
    commands: mpsc::UnboundedSender<Command>,
    task_ids: HashSet<String>,
    metrics: Arc<RwLock<SchedulerMetrics>>,
    in_flight: watch::Receiver<usize>,
    dead_letters: Arc<dyn DeadLetterStore>,
    shutdown: ShutdownCoordinator,
}

/// Control surface of a running scheduler. Cheap to clone.
#[derive(Clone)]
pub struct SchedulerHandle {
    inner: Arc<HandleInner>,
}

impl SchedulerHandle {
    /// Queue an immediate run of a registered task, outside its normal trigger.
    pub fn trigger(&self, task_id: &str) -> Result<(), SchedulerError> {
        if !self.inner.task_ids.contains(task_id) {
            return Err(SchedulerError::UnknownTask(task_id.to_string()));
        }
        if self.inner.shutdown.is_interrupted() {
            return Err(SchedulerError::Stopped);
        }
        self.inner
            .commands
            .send(Command::Trigger {
                task_id: task_id.to_string(),
                origin: Origin::Manual,
                correlation_id: None,
            })
            .map_err(|_| SchedulerError::Stopped)
    }

    /// Stop the scheduler. Safe to call any number of times, concurrently;
    /// the shutdown sequence runs once and every caller gets its report.
    pub async fn interrupt(&self) -> ShutdownReport {
        self.inner.shutdown.interrupt().await
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.shutdown.is_interrupted()
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        self.inner
            .metrics
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn in_flight(&self) -> usize {
        *self.inner.in_flight.borrow()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.inner.dead_letters.snapshot()
    }
}
