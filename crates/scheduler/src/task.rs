use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use taktgeber_core::TaskError;

/// Dispatch priority. Lower rank runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High = 0,
    Medium = 1,
    Low = 2,
}

impl Priority {
    pub fn rank(self) -> u8 {
        self as u8
    }
}

/// What put an instance in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Interval,
    Event,
    Manual,
}

/// How a task gets fired. A task has exactly one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Interval(Duration),
    Event(String),
}

pub type TaskFuture = BoxFuture<'static, Result<(), TaskError>>;

/// Async task body. Receives a token that is cancelled on shutdown or timeout.
pub type TaskHandler = Arc<dyn Fn(CancellationToken) -> TaskFuture + Send + Sync>;

/// A registered unit of background work.
#[derive(Clone)]
pub struct TaskDefinition {
    id: String,
    priority: Priority,
    trigger: Trigger,
    max_retries: Option<u32>,
    timeout: Option<Duration>,
    handler: TaskHandler,
}

impl TaskDefinition {
    /// A task fired every `interval`, first one `interval` after start.
    pub fn periodic<F, Fut>(
        id: impl Into<String>,
        interval: Duration,
        priority: Priority,
        handler: F,
    ) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        Self::new(id, Trigger::Interval(interval), priority, handler)
    }

    /// A task fired once per bus message whose topic equals `topic`.
    pub fn on_event<F, Fut>(
        id: impl Into<String>,
        topic: impl Into<String>,
        priority: Priority,
        handler: F,
    ) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        Self::new(id, Trigger::Event(topic.into()), priority, handler)
    }

    fn new<F, Fut>(id: impl Into<String>, trigger: Trigger, priority: Priority, handler: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        Self {
            id: id.into(),
            priority,
            trigger,
            max_retries: None,
            timeout: None,
            handler: Arc::new(move |token| handler(token).boxed()),
        }
    }

    /// Override the process-wide retry budget for this task.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Bound each attempt. An attempt that overruns is cancelled and counts
    /// as a transient failure.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    pub fn interval(&self) -> Option<Duration> {
        match &self.trigger {
            Trigger::Interval(d) => Some(*d),
            Trigger::Event(_) => None,
        }
    }

    /// Interval in milliseconds, saturating at `u64::MAX`.
    pub fn interval_ms(&self) -> Option<u64> {
        self.interval()
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn trigger_event(&self) -> Option<&str> {
        match &self.trigger {
            Trigger::Event(topic) => Some(topic),
            Trigger::Interval(_) => None,
        }
    }

    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn run(&self, token: CancellationToken) -> TaskFuture {
        (self.handler)(token)
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("trigger", &self.trigger)
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
