use std::time::Duration;

use thiserror::Error;

/// Failure reported by a task handler.
///
/// The variant is decided once, at the handler boundary. Transient failures
/// are retried with backoff; permanent failures go straight to the dead-letter
/// store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl TaskError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    /// The bare message, without the classification prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) => m,
        }
    }
}

// Unclassified errors are retry-eligible.
impl From<anyhow::Error> for TaskError {
    fn from(e: anyhow::Error) -> Self {
        Self::Transient(format!("{:#}", e))
    }
}

impl From<std::io::Error> for TaskError {
    fn from(e: std::io::Error) -> Self {
        Self::Transient(e.to_string())
    }
}

/// Registration rejected at `schedule()` time. Never enters the queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulingError {
    #[error("task id must not be empty")]
    EmptyId,

    #[error("task already registered: {0}")]
    DuplicateId(String),

    #[error("invalid schedule for task {id}: {reason}")]
    InvalidSchedule { id: String, reason: String },
}

/// Raised (and only logged) when the shutdown grace period elapses with
/// work still running.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("shutdown grace period of {grace:?} elapsed with {in_flight} task(s) still in flight")]
pub struct ShutdownTimeout {
    pub grace: Duration,
    pub in_flight: usize,
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Config(String),

    #[error(transparent)]
    Scheduling(#[from] SchedulingError),

    #[error("event bus error: {0}")]
    Bus(String),

    #[error("task {0} is event-triggered but no event subscriber was configured")]
    NoEventSource(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("scheduler is no longer running")]
    Stopped,
}
