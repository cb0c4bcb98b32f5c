//! In-process background task scheduler.
//!
//! Periodic and event-triggered tasks run under an adaptive concurrency
//! limit, with capped exponential backoff on transient failures, a
//! dead-letter store for work that cannot succeed, and a graceful,
//! idempotent shutdown.

mod clock;
pub mod concurrency;
mod coordinator;
pub mod dead_letter;
mod execution;
mod ingress;
pub mod metrics;
pub mod queue;
pub mod retry;
mod scheduler;
pub mod shutdown;
mod state;
pub mod task;

pub use clock::Clock;
pub use concurrency::ConcurrencyController;
pub use dead_letter::{DeadLetterRecord, DeadLetterStats, DeadLetterStore, InMemoryDeadLetterStore};
pub use metrics::{MemoryMetrics, MetricValue, MetricsSink, SchedulerMetrics, TracingMetrics};
pub use queue::{InstanceId, PriorityQueue, QueueItem, QueueOrder};
pub use retry::{RetryDecision, RetryPolicy, RetryState};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use shutdown::ShutdownReport;
pub use task::{Origin, Priority, TaskDefinition, TaskFuture, TaskHandler, Trigger};

pub use taktgeber_core::{
    SchedulerConfig, SchedulerError, SchedulingError, ShutdownTimeout, TaskError,
};
pub use tokio_util::sync::CancellationToken;
