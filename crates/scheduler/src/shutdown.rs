use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use taktgeber_core::ShutdownTimeout;

use crate::metrics::{names, MetricValue, MetricsSink};

/// Outcome of an `interrupt()`. Every caller gets the same report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Every in-flight attempt finished inside the grace period.
    pub drained: bool,
    /// Attempts still running when the grace period ran out.
    pub in_flight_at_deadline: usize,
    /// Queued instances dropped when the coordinator halted.
    pub discarded: usize,
    pub elapsed: Duration,
}

/// Background tasks owned by a running scheduler.
pub(crate) struct Background {
    pub coordinator: JoinHandle<usize>,
    pub ingress: Option<JoinHandle<()>>,
}

/// Runs the interrupt sequence once, however many callers ask for it.
pub(crate) struct ShutdownCoordinator {
    interrupt: watch::Sender<bool>,
    ingress_stop: CancellationToken,
    workers: CancellationToken,
    halt: CancellationToken,
    in_flight: watch::Receiver<usize>,
    grace: Duration,
    sink: Arc<dyn MetricsSink>,
    background: Mutex<Option<Background>>,
    report: OnceCell<ShutdownReport>,
}

impl ShutdownCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        interrupt: watch::Sender<bool>,
        ingress_stop: CancellationToken,
        workers: CancellationToken,
        halt: CancellationToken,
        in_flight: watch::Receiver<usize>,
        grace: Duration,
        sink: Arc<dyn MetricsSink>,
        background: Background,
    ) -> Self {
        Self {
            interrupt,
            ingress_stop,
            workers,
            halt,
            in_flight,
            grace,
            sink,
            background: Mutex::new(Some(background)),
            report: OnceCell::new(),
        }
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        *self.interrupt.borrow()
    }

    pub(crate) async fn interrupt(&self) -> ShutdownReport {
        self.report.get_or_init(|| self.run()).await.clone()
    }

    async fn run(&self) -> ShutdownReport {
        let started = Instant::now();
        info!(grace = ?self.grace, "shutdown requested");

        // 1. Stop pulling work and stop listening for events.
        self.interrupt.send_replace(true);
        self.ingress_stop.cancel();
        self.sink.emit(names::SCHEDULER_INTERRUPTED, MetricValue::Number(1.0));

        // 2. Ask running handlers to wind down.
        self.workers.cancel();

        // 3. Wait for them, bounded by the grace period.
        let mut in_flight = self.in_flight.clone();
        let drained = matches!(
            tokio::time::timeout(self.grace, in_flight.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        );
        let in_flight_at_deadline = if drained { 0 } else { *self.in_flight.borrow() };

        // 4. Overrunning handlers are left alone, only reported.
        if !drained {
            let timeout = ShutdownTimeout {
                grace: self.grace,
                in_flight: in_flight_at_deadline,
            };
            warn!(error = %timeout, "shutdown did not drain");
            self.sink.emit(
                names::SCHEDULER_SHUTDOWN_TIMEOUT,
                MetricValue::Number(in_flight_at_deadline as f64),
            );
        }

        // 5. Halt the loop, drop what is queued, flush telemetry.
        self.halt.cancel();
        let background = self.background.lock().await.take();
        let discarded = match background {
            Some(background) => join_background(background).await,
            None => 0,
        };
        self.sink.flush();

        let report = ShutdownReport {
            drained,
            in_flight_at_deadline,
            discarded,
            elapsed: started.elapsed(),
        };
        info!(
            drained = report.drained,
            in_flight_at_deadline = report.in_flight_at_deadline,
            discarded = report.discarded,
            elapsed = ?report.elapsed,
            "shutdown complete"
        );
        report
    }
}

async fn join_background(background: Background) -> usize {
    if let Some(ingress) = background.ingress {
        if let Err(e) = ingress.await {
            warn!(error = %e, "event ingress ended abnormally");
        }
    }
    match background.coordinator.await {
        Ok(discarded) => discarded,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => {
            warn!(error = %e, "coordinator ended abnormally");
            0
        }
    }
}
