use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taktgeber_bus::{BusError, EventSubscriber};

use crate::coordinator::Command;
use crate::task::Origin;

/// Topic → ids of the tasks it fires.
pub(crate) type Routes = HashMap<String, Vec<String>>;

/// Register one subscription per distinct topic.
pub(crate) async fn subscribe_all(
    subscriber: &dyn EventSubscriber,
    routes: &Routes,
) -> Result<(), BusError> {
    for topic in routes.keys() {
        subscriber.subscribe(topic).await?;
    }
    Ok(())
}

/// Forward matching bus messages to the coordinator until `stop` fires,
/// the bus closes, or the coordinator goes away.
pub(crate) fn spawn_ingress(
    subscriber: Arc<dyn EventSubscriber>,
    routes: Routes,
    commands: mpsc::UnboundedSender<Command>,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(topics = routes.len(), "event ingress started");
        loop {
            let received = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                received = subscriber.recv() => received,
            };

            let message = match received {
                Ok(message) => message,
                Err(BusError::Closed) => {
                    warn!("event bus closed, ingress stopping");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "event ingress receive error");
                    continue;
                }
            };

            // Subscriptions are prefixes; tasks fire on the exact topic only.
            let Some(task_ids) = routes.get(&message.topic) else {
                debug!(topic = %message.topic, "no task for topic");
                continue;
            };

            for task_id in task_ids {
                let command = Command::Trigger {
                    task_id: task_id.clone(),
                    origin: Origin::Event,
                    correlation_id: Some(message.correlation_id),
                };
                if commands.send(command).is_err() {
                    debug!("coordinator gone, ingress stopping");
                    return;
                }
            }
        }
        info!("event ingress stopped");
    })
}
