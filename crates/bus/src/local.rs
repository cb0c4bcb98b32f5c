use std::sync::RwLock;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use crate::error::BusError;
use crate::message::Message;
use crate::traits::{EventPublisher, EventSubscriber};

const DEFAULT_CAPACITY: usize = 1024;

/// In-process bus on a tokio broadcast channel.
///
/// Cloning shares the channel. Once every clone is dropped, subscribers see
/// [`BusError::Closed`] after draining what was already buffered.
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<Message>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// A new subscriber. It only sees messages published after this call.
    pub fn subscriber(&self) -> LocalSubscriber {
        LocalSubscriber {
            rx: Mutex::new(self.tx.subscribe()),
            prefixes: RwLock::new(Vec::new()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl EventPublisher for LocalBus {
    async fn publish(&self, message: Message) -> Result<(), BusError> {
        let topic = message.topic.clone();
        match self.tx.send(message) {
            Ok(receivers) => debug!(topic = %topic, receivers, "published message"),
            // Nobody listening is not an error for a fan-out bus.
            Err(_) => debug!(topic = %topic, "published message with no subscribers"),
        }
        Ok(())
    }
}

pub struct LocalSubscriber {
    rx: Mutex<broadcast::Receiver<Message>>,
    prefixes: RwLock<Vec<String>>,
}

impl LocalSubscriber {
    fn wants(&self, message: &Message) -> bool {
        match self.prefixes.read() {
            Ok(prefixes) => prefixes.iter().any(|p| message.matches_prefix(p)),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl EventSubscriber for LocalSubscriber {
    async fn subscribe(&self, topic_prefix: &str) -> Result<(), BusError> {
        if let Ok(mut prefixes) = self.prefixes.write() {
            if !prefixes.iter().any(|p| p == topic_prefix) {
                prefixes.push(topic_prefix.to_string());
            }
        }
        info!(topic_prefix = %topic_prefix, "subscribed to topic prefix");
        Ok(())
    }

    async fn recv(&self) -> Result<Message, BusError> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Ok(message) if self.wants(&message) => return Ok(message),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => return Err(BusError::Lagged(n)),
                Err(broadcast::error::RecvError::Closed) => return Err(BusError::Closed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn delivers_only_matching_prefixes() {
        let bus = LocalBus::default();
        let sub = bus.subscriber();
        sub.subscribe("chat.").await.unwrap();

        bus.publish(Message::signal("tenant.config.changed")).await.unwrap();
        bus.publish(Message::signal("chat.message.flagged")).await.unwrap();

        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.topic, "chat.message.flagged");
    }

    #[tokio::test]
    async fn no_subscription_receives_nothing() {
        let bus = LocalBus::default();
        let sub = bus.subscriber();

        bus.publish(Message::signal("chat.message.flagged")).await.unwrap();

        let res = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await;
        assert!(res.is_err(), "unsubscribed receiver should stay pending");
    }

    #[tokio::test]
    async fn every_subscriber_gets_a_copy() {
        let bus = LocalBus::default();
        let a = bus.subscriber();
        let b = bus.subscriber();
        a.subscribe("").await.unwrap();
        b.subscribe("chat.").await.unwrap();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(Message::signal("chat.session.closed")).await.unwrap();

        assert_eq!(a.recv().await.unwrap().topic, "chat.session.closed");
        assert_eq!(b.recv().await.unwrap().topic, "chat.session.closed");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = LocalBus::default();
        bus.publish(Message::signal("chat.message.flagged")).await.unwrap();
    }

    #[tokio::test]
    async fn slow_subscriber_reports_lag_then_recovers() {
        let bus = LocalBus::new(2);
        let sub = bus.subscriber();
        sub.subscribe("").await.unwrap();

        for i in 0..5u32 {
            bus.publish(Message::new("tick", &i).unwrap()).await.unwrap();
        }

        let err = sub.recv().await.unwrap_err();
        assert!(matches!(err, BusError::Lagged(3)));
        assert!(err.is_recoverable());

        let next = sub.recv().await.unwrap();
        assert_eq!(next.decode::<u32>().unwrap(), 3);
    }

    #[tokio::test]
    async fn dropping_the_bus_closes_subscribers() {
        let bus = LocalBus::default();
        let sub = bus.subscriber();
        sub.subscribe("").await.unwrap();
        bus.publish(Message::signal("last")).await.unwrap();
        drop(bus);

        assert_eq!(sub.recv().await.unwrap().topic, "last");
        let err = sub.recv().await.unwrap_err();
        assert!(matches!(err, BusError::Closed));
        assert!(!err.is_recoverable());
    }
}
