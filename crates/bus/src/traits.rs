use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BusError;
use crate::message::Message;

/// Fan-out side of the bus.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a message to every subscriber whose prefixes match its topic.
    async fn publish(&self, message: Message) -> Result<(), BusError>;
}

/// Blanket implementation so `Arc<dyn EventPublisher>` can be used directly.
#[async_trait]
impl<T: EventPublisher + ?Sized> EventPublisher for Arc<T> {
    async fn publish(&self, message: Message) -> Result<(), BusError> {
        (**self).publish(message).await
    }
}

/// Receiving side of the bus.
///
/// A subscriber with no subscriptions receives nothing. Subscriptions are
/// topic prefixes and accumulate.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn subscribe(&self, topic_prefix: &str) -> Result<(), BusError>;

    /// Wait for the next message matching any subscription.
    async fn recv(&self) -> Result<Message, BusError>;
}

#[async_trait]
impl<T: EventSubscriber + ?Sized> EventSubscriber for Arc<T> {
    async fn subscribe(&self, topic_prefix: &str) -> Result<(), BusError> {
        (**self).subscribe(topic_prefix).await
    }

    async fn recv(&self) -> Result<Message, BusError> {
        (**self).recv().await
    }
}
