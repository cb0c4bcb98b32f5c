pub mod error;
pub mod local;
pub mod message;
pub mod traits;

pub use error::BusError;
pub use local::{LocalBus, LocalSubscriber};
pub use message::Message;
pub use traits::{EventPublisher, EventSubscriber};
