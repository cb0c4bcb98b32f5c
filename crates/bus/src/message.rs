use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event envelope carried on the bus.
///
/// The payload is MessagePack-encoded so publishers and subscribers only share
/// the payload type, not a transport format. `topic` is what subscribers match
/// against; `correlation_id` ties a scheduled run back to the event that
/// caused it in the logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Event name, e.g. `chat.message.flagged`.
    pub topic: String,

    #[serde(with = "raw_bytes")]
    pub payload: Vec<u8>,

    pub published_at: DateTime<Utc>,

    pub correlation_id: Uuid,
}

impl Message {
    /// Build a message, encoding `payload` with MessagePack.
    pub fn new<T: Serialize>(
        topic: impl Into<String>,
        payload: &T,
    ) -> Result<Self, rmp_serde::encode::Error> {
        Self::with_correlation(topic, payload, Uuid::new_v4())
    }

    pub fn with_correlation<T: Serialize>(
        topic: impl Into<String>,
        payload: &T,
        correlation_id: Uuid,
    ) -> Result<Self, rmp_serde::encode::Error> {
        Ok(Self {
            topic: topic.into(),
            payload: rmp_serde::to_vec(payload)?,
            published_at: Utc::now(),
            correlation_id,
        })
    }

    /// A message with no payload; only the topic matters.
    pub fn signal(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: Vec::new(),
            published_at: Utc::now(),
            correlation_id: Uuid::new_v4(),
        }
    }

    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, rmp_serde::decode::Error> {
        rmp_serde::from_slice(&self.payload)
    }

    /// Whether this message falls under a subscription prefix. The empty
    /// prefix matches everything.
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        self.topic.starts_with(prefix)
    }
}

mod raw_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let bytes: &[u8] = Deserialize::deserialize(d)?;
        Ok(bytes.to_vec())
    }
}
