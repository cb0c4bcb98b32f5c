use thiserror::Error;

/// Errors that can occur on the event bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    /// The subscriber fell behind and `n` messages were dropped.
    #[error("subscriber lagged, {0} message(s) skipped")]
    Lagged(u64),

    /// Every publisher is gone; no further messages will arrive.
    #[error("bus closed")]
    Closed,
}

impl BusError {
    /// Whether the subscription can keep receiving after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Closed)
    }
}
