//! Application-facing observation callbacks.

use crate::codec::Decoder;

/// Why an observation ended abnormally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObservationError {
    /// The device sent a notification without a payload
    #[error("unexpected empty body")]
    EmptyBody,

    #[error("observation canceled by device: {0}")]
    Canceled(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// Failure reported by an upstream event stream
    #[error("{0}")]
    Stream(String),
}

/// Receives updates for one observation.
///
/// After `on_close` or `error` has been called, no further callbacks arrive.
pub trait ObservationHandler: Send + Sync {
    /// A new resource representation.
    fn handle(&self, decoder: Decoder);

    /// The observation ended normally.
    fn on_close(&self);

    /// The observation ended because of `err`.
    fn error(&self, err: ObservationError);
}
