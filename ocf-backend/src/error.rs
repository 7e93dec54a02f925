//! Error types for the cloud gateway client.

use std::time::Duration;

use ocf_core::CodecError;

use crate::gateway::StatusCode;

/// Boxed error returned by resource event handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Transport-level failure of the gateway RPC.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("stream error: {0}")]
    Stream(String),

    #[error("{code}: {message}")]
    Status { code: StatusCode, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("event stream closed before the subscription was acknowledged")]
    ClosedBeforeAck,

    #[error("subscription not acknowledged within {0:?}")]
    AckTimeout(Duration),

    #[error("unexpected acknowledgment: {0}")]
    UnexpectedAck(String),

    /// The gateway refused the subscription; displays as the gateway's message
    #[error("{message}")]
    Rejected { code: StatusCode, message: String },

    #[error("{0}")]
    Canceled(String),

    #[error("handler failed: {0}")]
    Handler(HandlerError),

    #[error("unknown event occurs on recv resource content changed: {0}")]
    UnknownEvent(String),
}

fn join_errors(errors: &[SubscriptionError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("observation {0} not found")]
    ObservationNotFound(String),

    #[error("too many subscriptions (limit {0})")]
    TooManySubscriptions(usize),

    #[error("cannot close client: {}", join_errors(.0))]
    Close(Vec<SubscriptionError>),

    #[error("configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_displays_gateway_message() {
        let err = SubscriptionError::Rejected {
            code: StatusCode::NotFound,
            message: "resource not found".to_string(),
        };
        assert_eq!(err.to_string(), "resource not found");
    }

    #[test]
    fn test_close_error_lists_failures() {
        let err = ClientError::Close(vec![
            SubscriptionError::Gateway(GatewayError::Stream("reset".to_string())),
            SubscriptionError::ClosedBeforeAck,
        ]);
        let text = err.to_string();
        assert!(text.contains("stream error: reset"));
        assert!(text.contains("; event stream closed"));
    }
}
