//! Error types for the local client.

use std::time::Duration;

use ocf_core::{CodecError, SchemaError};

fn join_errors(errors: &[ocf_core::Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failure of the external device enumeration collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DiscoveryError {
    #[error("device {0} not found")]
    NotFound(String),

    #[error("discovery failed: {0}")]
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Device(#[from] ocf_core::Error),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("device {0} is already cached as a different instance")]
    DeviceCacheConflict(String),

    #[error("invalid ID: {0}")]
    InvalidObservationId(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("cannot close client: {}", join_errors(.0))]
    Close(Vec<ocf_core::Error>),

    #[error("configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
