//! Error types for the ocf-core crate.

use std::fmt;
use std::time::Duration;

use crate::message::{Code, MediaType};

fn join_errors<E: fmt::Display>(errors: &[E]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors parsing endpoints and resolving resource links.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("unknown scheme: {0}")]
    UnknownScheme(String),

    #[error("invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("resource link {0} not found")]
    ResourceLinkNotFound(String),
}

/// Errors reported by a transport connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection refused: {0}")]
    Refused(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("request {href} failed: {reason}")]
    Request { href: String, reason: String },

    #[error("observation {0} not found")]
    ObservationNotFound(String),

    #[error("connection closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors obtaining credentials from a [`crate::TlsConfig`].
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("tls is not configured")]
    NotConfigured,

    #[error("cannot get certificate: {0}")]
    Certificate(String),

    #[error("cannot get certificate authorities: {0}")]
    CertificateAuthorities(String),
}

/// Errors validating an OCF identity certificate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("cannot parse certificate: {0}")]
    Parse(String),

    #[error("certificate has no extended key usage")]
    MissingExtendedKeyUsage,

    #[error("extended key usage does not contain {0}")]
    MissingKeyUsage(&'static str),

    #[error("certificate has no subject common name")]
    MissingCommonName,

    #[error("invalid subject common name: {0}")]
    InvalidCommonName(String),
}

/// Errors decoding a message body.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unexpected empty body")]
    EmptyBody,

    #[error("unsupported content format {actual}, expected {expected}")]
    UnsupportedContentFormat { expected: MediaType, actual: MediaType },

    #[error("cannot decode body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a single endpoint could not be dialed.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error(transparent)]
    InvalidEndpoint(#[from] SchemaError),

    #[error("dtls is disabled by client option")]
    DtlsDisabled,

    #[error("tcp-tls is disabled by client option")]
    TcpTlsDisabled,

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("dial timed out after {0:?}")]
    Timeout(Duration),
}

/// A failed attempt against one candidate endpoint.
#[derive(Debug, thiserror::Error)]
#[error("cannot connect to {endpoint}: {reason}")]
pub struct EndpointError {
    pub endpoint: String,
    #[source]
    pub reason: DialError,
}

impl EndpointError {
    pub fn new(endpoint: impl Into<String>, reason: impl Into<DialError>) -> Self {
        Self {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }
}

/// Failure of [`crate::Device::connect`] across all candidate endpoints.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("cannot connect to empty endpoints")]
    NoEndpoints,

    #[error("cannot connect to any endpoint: {}", join_errors(.0))]
    AllEndpointsFailed(Vec<EndpointError>),
}

/// Errors from device-level operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("request {href} returned {code}")]
    UnexpectedCode { href: String, code: Code },

    #[error("observation {0} not found")]
    ObservationNotFound(String),

    #[error("cannot get sdk id: {}", join_errors(.0))]
    SdkOwnerId(Vec<IdentityError>),

    #[error("cannot close device {device_id}: {}", join_errors(.errors))]
    Close { device_id: String, errors: Vec<Error> },
}

/// Convenience type alias for Results using the core Error.
pub type Result<T> = std::result::Result<T, Error>;
