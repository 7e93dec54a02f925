//! # ocf-core
//!
//! Shared building blocks of the OCF device SDK: resource-link and endpoint
//! schema, the CoAP message model and content-format codecs, the transport
//! seams implemented by the CoAP layer, and [`Device`], which owns the
//! per-device connection cache and the physical observations issued to it.
//!
//! ## Connection management
//!
//! A device advertises several endpoints (plain and DTLS datagram, plain and
//! TLS stream). [`Device::connect`] walks them in order, reuses a cached
//! connection for an already-resolved address, otherwise dials with the
//! scheme-appropriate strategy and caches the result. Concurrent first-time
//! dials to one address converge on a single connection.
//!
//! ```rust,ignore
//! use ocf_core::{Device, DeviceConfig, Endpoint};
//!
//! let device = Device::new("3f1c…", vec!["oic.d.light".into()], DeviceConfig::default(), dialer, Some(tls));
//! let conn = device.connect(&[Endpoint::new("coaps+tcp://192.168.1.7:41000")]).await?;
//! ```

pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod identity;
pub mod logging;
pub mod message;
pub mod observation;
pub mod schema;
pub mod tls;
pub mod transport;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use codec::{Codec, Decoder, JsonCodec};
pub use config::DeviceConfig;
pub use device::{Device, DeviceObservation};
pub use error::{
    CodecError, ConnectError, ConnectionError, DialError, EndpointError, Error, IdentityError,
    Result, SchemaError, TlsError,
};
pub use identity::{
    device_id_from_identity_certificate, identity_verifier, verify_identity_certificate,
    IDENTITY_CERTIFICATE_EKU,
};
pub use message::{Code, MediaType, Message};
pub use observation::{ObservationError, ObservationHandler};
pub use schema::{get_resource_link, Addr, Endpoint, ResourceLink, Scheme};
pub use tls::{ClientIdentity, TlsConfig};
pub use transport::{
    CloseHandler, Connection, Dialer, ObservationEvent, ObservationStream, PeerVerifier,
    SecureDialConfig,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        Codec, Connection, Decoder, Device, DeviceConfig, Dialer, Endpoint, Error, JsonCodec,
        MediaType, Message, ObservationError, ObservationHandler, ResourceLink, Result, TlsConfig,
    };
}
