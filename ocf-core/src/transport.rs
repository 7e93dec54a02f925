//! Seams between the SDK and the CoAP transport.
//!
//! The SDK never speaks CoAP itself. A [`Dialer`] produces [`Connection`]s for
//! each of the four schemes, and everything above works against the trait
//! objects so the transport can be swapped or mocked.

use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::CertificateDer;
use tokio::sync::mpsc;

use crate::error::{ConnectionError, IdentityError};
use crate::message::{MediaType, Message};
use crate::schema::Addr;
use crate::tls::ClientIdentity;

/// Callback invoked once when a connection goes away.
///
/// Receives the error that closed it, or `None` for a local close.
pub type CloseHandler = Box<dyn FnOnce(Option<ConnectionError>) + Send>;

/// Extra check applied to the peer certificate after chain validation.
pub type PeerVerifier = Arc<dyn Fn(&CertificateDer<'_>) -> Result<(), IdentityError> + Send + Sync>;

/// Something a device pushed on an observation.
#[derive(Debug)]
pub enum ObservationEvent {
    Notification(Message),
    /// The device ended the observation, optionally saying why.
    Canceled { reason: Option<String> },
    Error(ConnectionError),
}

/// Handle to a running CoAP observation.
///
/// The event channel closing without a final event means the observation
/// ended cleanly.
#[derive(Debug)]
pub struct ObservationStream {
    pub token: String,
    pub events: mpsc::Receiver<ObservationEvent>,
}

/// An established CoAP connection.
#[async_trait]
pub trait Connection: Send + Sync {
    fn remote_addr(&self) -> &Addr;

    async fn get(&self, href: &str, accept: MediaType) -> Result<Message, ConnectionError>;

    async fn observe(
        &self,
        href: &str,
        accept: MediaType,
    ) -> Result<ObservationStream, ConnectionError>;

    async fn cancel_observation(&self, token: &str) -> Result<(), ConnectionError>;

    /// Install the handler run when the connection closes. Replaces any
    /// previously registered handler.
    ///
    /// A connection that is already closed must run `handler` immediately,
    /// so a close racing registration is never lost.
    fn register_close_handler(&self, handler: CloseHandler);

    async fn close(&self) -> Result<(), ConnectionError>;
}

/// Credentials and verification policy for a secure dial.
#[derive(Clone)]
pub struct SecureDialConfig {
    pub identity: ClientIdentity,
    pub authorities: Vec<CertificateDer<'static>>,
    pub verify_peer: PeerVerifier,
}

impl std::fmt::Debug for SecureDialConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureDialConfig")
            .field("identity", &self.identity)
            .field("authorities", &self.authorities.len())
            .finish_non_exhaustive()
    }
}

/// Opens connections, one method per transport scheme.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial_udp(&self, addr: &Addr) -> Result<Arc<dyn Connection>, ConnectionError>;

    async fn dial_udp_secure(
        &self,
        addr: &Addr,
        config: SecureDialConfig,
    ) -> Result<Arc<dyn Connection>, ConnectionError>;

    async fn dial_tcp(&self, addr: &Addr) -> Result<Arc<dyn Connection>, ConnectionError>;

    async fn dial_tcp_secure(
        &self,
        addr: &Addr,
        config: SecureDialConfig,
    ) -> Result<Arc<dyn Connection>, ConnectionError>;
}
