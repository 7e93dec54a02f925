//! Per-device connection management and physical observations.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::DeviceConfig;
use crate::error::{ConnectError, DialError, EndpointError, Error, Result, TlsError};
use crate::identity::{device_id_from_identity_certificate, identity_verifier};
use crate::message::{Code, MediaType, Message};
use crate::schema::{Addr, Endpoint, ResourceLink, Scheme};
use crate::tls::TlsConfig;
use crate::transport::{Connection, Dialer, ObservationEvent, PeerVerifier, SecureDialConfig};

struct CachedConnection {
    id: u64,
    conn: Arc<dyn Connection>,
}

type ConnectionMap = Arc<Mutex<HashMap<String, CachedConnection>>>;

struct ActiveObservation {
    href: String,
    token: String,
    conn: Arc<dyn Connection>,
}

/// A physical observation started with [`Device::observe_resource`].
#[derive(Debug)]
pub struct DeviceObservation {
    /// Identifier for [`Device::stop_observing_resource`]
    pub id: String,
    pub events: mpsc::Receiver<ObservationEvent>,
}

/// A discovered OCF device and the connections opened to it.
pub struct Device {
    device_id: String,
    device_types: Vec<String>,
    config: DeviceConfig,
    dialer: Arc<dyn Dialer>,
    tls: Option<TlsConfig>,
    verify_peer: PeerVerifier,
    connections: ConnectionMap,
    observations: DashMap<String, ActiveObservation>,
    next_connection_id: AtomicU64,
}

impl Device {
    pub fn new(
        device_id: impl Into<String>,
        device_types: Vec<String>,
        config: DeviceConfig,
        dialer: Arc<dyn Dialer>,
        tls: Option<TlsConfig>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_types,
            config,
            dialer,
            tls,
            verify_peer: identity_verifier(),
            connections: Arc::new(Mutex::new(HashMap::new())),
            observations: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Replace the peer certificate check applied on secure dials.
    pub fn with_peer_verifier(mut self, verify_peer: PeerVerifier) -> Self {
        self.verify_peer = verify_peer;
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn device_types(&self) -> &[String] {
        &self.device_types
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Number of cached connections.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Number of physical observations currently registered.
    pub fn observation_count(&self) -> usize {
        self.observations.len()
    }

    /// Return a connection to the first reachable endpoint.
    ///
    /// Endpoints are tried in order. A cached connection for an endpoint's
    /// address is returned without dialing; otherwise the endpoint is dialed
    /// and the result cached. Fails with every per-endpoint error when no
    /// endpoint can be reached.
    pub async fn connect(
        &self,
        endpoints: &[Endpoint],
    ) -> std::result::Result<Arc<dyn Connection>, ConnectError> {
        if endpoints.is_empty() {
            return Err(ConnectError::NoEndpoints);
        }

        let mut errors = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            match self.connect_to_endpoint(endpoint).await {
                Ok(conn) => return Ok(conn),
                Err(reason) => {
                    debug!(
                        device_id = %self.device_id,
                        endpoint = %endpoint,
                        error = %reason,
                        "endpoint unreachable"
                    );
                    errors.push(EndpointError::new(endpoint.uri.clone(), reason));
                }
            }
        }
        Err(ConnectError::AllEndpointsFailed(errors))
    }

    async fn connect_to_endpoint(
        &self,
        endpoint: &Endpoint,
    ) -> std::result::Result<Arc<dyn Connection>, DialError> {
        let addr = endpoint.addr()?;
        let key = addr.url();

        let cached = self.connections.lock().get(&key).map(|c| c.conn.clone());
        if let Some(conn) = cached {
            trace!(device_id = %self.device_id, addr = %key, "reusing cached connection");
            return Ok(conn);
        }

        self.check_scheme_enabled(addr.scheme)?;

        let dial_timeout = self.config.dial_timeout;
        let conn = tokio::time::timeout(dial_timeout, self.dial(&addr))
            .await
            .map_err(|_| DialError::Timeout(dial_timeout))??;

        Ok(self.adopt_connection(key, conn).await)
    }

    fn check_scheme_enabled(&self, scheme: Scheme) -> std::result::Result<(), DialError> {
        match scheme {
            Scheme::UdpSecure if self.config.disable_dtls => Err(DialError::DtlsDisabled),
            Scheme::TcpSecure if self.config.disable_tcp_tls => Err(DialError::TcpTlsDisabled),
            _ => Ok(()),
        }
    }

    async fn dial(&self, addr: &Addr) -> std::result::Result<Arc<dyn Connection>, DialError> {
        debug!(device_id = %self.device_id, addr = %addr, "dialing");
        let conn = match addr.scheme {
            Scheme::Udp => self.dialer.dial_udp(addr).await?,
            Scheme::Tcp => self.dialer.dial_tcp(addr).await?,
            Scheme::UdpSecure => {
                let config = self.secure_dial_config()?;
                self.dialer.dial_udp_secure(addr, config).await?
            }
            Scheme::TcpSecure => {
                let config = self.secure_dial_config()?;
                self.dialer.dial_tcp_secure(addr, config).await?
            }
        };
        Ok(conn)
    }

    // Credentials are fetched per dial so rotation applies to the next dial.
    fn secure_dial_config(&self) -> std::result::Result<SecureDialConfig, TlsError> {
        let tls = self.tls.as_ref().ok_or(TlsError::NotConfigured)?;
        Ok(SecureDialConfig {
            identity: tls.certificate()?,
            authorities: tls.certificate_authorities()?,
            verify_peer: self.verify_peer.clone(),
        })
    }

    /// Cache a freshly dialed connection, or discard it if a concurrent dial
    /// to the same address got there first.
    async fn adopt_connection(&self, key: String, conn: Arc<dyn Connection>) -> Arc<dyn Connection> {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

        let existing = {
            let mut map = self.connections.lock();
            match map.entry(key.clone()) {
                Entry::Occupied(entry) => Some(entry.get().conn.clone()),
                Entry::Vacant(entry) => {
                    entry.insert(CachedConnection {
                        id,
                        conn: conn.clone(),
                    });
                    None
                }
            }
        };

        if let Some(existing) = existing {
            debug!(device_id = %self.device_id, addr = %key, "lost dial race, closing duplicate connection");
            if let Err(e) = conn.close().await {
                warn!(device_id = %self.device_id, addr = %key, error = %e, "failed to close duplicate connection");
            }
            return existing;
        }

        // Registered outside the lock: a transport may run the handler inline.
        let connections: Weak<Mutex<HashMap<String, CachedConnection>>> =
            Arc::downgrade(&self.connections);
        let device_id = self.device_id.clone();
        conn.register_close_handler(Box::new(move |reason| {
            let Some(connections) = connections.upgrade() else {
                return;
            };
            let mut map = connections.lock();
            if map.get(&key).is_some_and(|cached| cached.id == id) {
                map.remove(&key);
                match reason {
                    Some(e) => debug!(device_id = %device_id, addr = %key, error = %e, "connection closed, evicted"),
                    None => debug!(device_id = %device_id, addr = %key, "connection closed, evicted"),
                }
            }
        }));

        conn
    }

    /// One-shot GET of a resource.
    pub async fn get_resource(&self, link: &ResourceLink, accept: MediaType) -> Result<Message> {
        let conn = self.connect(&link.sorted_endpoints()).await?;
        let message = conn.get(&link.href, accept).await?;
        if message.code != Code::Content {
            return Err(Error::UnexpectedCode {
                href: link.href.clone(),
                code: message.code,
            });
        }
        Ok(message)
    }

    /// Start a physical observation of `link`.
    pub async fn observe_resource(
        &self,
        link: &ResourceLink,
        accept: MediaType,
    ) -> Result<DeviceObservation> {
        let conn = self.connect(&link.sorted_endpoints()).await?;
        let stream = conn.observe(&link.href, accept).await?;
        let id = Uuid::new_v4().to_string();

        debug!(device_id = %self.device_id, href = %link.href, observation_id = %id, "observation started");
        self.observations.insert(
            id.clone(),
            ActiveObservation {
                href: link.href.clone(),
                token: stream.token,
                conn,
            },
        );

        Ok(DeviceObservation {
            id,
            events: stream.events,
        })
    }

    /// Cancel a physical observation.
    pub async fn stop_observing_resource(&self, observation_id: &str) -> Result<()> {
        let (_, observation) = self
            .observations
            .remove(observation_id)
            .ok_or_else(|| Error::ObservationNotFound(observation_id.to_string()))?;

        debug!(device_id = %self.device_id, href = %observation.href, observation_id, "stopping observation");
        observation
            .conn
            .cancel_observation(&observation.token)
            .await?;
        Ok(())
    }

    /// Id of the SDK owning this client, read from the first identity
    /// certificate in the configured chain.
    pub fn sdk_owner_id(&self) -> Result<String> {
        let tls = self.tls.as_ref().ok_or(TlsError::NotConfigured)?;
        let identity = tls.certificate()?;

        let mut errors = Vec::new();
        for cert in &identity.cert_chain {
            match device_id_from_identity_certificate(cert.as_ref()) {
                Ok(id) => return Ok(id),
                Err(e) => errors.push(e),
            }
        }
        Err(Error::SdkOwnerId(errors))
    }

    /// Stop every observation, then close every cached connection once.
    ///
    /// All connections are closed even if some fail; failures are reported
    /// together. The device may be used again afterwards and will re-dial.
    pub async fn close(&self) -> Result<()> {
        let mut errors = Vec::new();

        let observation_ids: Vec<String> = self
            .observations
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in observation_ids {
            match self.stop_observing_resource(&id).await {
                Ok(()) | Err(Error::ObservationNotFound(_)) => {}
                Err(e) => errors.push(e),
            }
        }

        let connections = std::mem::take(&mut *self.connections.lock());
        for (addr, cached) in connections {
            trace!(device_id = %self.device_id, addr = %addr, "closing connection");
            if let Err(e) = cached.conn.close().await {
                errors.push(Error::Connection(e));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Close {
                device_id: self.device_id.clone(),
                errors,
            })
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("device_id", &self.device_id)
            .field("device_types", &self.device_types)
            .field("connections", &self.connection_count())
            .field("observations", &self.observations.len())
            .finish()
    }
}
