//! In-memory transport for tests.
//!
//! [`MockDialer`] hands out [`MockConnection`]s that record every call and let
//! a test push notifications, cancellations and remote closes the way a real
//! device would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustls::pki_types::CertificateDer;
use tokio::sync::{mpsc, Barrier};

use crate::error::ConnectionError;
use crate::message::{Code, MediaType, Message};
use crate::schema::{Addr, Endpoint, ResourceLink};
use crate::transport::{
    CloseHandler, Connection, Dialer, ObservationEvent, ObservationStream, SecureDialConfig,
};

const OBSERVATION_BUFFER: usize = 16;

/// Build a link for `href` on `device_id` reachable at `endpoints`.
pub fn resource_link(device_id: &str, href: &str, endpoints: &[&str]) -> ResourceLink {
    ResourceLink {
        href: href.to_string(),
        device_id: device_id.to_string(),
        resource_types: Vec::new(),
        interfaces: Vec::new(),
        endpoints: endpoints.iter().map(|e| Endpoint::new(*e)).collect(),
    }
}

/// A JSON `2.05 Content` message.
pub fn json_message(body: &str) -> Message {
    Message::content(MediaType::AppJson, body.to_string().into_bytes())
}

struct Observer {
    href: String,
    sender: mpsc::Sender<ObservationEvent>,
}

pub struct MockConnection {
    addr: Addr,
    responses: Mutex<HashMap<String, Message>>,
    observers: Mutex<HashMap<String, Observer>>,
    close_handler: Mutex<Option<CloseHandler>>,
    next_token: AtomicU64,
    get_calls: AtomicUsize,
    observe_calls: AtomicUsize,
    cancel_calls: AtomicUsize,
    close_calls: AtomicUsize,
    closed: AtomicBool,
}

impl MockConnection {
    pub fn new(addr: Addr) -> Arc<Self> {
        Arc::new(Self {
            addr,
            responses: Mutex::new(HashMap::new()),
            observers: Mutex::new(HashMap::new()),
            close_handler: Mutex::new(None),
            next_token: AtomicU64::new(1),
            get_calls: AtomicUsize::new(0),
            observe_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn set_response(&self, href: &str, message: Message) {
        self.responses.lock().insert(href.to_string(), message);
    }

    fn senders_for(&self, href: &str) -> Vec<mpsc::Sender<ObservationEvent>> {
        self.observers
            .lock()
            .values()
            .filter(|o| o.href == href)
            .map(|o| o.sender.clone())
            .collect()
    }

    fn take_observers(&self, href: &str) -> Vec<mpsc::Sender<ObservationEvent>> {
        let mut observers = self.observers.lock();
        let tokens: Vec<String> = observers
            .iter()
            .filter(|(_, o)| o.href == href)
            .map(|(token, _)| token.clone())
            .collect();
        tokens
            .into_iter()
            .filter_map(|token| observers.remove(&token))
            .map(|o| o.sender)
            .collect()
    }

    /// Push a notification to every observation of `href`. Returns how many
    /// observations received it.
    pub async fn notify(&self, href: &str, message: Message) -> usize {
        let mut delivered = 0;
        for sender in self.senders_for(href) {
            if sender
                .send(ObservationEvent::Notification(message.clone()))
                .await
                .is_ok()
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// The device ends every observation of `href`.
    pub async fn cancel_from_device(&self, href: &str, reason: Option<&str>) {
        for sender in self.take_observers(href) {
            let _ = sender
                .send(ObservationEvent::Canceled {
                    reason: reason.map(str::to_string),
                })
                .await;
        }
    }

    /// Fail every observation of `href` with a transport error.
    pub async fn fail_observation(&self, href: &str, reason: &str) {
        for sender in self.take_observers(href) {
            let _ = sender
                .send(ObservationEvent::Error(ConnectionError::Request {
                    href: href.to_string(),
                    reason: reason.to_string(),
                }))
                .await;
        }
    }

    /// Drop every observation of `href` without a final event.
    pub fn end_observation(&self, href: &str) {
        drop(self.take_observers(href));
    }

    /// Simulate the transport going away underneath the SDK.
    pub fn remote_close(&self, error: ConnectionError) {
        let handler = {
            let mut slot = self.close_handler.lock();
            self.closed.store(true, Ordering::SeqCst);
            slot.take()
        };
        self.observers.lock().clear();
        if let Some(handler) = handler {
            handler(Some(error));
        }
    }

    pub fn get_count(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn observe_count(&self) -> usize {
        self.observe_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_count(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn active_observations(&self) -> usize {
        self.observers.lock().len()
    }

    pub fn has_close_handler(&self) -> bool {
        self.close_handler.lock().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn remote_addr(&self) -> &Addr {
        &self.addr
    }

    async fn get(&self, href: &str, _accept: MediaType) -> Result<Message, ConnectionError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        Ok(self
            .responses
            .lock()
            .get(href)
            .cloned()
            .unwrap_or(Message {
                code: Code::NotFound,
                content_format: None,
                sequence: None,
                body: bytes::Bytes::new(),
            }))
    }

    async fn observe(
        &self,
        href: &str,
        _accept: MediaType,
    ) -> Result<ObservationStream, ConnectionError> {
        self.observe_calls.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let token = format!("{:016x}", self.next_token.fetch_add(1, Ordering::SeqCst));
        let (sender, events) = mpsc::channel(OBSERVATION_BUFFER);
        self.observers.lock().insert(
            token.clone(),
            Observer {
                href: href.to_string(),
                sender,
            },
        );
        Ok(ObservationStream { token, events })
    }

    async fn cancel_observation(&self, token: &str) -> Result<(), ConnectionError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        match self.observers.lock().remove(token) {
            Some(_) => Ok(()),
            None => Err(ConnectionError::ObservationNotFound(token.to_string())),
        }
    }

    fn register_close_handler(&self, handler: CloseHandler) {
        let mut slot = self.close_handler.lock();
        if !self.is_closed() {
            *slot = Some(handler);
            return;
        }
        drop(slot);
        handler(Some(ConnectionError::Closed));
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        let handler = {
            let mut slot = self.close_handler.lock();
            self.closed.store(true, Ordering::SeqCst);
            slot.take()
        };
        self.observers.lock().clear();
        if let Some(handler) = handler {
            handler(None);
        }
        Ok(())
    }
}

/// Dialer producing a fresh [`MockConnection`] per successful dial.
#[derive(Default)]
pub struct MockDialer {
    failures: Mutex<HashMap<String, String>>,
    responses: Mutex<HashMap<String, Message>>,
    dials: Mutex<Vec<Addr>>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
    barrier: Mutex<Option<Arc<Barrier>>>,
    delay: Mutex<Option<Duration>>,
    peer_certificate: Mutex<Option<CertificateDer<'static>>>,
    secure_dials: AtomicUsize,
    close_on_dial: AtomicBool,
}

impl MockDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make dials to `url` (as produced by [`Addr::url`]) fail.
    pub fn fail(&self, url: &str, reason: &str) {
        self.failures
            .lock()
            .insert(url.to_string(), reason.to_string());
    }

    /// Preset a GET response on every connection dialed from now on.
    pub fn respond(&self, href: &str, message: Message) {
        self.responses.lock().insert(href.to_string(), message);
    }

    /// Hold every dial until `parties` dials are in flight.
    pub fn synchronize_dials(&self, parties: usize) {
        *self.barrier.lock() = Some(Arc::new(Barrier::new(parties)));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Certificate presented by devices during secure dials.
    pub fn set_peer_certificate(&self, cert: CertificateDer<'static>) {
        *self.peer_certificate.lock() = Some(cert);
    }

    /// Hand out connections that the device already closed.
    pub fn close_on_dial(&self) {
        self.close_on_dial.store(true, Ordering::SeqCst);
    }

    pub fn dial_count(&self) -> usize {
        self.dials.lock().len()
    }

    pub fn secure_dial_count(&self) -> usize {
        self.secure_dials.load(Ordering::SeqCst)
    }

    pub fn dialed(&self) -> Vec<Addr> {
        self.dials.lock().clone()
    }

    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().clone()
    }

    /// Total observe requests across every dialed connection.
    pub fn observe_count(&self) -> usize {
        self.connections().iter().map(|c| c.observe_count()).sum()
    }

    /// Total observation cancels across every dialed connection.
    pub fn cancel_count(&self) -> usize {
        self.connections().iter().map(|c| c.cancel_count()).sum()
    }

    /// Push a notification through every connection. Returns how many
    /// observations received it.
    pub async fn notify(&self, href: &str, message: Message) -> usize {
        let mut delivered = 0;
        for conn in self.connections() {
            delivered += conn.notify(href, message.clone()).await;
        }
        delivered
    }

    async fn dial(&self, addr: &Addr) -> Result<Arc<dyn Connection>, ConnectionError> {
        self.dials.lock().push(addr.clone());

        let barrier = self.barrier.lock().clone();
        if let Some(barrier) = barrier {
            barrier.wait().await;
        }
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(reason) = self.failures.lock().get(&addr.url()) {
            return Err(ConnectionError::Refused(reason.clone()));
        }

        let conn = MockConnection::new(addr.clone());
        for (href, message) in self.responses.lock().iter() {
            conn.set_response(href, message.clone());
        }
        self.connections.lock().push(conn.clone());
        if self.close_on_dial.load(Ordering::SeqCst) {
            conn.remote_close(ConnectionError::Closed);
        }
        Ok(conn)
    }

    async fn dial_secure(
        &self,
        addr: &Addr,
        config: SecureDialConfig,
    ) -> Result<Arc<dyn Connection>, ConnectionError> {
        self.secure_dials.fetch_add(1, Ordering::SeqCst);
        let peer = self.peer_certificate.lock().clone();
        if let Some(cert) = peer {
            (config.verify_peer)(&cert).map_err(|e| ConnectionError::Handshake(e.to_string()))?;
        }
        self.dial(addr).await
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial_udp(&self, addr: &Addr) -> Result<Arc<dyn Connection>, ConnectionError> {
        self.dial(addr).await
    }

    async fn dial_udp_secure(
        &self,
        addr: &Addr,
        config: SecureDialConfig,
    ) -> Result<Arc<dyn Connection>, ConnectionError> {
        self.dial_secure(addr, config).await
    }

    async fn dial_tcp(&self, addr: &Addr) -> Result<Arc<dyn Connection>, ConnectionError> {
        self.dial(addr).await
    }

    async fn dial_tcp_secure(
        &self,
        addr: &Addr,
        config: SecureDialConfig,
    ) -> Result<Arc<dyn Connection>, ConnectionError> {
        self.dial_secure(addr, config).await
    }
}
