//! In-memory gateway used by the backend integration tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ocf_backend::{
    Content, ErrorStatus, Event, EventKind, EventReceiver, EventSender, EventStream, Gateway,
    GatewayError, HandlerError, ResourceContentChanged, ResourceContentChangedHandler, ResourceId,
    RetrieveResourceFromDeviceRequest, StatusCode, SubscribeForEvents, SubscriptionError,
    SubscriptionHandler,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

pub const DEVICE_ID: &str = "0b3a4f6e-77d1-4c8a-9e2f-5d7c1a9b3e40";

struct MockSender {
    requests: Option<mpsc::UnboundedSender<SubscribeForEvents>>,
    close_calls: Arc<AtomicUsize>,
}

#[async_trait]
impl EventSender for MockSender {
    async fn send(&mut self, request: SubscribeForEvents) -> Result<(), GatewayError> {
        let requests = self
            .requests
            .as_ref()
            .ok_or_else(|| GatewayError::Stream("send after close".to_string()))?;
        requests
            .send(request)
            .map_err(|_| GatewayError::Stream("gateway went away".to_string()))
    }

    async fn close_send(&mut self) -> Result<(), GatewayError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.requests = None;
        Ok(())
    }
}

struct MockReceiver {
    events: mpsc::UnboundedReceiver<Result<Event, GatewayError>>,
}

#[async_trait]
impl EventReceiver for MockReceiver {
    async fn recv(&mut self) -> Result<Option<Event>, GatewayError> {
        match self.events.recv().await {
            Some(Ok(event)) => Ok(Some(event)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }
}

/// Gateway side of one event stream.
pub struct ServerEnd {
    pub requests: mpsc::UnboundedReceiver<SubscribeForEvents>,
    pub events: mpsc::UnboundedSender<Result<Event, GatewayError>>,
    pub close_calls: Arc<AtomicUsize>,
}

pub fn duplex_pair() -> (EventStream, ServerEnd) {
    let (requests_tx, requests) = mpsc::unbounded_channel();
    let (events, events_rx) = mpsc::unbounded_channel();
    let close_calls = Arc::new(AtomicUsize::new(0));

    let stream = EventStream {
        sender: Box::new(MockSender {
            requests: Some(requests_tx),
            close_calls: close_calls.clone(),
        }),
        receiver: Box::new(MockReceiver { events: events_rx }),
    };
    let server = ServerEnd {
        requests,
        events,
        close_calls,
    };
    (stream, server)
}

impl ServerEnd {
    fn push(&self, subscription_id: &str, kind: EventKind) {
        let _ = self.events.send(Ok(Event {
            subscription_id: subscription_id.to_string(),
            token: String::new(),
            kind,
        }));
    }

    pub fn ack(&self, subscription_id: &str) {
        self.push(
            subscription_id,
            EventKind::OperationProcessed {
                error_status: ErrorStatus::ok(),
            },
        );
    }

    pub fn reject(&self, code: StatusCode, message: &str) {
        self.push(
            "",
            EventKind::OperationProcessed {
                error_status: ErrorStatus {
                    code,
                    message: message.to_string(),
                },
            },
        );
    }

    pub fn content_changed(&self, href: &str, json: &str) {
        self.push(
            "sub-1",
            EventKind::ResourceContentChanged(ResourceContentChanged {
                resource_id: ResourceId::new(DEVICE_ID, href),
                content: Content::new("application/json", json.as_bytes().to_vec()),
            }),
        );
    }

    pub fn cancel(&self, reason: &str) {
        self.push(
            "sub-1",
            EventKind::SubscriptionCanceled {
                reason: reason.to_string(),
            },
        );
    }

    pub fn push_event(&self, kind: EventKind) {
        self.push("sub-1", kind);
    }

    pub fn fail(&self, err: GatewayError) {
        let _ = self.events.send(Err(err));
    }

    pub fn close_count(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Behave like a gateway: end the event stream once the client
    /// half-closes. Returns the filters received before that.
    pub fn finish_after_half_close(self) -> tokio::task::JoinHandle<Vec<SubscribeForEvents>> {
        let ServerEnd {
            mut requests,
            events,
            ..
        } = self;
        tokio::spawn(async move {
            let mut received = Vec::new();
            while let Some(request) = requests.recv().await {
                received.push(request);
            }
            drop(events);
            received
        })
    }
}

/// Gateway handing out pre-built event streams and canned contents.
#[derive(Default)]
pub struct MockGateway {
    streams: Mutex<VecDeque<EventStream>>,
    contents: Mutex<HashMap<ResourceId, Content>>,
    retrievals: Mutex<Vec<RetrieveResourceFromDeviceRequest>>,
    opened: AtomicUsize,
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a stream for the next subscription and return its gateway side.
    pub fn next_stream(&self) -> ServerEnd {
        let (stream, server) = duplex_pair();
        self.streams.lock().push_back(stream);
        server
    }

    pub fn set_content(&self, href: &str, json: &str) {
        self.contents.lock().insert(
            ResourceId::new(DEVICE_ID, href),
            Content::new("application/json", json.as_bytes().to_vec()),
        );
    }

    pub fn retrievals(&self) -> Vec<RetrieveResourceFromDeviceRequest> {
        self.retrievals.lock().clone()
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Gateway for MockGateway {
    async fn subscribe_for_events(&self) -> Result<EventStream, GatewayError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.streams
            .lock()
            .pop_front()
            .ok_or_else(|| GatewayError::Stream("no stream available".to_string()))
    }

    async fn retrieve_resource_from_device(
        &self,
        request: RetrieveResourceFromDeviceRequest,
    ) -> Result<Content, GatewayError> {
        let content = self.contents.lock().get(&request.resource_id).cloned();
        self.retrievals.lock().push(request.clone());
        content.ok_or_else(|| GatewayError::Status {
            code: StatusCode::NotFound,
            message: format!("resource {} not found", request.resource_id),
        })
    }
}

#[derive(Debug)]
pub enum Callback {
    Changed(serde_json::Value),
    Closed,
    Error(String),
}

/// Subscription handler forwarding callbacks to a channel, optionally
/// failing on the nth content change.
pub struct RecordingHandler {
    events: mpsc::UnboundedSender<Callback>,
    fail_on: Option<usize>,
    seen: AtomicUsize,
}

impl RecordingHandler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Callback>) {
        Self::build(None)
    }

    pub fn failing_on(nth: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<Callback>) {
        Self::build(Some(nth))
    }

    fn build(fail_on: Option<usize>) -> (Arc<Self>, mpsc::UnboundedReceiver<Callback>) {
        let (events, rx) = mpsc::unbounded_channel();
        let handler = Self {
            events,
            fail_on,
            seen: AtomicUsize::new(0),
        };
        (Arc::new(handler), rx)
    }
}

impl SubscriptionHandler for RecordingHandler {
    fn on_close(&self) {
        let _ = self.events.send(Callback::Closed);
    }

    fn error(&self, err: SubscriptionError) {
        let _ = self.events.send(Callback::Error(err.to_string()));
    }
}

#[async_trait]
impl ResourceContentChangedHandler for RecordingHandler {
    async fn handle_resource_content_changed(
        &self,
        event: ResourceContentChanged,
    ) -> Result<(), HandlerError> {
        let n = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on == Some(n) {
            return Err("handler rejected content".into());
        }
        let value = serde_json::from_slice(&event.content.data)?;
        let _ = self.events.send(Callback::Changed(value));
        Ok(())
    }
}

pub async fn next_callback(rx: &mut mpsc::UnboundedReceiver<Callback>) -> Callback {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for callback")
        .expect("callback channel closed")
}

pub async fn assert_no_callback(rx: &mut mpsc::UnboundedReceiver<Callback>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    if let Ok(callback) = rx.try_recv() {
        panic!("unexpected callback: {callback:?}");
    }
}
