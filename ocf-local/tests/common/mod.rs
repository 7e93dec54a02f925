//! Shared fixtures for local client integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ocf_core::test_support::{resource_link, MockDialer};
use ocf_core::{Decoder, ObservationError, ObservationHandler};
use ocf_local::{Client, ClientConfig, DeviceDiscovery, DiscoveredDevice, DiscoveryError};
use tokio::sync::mpsc;

pub const DEVICE_ID: &str = "6f1f8ae0-3a3c-4c7e-8d6b-2b9f0f6a1e11";
pub const ENDPOINT: &str = "coap://10.0.0.7:5683";

/// Discovery backed by a fixed device table
#[derive(Default)]
pub struct StaticDiscovery {
    devices: HashMap<String, DiscoveredDevice>,
}

impl StaticDiscovery {
    pub fn with_device(mut self, device_id: &str, hrefs: &[&str], endpoints: &[&str]) -> Self {
        self.devices.insert(
            device_id.to_string(),
            DiscoveredDevice {
                device_id: device_id.to_string(),
                device_types: vec!["oic.d.sensor".to_string()],
                links: hrefs
                    .iter()
                    .map(|href| resource_link(device_id, href, endpoints))
                    .collect(),
            },
        );
        self
    }
}

#[async_trait]
impl DeviceDiscovery for StaticDiscovery {
    async fn find_device(&self, device_id: &str) -> Result<DiscoveredDevice, DiscoveryError> {
        self.devices
            .get(device_id)
            .cloned()
            .ok_or_else(|| DiscoveryError::NotFound(device_id.to_string()))
    }
}

/// A client over a mock transport with one sensor device.
pub fn client() -> (Arc<Client>, Arc<MockDialer>) {
    let dialer = MockDialer::new();
    let discovery = StaticDiscovery::default().with_device(
        DEVICE_ID,
        &["/sensor", "/light", "/oic/d"],
        &[ENDPOINT],
    );
    let client = Client::new(
        ClientConfig::insecure(),
        dialer.clone(),
        None,
        Arc::new(discovery),
    )
    .unwrap();
    (Arc::new(client), dialer)
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandlerEvent {
    Notification(serde_json::Value),
    Closed,
    Error(ObservationError),
}

/// Handler forwarding every callback to a channel
pub struct RecordingHandler {
    events: mpsc::UnboundedSender<HandlerEvent>,
}

impl RecordingHandler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<HandlerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { events }), rx)
    }
}

impl ObservationHandler for RecordingHandler {
    fn handle(&self, decoder: Decoder) {
        let value = decoder
            .decode::<serde_json::Value>()
            .unwrap_or(serde_json::Value::Null);
        let _ = self.events.send(HandlerEvent::Notification(value));
    }

    fn on_close(&self) {
        let _ = self.events.send(HandlerEvent::Closed);
    }

    fn error(&self, err: ObservationError) {
        let _ = self.events.send(HandlerEvent::Error(err));
    }
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<HandlerEvent>) -> HandlerEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for handler event")
        .expect("handler channel closed")
}

pub async fn assert_no_event(rx: &mut mpsc::UnboundedReceiver<HandlerEvent>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    if let Ok(event) = rx.try_recv() {
        panic!("unexpected handler event: {event:?}");
    }
}
