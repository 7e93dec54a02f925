//! Cloud gateway messages and the streaming RPC seam.
//!
//! The gateway republishes device resource events over a bidirectional
//! stream: the client sends a filter, the gateway acknowledges it and then
//! pushes matching events until either side ends the stream.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use ocf_core::{MediaType, Message};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// A resource addressed through the cloud.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceId {
    pub device_id: String,
    #[serde(rename = "href")]
    pub href: String,
}

impl ResourceId {
    pub fn new(device_id: impl Into<String>, href: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            href: href.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.device_id, self.href)
    }
}

/// Resource event kinds a subscription can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceEventKind {
    ContentChanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceEventFilter {
    pub resource_id: ResourceId,
    pub filter_events: Vec<ResourceEventKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterBy {
    ResourceEvent(ResourceEventFilter),
}

/// Client request opening a subscription on an event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeForEvents {
    /// Correlates the acknowledgment with this request
    pub token: String,
    pub filter_by: FilterBy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Ok,
    Error,
    NotFound,
    PermissionDenied,
    Unauthenticated,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Ok => "OK",
            StatusCode::Error => "ERROR",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::PermissionDenied => "PERMISSION_DENIED",
            StatusCode::Unauthenticated => "UNAUTHENTICATED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorStatus {
    pub code: StatusCode,
    #[serde(default)]
    pub message: String,
}

impl ErrorStatus {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            message: String::new(),
        }
    }
}

/// Resource representation as carried by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    pub content_type: String,
    pub data: Bytes,
}

impl Content {
    pub fn new(content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    /// View the content as a CoAP message so device codecs can decode it.
    pub fn to_message(&self) -> Message {
        Message {
            code: ocf_core::Code::Content,
            content_format: MediaType::from_content_type(&self.content_type),
            sequence: None,
            body: self.data.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContentChanged {
    pub resource_id: ResourceId,
    pub content: Content,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    /// Acknowledgment of a [`SubscribeForEvents`] request
    OperationProcessed { error_status: ErrorStatus },
    ResourceContentChanged(ResourceContentChanged),
    /// The gateway ended the subscription, optionally saying why
    SubscriptionCanceled {
        #[serde(default)]
        reason: String,
    },
    DevicesRegistered { device_ids: Vec<String> },
}

/// One message received on an event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default)]
    pub subscription_id: String,
    #[serde(default)]
    pub token: String,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveResourceFromDeviceRequest {
    pub resource_id: ResourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_interface: Option<String>,
}

/// Request half of an event stream.
#[async_trait]
pub trait EventSender: Send {
    async fn send(&mut self, request: SubscribeForEvents) -> Result<(), GatewayError>;

    /// Half-close: no further requests will be sent.
    async fn close_send(&mut self) -> Result<(), GatewayError>;
}

/// Event half of an event stream.
#[async_trait]
pub trait EventReceiver: Send {
    /// Next event, or `None` once the gateway ended the stream cleanly.
    async fn recv(&mut self) -> Result<Option<Event>, GatewayError>;
}

pub struct EventStream {
    pub sender: Box<dyn EventSender>,
    pub receiver: Box<dyn EventReceiver>,
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}

/// The gateway RPC surface used by the client.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn subscribe_for_events(&self) -> Result<EventStream, GatewayError>;

    async fn retrieve_resource_from_device(
        &self,
        request: RetrieveResourceFromDeviceRequest,
    ) -> Result<Content, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_content_to_message() {
        let content = Content::new("application/json", &br#"{"n":"lamp"}"#[..]);
        let message = content.to_message();
        assert_eq!(message.content_format, Some(MediaType::AppJson));
        assert_eq!(&message.body[..], br#"{"n":"lamp"}"#);

        let unknown = Content::new("application/x-custom", Bytes::new()).to_message();
        assert_eq!(unknown.content_format, None);
    }

    #[test]
    fn test_subscribe_request_wire_shape() {
        let request = SubscribeForEvents {
            token: "t1".to_string(),
            filter_by: FilterBy::ResourceEvent(ResourceEventFilter {
                resource_id: ResourceId::new("dev-1", "/light/1"),
                filter_events: vec![ResourceEventKind::ContentChanged],
            }),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["filterBy"]["resourceEvent"]["resourceId"]["deviceId"], "dev-1");
        assert_eq!(value["filterBy"]["resourceEvent"]["filterEvents"][0], "CONTENT_CHANGED");
    }

    #[test]
    fn test_cancel_event_reason_defaults_to_empty() {
        let event: Event =
            serde_json::from_str(r#"{"kind":{"subscriptionCanceled":{}}}"#).unwrap();
        assert_eq!(
            event.kind,
            EventKind::SubscriptionCanceled {
                reason: String::new()
            }
        );
    }

    #[rstest]
    #[case(StatusCode::Ok, "OK")]
    #[case(StatusCode::NotFound, "NOT_FOUND")]
    #[case(StatusCode::PermissionDenied, "PERMISSION_DENIED")]
    fn test_status_code_matches_wire_name(#[case] code: StatusCode, #[case] name: &str) {
        assert_eq!(code.to_string(), name);
        assert_eq!(serde_json::to_value(code).unwrap(), name);
    }

    #[test]
    fn test_resource_id_display() {
        assert_eq!(ResourceId::new("dev-1", "/oic/d").to_string(), "dev-1/oic/d");
    }
}
