//! # ocf-backend
//!
//! Client for OCF devices reached through a cloud gateway.
//!
//! Each observation opens its own bidirectional event stream on the
//! [`Gateway`], registers a content-changed filter and runs a receive loop
//! until the stream ends, the gateway cancels the subscription, or the
//! handler fails. [`ResourceSubscription::cancel`] half-closes the stream and
//! hands back a [`WaitHandle`] that completes once the loop has exited.

pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod subscription;

pub use client::Client;
pub use config::ClientConfig;
pub use error::{ClientError, GatewayError, HandlerError, Result, SubscriptionError};
pub use gateway::{
    Content, ErrorStatus, Event, EventKind, EventReceiver, EventSender, EventStream, FilterBy,
    Gateway, ResourceContentChanged, ResourceEventFilter, ResourceEventKind, ResourceId,
    RetrieveResourceFromDeviceRequest, StatusCode, SubscribeForEvents,
};
pub use subscription::{
    ResourceContentChangedHandler, ResourceSubscription, SubscriptionHandler, WaitHandle,
};
