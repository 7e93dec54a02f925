//! Resource event subscriptions over a gateway event stream.
//!
//! A [`ResourceSubscription`] owns one event stream. Opening it sends a
//! content-changed filter and waits for the gateway acknowledgment; after
//! that a background task delivers events to the handler until the stream
//! ends, the gateway cancels, or the handler fails. Every termination path
//! half-closes the stream before the handler hears about it, and the handler
//! gets exactly one terminal callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tracing::{debug, trace, warn};

use crate::error::{GatewayError, HandlerError, SubscriptionError};
use crate::gateway::{
    EventKind, EventReceiver, EventSender, EventStream, FilterBy, ResourceContentChanged,
    ResourceEventFilter, ResourceEventKind, ResourceId, StatusCode, SubscribeForEvents,
};

/// Terminal callbacks of a subscription.
pub trait SubscriptionHandler: Send + Sync {
    /// The stream ended without error.
    fn on_close(&self);

    fn error(&self, err: SubscriptionError);
}

/// Receives content changes of the subscribed resource.
///
/// Returning an error ends the subscription: the stream is half-closed and
/// [`SubscriptionHandler::error`] is called with the failure. Handlers must
/// not wait on their own subscription's cancellation from inside a callback.
#[async_trait]
pub trait ResourceContentChangedHandler: SubscriptionHandler {
    async fn handle_resource_content_changed(
        &self,
        event: ResourceContentChanged,
    ) -> Result<(), HandlerError>;
}

struct CancelState {
    sender: Mutex<Box<dyn EventSender>>,
    canceled: AtomicBool,
}

impl CancelState {
    /// Half-close the stream the first time only.
    async fn cancel(&self) -> Result<(), GatewayError> {
        if self
            .canceled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        self.sender.lock().await.close_send().await
    }
}

/// Completes once the subscription's receive loop has exited.
#[derive(Debug, Clone)]
pub struct WaitHandle {
    done: watch::Receiver<bool>,
}

impl WaitHandle {
    pub async fn wait(mut self) {
        // A dropped sender means the loop is gone as well.
        let _ = self.done.wait_for(|done| *done).await;
    }
}

pub struct ResourceSubscription {
    subscription_id: String,
    resource_id: ResourceId,
    shared: Arc<CancelState>,
    done: watch::Receiver<bool>,
}

impl std::fmt::Debug for ResourceSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceSubscription")
            .field("subscription_id", &self.subscription_id)
            .field("resource_id", &self.resource_id)
            .field("canceled", &self.shared.canceled.load(Ordering::Acquire))
            .finish()
    }
}

impl ResourceSubscription {
    /// Register a content-changed filter on `stream` and start delivering
    /// events to `handler`.
    ///
    /// Fails without starting the receive loop when the gateway closes the
    /// stream, answers with something other than an acknowledgment, or
    /// rejects the filter. The stream is half-closed on every failure.
    pub async fn start(
        stream: EventStream,
        token: String,
        resource_id: ResourceId,
        handler: Arc<dyn ResourceContentChangedHandler>,
    ) -> Result<Self, SubscriptionError> {
        Self::open(stream, token, resource_id, handler, None).await
    }

    /// Like [`ResourceSubscription::start`], failing with
    /// [`SubscriptionError::AckTimeout`] when the gateway has not
    /// acknowledged the filter within `ack_timeout`.
    pub async fn start_with_timeout(
        stream: EventStream,
        token: String,
        resource_id: ResourceId,
        handler: Arc<dyn ResourceContentChangedHandler>,
        ack_timeout: Duration,
    ) -> Result<Self, SubscriptionError> {
        Self::open(stream, token, resource_id, handler, Some(ack_timeout)).await
    }

    async fn open(
        stream: EventStream,
        token: String,
        resource_id: ResourceId,
        handler: Arc<dyn ResourceContentChangedHandler>,
        ack_timeout: Option<Duration>,
    ) -> Result<Self, SubscriptionError> {
        let EventStream {
            mut sender,
            mut receiver,
        } = stream;

        let request = SubscribeForEvents {
            token: token.clone(),
            filter_by: FilterBy::ResourceEvent(ResourceEventFilter {
                resource_id: resource_id.clone(),
                filter_events: vec![ResourceEventKind::ContentChanged],
            }),
        };

        let registration = register(sender.as_mut(), receiver.as_mut(), request);
        let acked = match ack_timeout {
            Some(limit) => tokio::time::timeout(limit, registration)
                .await
                .unwrap_or(Err(SubscriptionError::AckTimeout(limit))),
            None => registration.await,
        };

        let subscription_id = match acked {
            Ok(subscription_id) => subscription_id,
            Err(err) => {
                debug!(resource_id = %resource_id, token = %token, error = %err, "subscription not established");
                abandon(sender.as_mut()).await;
                return Err(err);
            }
        };

        debug!(
            resource_id = %resource_id,
            subscription_id = %subscription_id,
            token = %token,
            "subscribed"
        );

        let shared = Arc::new(CancelState {
            sender: Mutex::new(sender),
            canceled: AtomicBool::new(false),
        });
        let (done_tx, done) = watch::channel(false);

        tokio::spawn(run_recv(
            receiver,
            shared.clone(),
            handler,
            done_tx,
            subscription_id.clone(),
        ));

        Ok(Self {
            subscription_id,
            resource_id,
            shared,
            done,
        })
    }

    /// Identifier assigned by the gateway.
    pub fn id(&self) -> &str {
        &self.subscription_id
    }

    pub fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    pub fn is_canceled(&self) -> bool {
        self.shared.canceled.load(Ordering::Acquire)
    }

    /// Whether the receive loop has exited.
    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    /// Half-close the stream and return a handle that completes once the
    /// receive loop has exited. Safe to call concurrently and repeatedly;
    /// only the first call touches the stream.
    pub async fn cancel(&self) -> Result<WaitHandle, SubscriptionError> {
        self.shared.cancel().await?;
        Ok(WaitHandle {
            done: self.done.clone(),
        })
    }
}

async fn abandon(sender: &mut dyn EventSender) {
    if let Err(err) = sender.close_send().await {
        trace!(error = %err, "failed to close abandoned event stream");
    }
}

async fn register(
    sender: &mut dyn EventSender,
    receiver: &mut dyn EventReceiver,
    request: SubscribeForEvents,
) -> Result<String, SubscriptionError> {
    sender.send(request).await?;
    await_ack(receiver).await
}

async fn await_ack(receiver: &mut dyn EventReceiver) -> Result<String, SubscriptionError> {
    let event = receiver
        .recv()
        .await?
        .ok_or(SubscriptionError::ClosedBeforeAck)?;

    match event.kind {
        EventKind::OperationProcessed { error_status } if error_status.code == StatusCode::Ok => {
            Ok(event.subscription_id)
        }
        EventKind::OperationProcessed { error_status } => Err(SubscriptionError::Rejected {
            code: error_status.code,
            message: error_status.message,
        }),
        other => Err(SubscriptionError::UnexpectedAck(format!("{other:?}"))),
    }
}

async fn run_recv(
    mut receiver: Box<dyn EventReceiver>,
    shared: Arc<CancelState>,
    handler: Arc<dyn ResourceContentChangedHandler>,
    done: watch::Sender<bool>,
    subscription_id: String,
) {
    let failure = loop {
        let event = match receiver.recv().await {
            Ok(Some(event)) => event,
            Ok(None) => break None,
            Err(err) => break Some(SubscriptionError::Gateway(err)),
        };

        match event.kind {
            EventKind::ResourceContentChanged(changed) => {
                trace!(
                    resource_id = %changed.resource_id,
                    subscription_id = %subscription_id,
                    "content changed"
                );
                if let Err(err) = handler.handle_resource_content_changed(changed).await {
                    break Some(SubscriptionError::Handler(err));
                }
            }
            EventKind::SubscriptionCanceled { reason } if reason.is_empty() => break None,
            EventKind::SubscriptionCanceled { reason } => {
                break Some(SubscriptionError::Canceled(reason))
            }
            other => break Some(SubscriptionError::UnknownEvent(format!("{other:?}"))),
        }
    };

    if let Err(err) = shared.cancel().await {
        trace!(subscription_id = %subscription_id, error = %err, "failed to half-close subscription");
    }

    match failure {
        None => {
            debug!(subscription_id = %subscription_id, "subscription closed");
            handler.on_close();
        }
        Some(err) => {
            warn!(subscription_id = %subscription_id, error = %err, "subscription failed");
            handler.error(err);
        }
    }

    let _ = done.send(true);
}
