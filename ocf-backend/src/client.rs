//! Cloud client: observations and retrievals routed through the gateway

use std::sync::Arc;

use dashmap::DashMap;
use ocf_core::{Codec, Decoder, ObservationError, ObservationHandler};
use serde::de::DeserializeOwned;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::{ClientError, HandlerError, Result, SubscriptionError};
use crate::gateway::{
    Content, Gateway, ResourceContentChanged, ResourceId, RetrieveResourceFromDeviceRequest,
};
use crate::subscription::{ResourceContentChangedHandler, ResourceSubscription, SubscriptionHandler};

/// Client for devices reachable through a cloud gateway.
///
/// Unlike the local client, every observation here owns its own event
/// stream; the gateway does the fan-out.
pub struct Client {
    gateway: Arc<dyn Gateway>,
    config: ClientConfig,
    observations: DashMap<String, Observation>,
    /// One permit per live observation when `max_subscriptions` is set
    slots: Option<Arc<Semaphore>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

struct Observation {
    subscription: ResourceSubscription,
    _slot: Option<OwnedSemaphorePermit>,
}

impl Client {
    pub fn new(gateway: Arc<dyn Gateway>, config: ClientConfig) -> Result<Self> {
        config.validate().map_err(ClientError::Configuration)?;
        let slots = config
            .max_subscriptions
            .map(|max| Arc::new(Semaphore::new(max)));
        Ok(Self {
            gateway,
            config,
            observations: DashMap::new(),
            slots,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open an event stream and subscribe `handler` to content changes of
    /// `resource_id`.
    ///
    /// Opening the stream and the acknowledgment share one `request_timeout`;
    /// a stream that times out waiting for its acknowledgment is half-closed.
    pub async fn new_resource_subscription(
        &self,
        resource_id: ResourceId,
        handler: Arc<dyn ResourceContentChangedHandler>,
    ) -> Result<ResourceSubscription> {
        let request_timeout = self.config.request_timeout;
        let deadline = Instant::now() + request_timeout;
        let token = Uuid::new_v4().to_string();

        let stream = timeout_at(deadline, self.gateway.subscribe_for_events())
            .await
            .map_err(|_| ClientError::Timeout(request_timeout))?
            .map_err(SubscriptionError::from)?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        match ResourceSubscription::start_with_timeout(stream, token, resource_id, handler, remaining)
            .await
        {
            Ok(subscription) => Ok(subscription),
            Err(SubscriptionError::AckTimeout(_)) => Err(ClientError::Timeout(request_timeout)),
            Err(err) => Err(err.into()),
        }
    }

    /// Observe a resource through the gateway and return the observation id.
    pub async fn observe_resource(
        &self,
        device_id: &str,
        href: &str,
        handler: Arc<dyn ObservationHandler>,
        codec: Arc<dyn Codec>,
    ) -> Result<String> {
        self.observations
            .retain(|_, observation| !observation.subscription.is_finished());

        // The slot is taken before the handshake so concurrent calls cannot
        // overshoot the limit; it is given back when the observation goes.
        let slot = match (&self.slots, self.config.max_subscriptions) {
            (Some(slots), Some(max)) => Some(
                slots
                    .clone()
                    .try_acquire_owned()
                    .map_err(|_| ClientError::TooManySubscriptions(max))?,
            ),
            _ => None,
        };

        let adapter = Arc::new(ObservationAdapter { handler, codec });
        let subscription = self
            .new_resource_subscription(ResourceId::new(device_id, href), adapter)
            .await?;

        let id = Uuid::new_v4().to_string();
        info!(
            device_id,
            href,
            subscription_id = %subscription.id(),
            observation_id = %id,
            "observing through gateway"
        );
        self.observations.insert(
            id.clone(),
            Observation {
                subscription,
                _slot: slot,
            },
        );
        Ok(id)
    }

    /// Cancel an observation and wait until its handler has been notified.
    pub async fn stop_observing_resource(&self, observation_id: &str) -> Result<()> {
        let (_, observation) = self
            .observations
            .remove(observation_id)
            .ok_or_else(|| ClientError::ObservationNotFound(observation_id.to_string()))?;

        let wait = observation.subscription.cancel().await?;
        wait.wait().await;
        debug!(observation_id, "stopped observation");
        Ok(())
    }

    /// Number of observations whose stream is still running.
    pub fn active_observations(&self) -> usize {
        self.observations
            .iter()
            .filter(|entry| !entry.value().subscription.is_finished())
            .count()
    }

    /// Retrieve a resource from the device via the gateway and decode it.
    pub async fn get_resource<T: DeserializeOwned>(
        &self,
        device_id: &str,
        href: &str,
        codec: Arc<dyn Codec>,
    ) -> Result<T> {
        self.get_resource_with_interface(device_id, href, None, codec)
            .await
    }

    pub async fn get_resource_with_interface<T: DeserializeOwned>(
        &self,
        device_id: &str,
        href: &str,
        resource_interface: Option<&str>,
        codec: Arc<dyn Codec>,
    ) -> Result<T> {
        let request = RetrieveResourceFromDeviceRequest {
            resource_id: ResourceId::new(device_id, href),
            resource_interface: resource_interface.map(str::to_string),
        };

        let content: Content = timeout(
            self.config.request_timeout,
            self.gateway.retrieve_resource_from_device(request),
        )
        .await
        .map_err(|_| ClientError::Timeout(self.config.request_timeout))??;

        let decoder = Decoder::new(content.to_message(), codec);
        Ok(decoder.decode()?)
    }

    /// Cancel every observation and wait for their loops to exit.
    pub async fn close(&self) -> Result<()> {
        let ids: Vec<String> = self
            .observations
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut errors = Vec::new();
        for id in ids {
            let Some((_, observation)) = self.observations.remove(&id) else {
                continue;
            };
            match observation.subscription.cancel().await {
                Ok(wait) => wait.wait().await,
                Err(err) => errors.push(err),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ClientError::Close(errors))
        }
    }
}

/// Bridges gateway content changes to a device observation handler.
struct ObservationAdapter {
    handler: Arc<dyn ObservationHandler>,
    codec: Arc<dyn Codec>,
}

impl SubscriptionHandler for ObservationAdapter {
    fn on_close(&self) {
        self.handler.on_close();
    }

    fn error(&self, err: SubscriptionError) {
        let err = match err {
            SubscriptionError::Canceled(reason) => ObservationError::Canceled(reason),
            SubscriptionError::Gateway(err) => ObservationError::Transport(err.to_string()),
            other => ObservationError::Stream(other.to_string()),
        };
        self.handler.error(err);
    }
}

#[async_trait::async_trait]
impl ResourceContentChangedHandler for ObservationAdapter {
    async fn handle_resource_content_changed(
        &self,
        event: ResourceContentChanged,
    ) -> std::result::Result<(), HandlerError> {
        self.handler
            .handle(Decoder::new(event.content.to_message(), self.codec.clone()));
        Ok(())
    }
}
