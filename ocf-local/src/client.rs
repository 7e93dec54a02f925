//! Local-network client.

use std::sync::Arc;

use dashmap::DashMap;
use ocf_core::{get_resource_link, Codec, Decoder, Dialer, ObservationHandler, TlsConfig};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::device_cache::{DeviceCache, DeviceDiscovery, DeviceLease};
use crate::error::{ClientError, Result};
use crate::observe::{self, ObservationRegistry};

/// Talks to OCF devices on the local network.
///
/// Devices are discovered lazily on first use and shared between requests.
/// Observations of the same resource share one physical observation no matter
/// how many handlers are registered.
///
/// # Example
///
/// ```rust,ignore
/// use ocf_local::{Client, ClientConfig};
/// use ocf_core::JsonCodec;
///
/// let client = Client::new(ClientConfig::default(), dialer, Some(tls), discovery)?;
/// let id = client
///     .observe_resource(&device_id, "/light/1", Arc::new(LightHandler), Arc::new(JsonCodec))
///     .await?;
/// // ...
/// client.stop_observing_resource(&id).await?;
/// ```
pub struct Client {
    config: ClientConfig,
    device_cache: Arc<DeviceCache>,
    observations: ObservationRegistry,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        dialer: Arc<dyn Dialer>,
        tls: Option<TlsConfig>,
        discovery: Arc<dyn DeviceDiscovery>,
    ) -> Result<Self> {
        config.validate().map_err(ClientError::Configuration)?;

        let device_cache = Arc::new(DeviceCache::new(
            discovery,
            dialer,
            tls,
            config.device.clone(),
        ));
        Ok(Self {
            config,
            device_cache,
            observations: Arc::new(DashMap::new()),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn device_cache(&self) -> &DeviceCache {
        &self.device_cache
    }

    /// Lease a device. Release the lease when done with it.
    pub async fn get_device(&self, device_id: &str) -> Result<DeviceLease> {
        self.device_cache.get_ref_device(device_id).await
    }

    /// Fetch and decode a resource once.
    pub async fn get_resource<T: DeserializeOwned>(
        &self,
        device_id: &str,
        href: &str,
        codec: Arc<dyn Codec>,
    ) -> Result<T> {
        let request_timeout = self.config.request_timeout;
        let accept = codec.content_format();

        let message = tokio::time::timeout(request_timeout, async {
            let lease = self.device_cache.get_ref_device(device_id).await?;
            let result = match get_resource_link(lease.links(), href) {
                Ok(link) => lease
                    .device()
                    .get_resource(&link, accept)
                    .await
                    .map_err(ClientError::from),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = lease.release().await {
                warn!(device_id, error = %e, "failed to release device");
            }
            result
        })
        .await
        .map_err(|_| ClientError::Timeout(request_timeout))??;

        Ok(Decoder::new(message, codec).decode()?)
    }

    /// Observe a resource. `handler` receives every notification decoded with
    /// `codec`; subscribers joining a running observation first get the latest
    /// notification replayed.
    ///
    /// Returns the id to pass to [`Client::stop_observing_resource`].
    pub async fn observe_resource(
        &self,
        device_id: &str,
        href: &str,
        handler: Arc<dyn ObservationHandler>,
        codec: Arc<dyn Codec>,
    ) -> Result<String> {
        observe::observe_resource(
            &self.observations,
            &self.device_cache,
            self.config.request_timeout,
            device_id,
            href,
            handler,
            codec,
        )
        .await
    }

    /// Stop an observation. The handler receives no callbacks once this
    /// returns. Unknown ids are ignored.
    pub async fn stop_observing_resource(&self, observation_id: &str) -> Result<()> {
        observe::stop_observing_resource(&self.observations, &self.device_cache, observation_id)
            .await
    }

    /// Number of resources with a running physical observation.
    pub fn active_observations(&self) -> usize {
        self.observations.len()
    }

    /// Number of handlers sharing the observation of a resource.
    pub fn subscriber_count(&self, device_id: &str, href: &str) -> usize {
        self.observations
            .get(&observe::registry_key(device_id, href))
            .map(|r| r.subscriber_count())
            .unwrap_or(0)
    }

    /// Close every observation, then release every cached device.
    pub async fn close(&self) -> Result<()> {
        debug!(observations = self.observations.len(), "closing client");
        observe::close_all(&self.observations, &self.device_cache).await;
        self.device_cache.close().await
    }
}
