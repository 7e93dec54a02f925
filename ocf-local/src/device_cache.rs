//! Reference-counted device cache.
//!
//! Every user of a device holds a [`DeviceLease`]. The cache itself holds one
//! lease per cached device, and a device with active observations is pinned in
//! the permanent cache so eviction cannot close it underneath its observers.
//! When the last lease is released the device's connections are closed.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ocf_core::{Device, DeviceConfig, Dialer, ResourceLink, TlsConfig};
use tracing::{debug, trace, warn};

use crate::error::{ClientError, DiscoveryError, Result};

/// What enumeration found for one device.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub device_id: String,
    pub device_types: Vec<String>,
    pub links: Vec<ResourceLink>,
}

/// Device enumeration, implemented outside the SDK core.
#[async_trait]
pub trait DeviceDiscovery: Send + Sync {
    async fn find_device(
        &self,
        device_id: &str,
    ) -> std::result::Result<DiscoveredDevice, DiscoveryError>;
}

/// A device together with its links and an explicit ownership count.
pub struct RefDevice {
    device: Device,
    links: Vec<ResourceLink>,
    refs: AtomicUsize,
}

impl RefDevice {
    fn new(device: Device, links: Vec<ResourceLink>) -> Arc<Self> {
        Arc::new(Self {
            device,
            links,
            refs: AtomicUsize::new(0),
        })
    }

    fn lease(self: &Arc<Self>) -> DeviceLease {
        let refs = self.refs.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(device_id = %self.device.device_id(), refs, "device acquired");
        DeviceLease {
            device: self.clone(),
            released: AtomicBool::new(false),
        }
    }

    /// Drop one reference, returning true when it was the last.
    fn unref(&self) -> bool {
        let previous = self.refs.fetch_sub(1, Ordering::AcqRel);
        trace!(device_id = %self.device.device_id(), refs = previous.saturating_sub(1), "device released");
        previous == 1
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }
}

/// One counted reference to a cached device.
///
/// Release it with [`DeviceLease::release`]. A lease dropped without release
/// still gives up its reference, closing the device in the background if it
/// was the last one.
pub struct DeviceLease {
    device: Arc<RefDevice>,
    released: AtomicBool,
}

impl DeviceLease {
    pub fn device(&self) -> &Device {
        &self.device.device
    }

    pub fn device_id(&self) -> &str {
        self.device.device.device_id()
    }

    pub fn links(&self) -> &[ResourceLink] {
        &self.device.links
    }

    pub fn ref_count(&self) -> usize {
        self.device.ref_count()
    }

    /// Take another reference on the same device.
    pub fn acquire(&self) -> DeviceLease {
        self.device.lease()
    }

    pub fn is_same_device(&self, other: &DeviceLease) -> bool {
        Arc::ptr_eq(&self.device, &other.device)
    }

    /// Give up this reference. Closes the device when it was the last one.
    /// Calling it again is a no-op.
    pub async fn release(&self) -> std::result::Result<(), ocf_core::Error> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.device.unref() {
            debug!(device_id = %self.device_id(), "last reference released, closing device");
            return self.device.device.close().await;
        }
        Ok(())
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        if self.released.load(Ordering::Acquire) || !self.device.unref() {
            return;
        }
        let device = self.device.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = device.device.close().await {
                        warn!(device_id = %device.device.device_id(), error = %e, "failed to close device");
                    }
                });
            }
            Err(_) => warn!(
                device_id = %device.device.device_id(),
                "last device lease dropped outside a runtime, connections left open"
            ),
        }
    }
}

impl fmt::Debug for DeviceLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceLease")
            .field("device", &self.device.device)
            .field("refs", &self.ref_count())
            .finish()
    }
}

struct PermanentEntry {
    lease: DeviceLease,
    stores: usize,
}

/// Devices known to a client, keyed by device id.
pub struct DeviceCache {
    discovery: Arc<dyn DeviceDiscovery>,
    dialer: Arc<dyn Dialer>,
    tls: Option<TlsConfig>,
    device_config: DeviceConfig,
    devices: DashMap<String, DeviceLease>,
    permanent: DashMap<String, PermanentEntry>,
}

impl DeviceCache {
    pub fn new(
        discovery: Arc<dyn DeviceDiscovery>,
        dialer: Arc<dyn Dialer>,
        tls: Option<TlsConfig>,
        device_config: DeviceConfig,
    ) -> Self {
        Self {
            discovery,
            dialer,
            tls,
            device_config,
            devices: DashMap::new(),
            permanent: DashMap::new(),
        }
    }

    /// Lease a device, discovering it on first use.
    pub async fn get_ref_device(&self, device_id: &str) -> Result<DeviceLease> {
        if let Some(lease) = self.lookup(device_id) {
            return Ok(lease);
        }

        let discovered = self.discovery.find_device(device_id).await?;
        let device = Device::new(
            discovered.device_id,
            discovered.device_types,
            self.device_config.clone(),
            self.dialer.clone(),
            self.tls.clone(),
        );
        let candidate = RefDevice::new(device, discovered.links);

        // A concurrent discovery may have cached the device meanwhile; the
        // unused candidate never dialed, so dropping it is enough.
        let lease = match self.devices.entry(device_id.to_string()) {
            Entry::Occupied(entry) => entry.get().acquire(),
            Entry::Vacant(entry) => {
                let cached = candidate.lease();
                let lease = cached.acquire();
                entry.insert(cached);
                debug!(device_id, "device cached");
                lease
            }
        };
        Ok(lease)
    }

    fn lookup(&self, device_id: &str) -> Option<DeviceLease> {
        if let Some(entry) = self.permanent.get(device_id) {
            return Some(entry.lease.acquire());
        }
        self.devices.get(device_id).map(|lease| lease.acquire())
    }

    /// Pin a device while something depends on it. Calls are counted and must
    /// be balanced with [`DeviceCache::remove_from_permanent_cache`].
    pub fn store_to_permanent_cache(&self, lease: &DeviceLease) -> Result<()> {
        match self.permanent.entry(lease.device_id().to_string()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().lease.is_same_device(lease) {
                    return Err(ClientError::DeviceCacheConflict(
                        lease.device_id().to_string(),
                    ));
                }
                entry.get_mut().stores += 1;
            }
            Entry::Vacant(entry) => {
                entry.insert(PermanentEntry {
                    lease: lease.acquire(),
                    stores: 1,
                });
            }
        }
        Ok(())
    }

    /// Undo one [`DeviceCache::store_to_permanent_cache`] for this device.
    pub async fn remove_from_permanent_cache(&self, lease: &DeviceLease) {
        let unpinned = match self.permanent.entry(lease.device_id().to_string()) {
            Entry::Occupied(mut entry) if entry.get().lease.is_same_device(lease) => {
                entry.get_mut().stores -= 1;
                if entry.get().stores == 0 {
                    Some(entry.remove().lease)
                } else {
                    None
                }
            }
            _ => None,
        };

        if let Some(pinned) = unpinned {
            if let Err(e) = pinned.release().await {
                warn!(device_id = %lease.device_id(), error = %e, "failed to release pinned device");
            }
        }
    }

    /// Drop the cache's own reference to a device. Pinned devices stay
    /// reachable until unpinned.
    pub async fn evict(&self, device_id: &str) -> Result<()> {
        if let Some((_, lease)) = self.devices.remove(device_id) {
            lease.release().await?;
        }
        Ok(())
    }

    pub fn is_cached(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id) || self.permanent.contains_key(device_id)
    }

    pub fn is_pinned(&self, device_id: &str) -> bool {
        self.permanent.contains_key(device_id)
    }

    /// Release every reference held by the cache.
    pub async fn close(&self) -> Result<()> {
        let mut leases = Vec::new();
        let ids: Vec<String> = self.devices.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, lease)) = self.devices.remove(&id) {
                leases.push(lease);
            }
        }
        let ids: Vec<String> = self.permanent.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, entry)) = self.permanent.remove(&id) {
                leases.push(entry.lease);
            }
        }

        let mut errors = Vec::new();
        for lease in leases {
            if let Err(e) = lease.release().await {
                errors.push(e);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ClientError::Close(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocf_core::test_support::{resource_link, MockDialer};
    use ocf_core::Endpoint;
    use std::sync::atomic::AtomicUsize;

    const DEVICE_ID: &str = "6f1f8ae0-3a3c-4c7e-8d6b-2b9f0f6a1e11";

    #[derive(Default)]
    struct StaticDiscovery {
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl DeviceDiscovery for StaticDiscovery {
        async fn find_device(
            &self,
            device_id: &str,
        ) -> std::result::Result<DiscoveredDevice, DiscoveryError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if device_id != DEVICE_ID {
                return Err(DiscoveryError::NotFound(device_id.to_string()));
            }
            Ok(DiscoveredDevice {
                device_id: device_id.to_string(),
                device_types: vec!["oic.wk.d".to_string()],
                links: vec![resource_link(device_id, "/sensor", &["coap://10.0.0.1:5683"])],
            })
        }
    }

    fn cache() -> (DeviceCache, Arc<StaticDiscovery>, Arc<MockDialer>) {
        let discovery = Arc::new(StaticDiscovery::default());
        let dialer = MockDialer::new();
        let cache = DeviceCache::new(
            discovery.clone(),
            dialer.clone(),
            None,
            DeviceConfig::insecure(),
        );
        (cache, discovery, dialer)
    }

    #[tokio::test]
    async fn test_discovers_once() {
        let (cache, discovery, _) = cache();
        let first = cache.get_ref_device(DEVICE_ID).await.unwrap();
        let second = cache.get_ref_device(DEVICE_ID).await.unwrap();

        assert!(first.is_same_device(&second));
        assert_eq!(discovery.lookups.load(Ordering::SeqCst), 1);
        // cache + two leases
        assert_eq!(first.ref_count(), 3);
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let (cache, _, _) = cache();
        assert!(matches!(
            cache.get_ref_device("missing").await,
            Err(ClientError::Discovery(DiscoveryError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (cache, _, _) = cache();
        let lease = cache.get_ref_device(DEVICE_ID).await.unwrap();
        let other = lease.acquire();
        assert_eq!(other.ref_count(), 3);

        lease.release().await.unwrap();
        lease.release().await.unwrap();
        assert_eq!(other.ref_count(), 2);
    }

    #[tokio::test]
    async fn test_last_release_closes_device() {
        let (cache, _, dialer) = cache();
        let lease = cache.get_ref_device(DEVICE_ID).await.unwrap();
        lease
            .device()
            .connect(&[Endpoint::new("coap://10.0.0.1:5683")])
            .await
            .unwrap();

        cache.evict(DEVICE_ID).await.unwrap();
        assert_eq!(dialer.connections()[0].close_count(), 0);

        lease.release().await.unwrap();
        assert_eq!(dialer.connections()[0].close_count(), 1);
        assert!(!cache.is_cached(DEVICE_ID));
    }

    #[tokio::test]
    async fn test_permanent_cache_survives_eviction() {
        let (cache, discovery, _) = cache();
        let lease = cache.get_ref_device(DEVICE_ID).await.unwrap();
        cache.store_to_permanent_cache(&lease).unwrap();
        cache.store_to_permanent_cache(&lease).unwrap();
        cache.evict(DEVICE_ID).await.unwrap();

        let again = cache.get_ref_device(DEVICE_ID).await.unwrap();
        assert!(again.is_same_device(&lease));
        assert_eq!(discovery.lookups.load(Ordering::SeqCst), 1);

        cache.remove_from_permanent_cache(&lease).await;
        assert!(cache.is_pinned(DEVICE_ID));
        cache.remove_from_permanent_cache(&lease).await;
        assert!(!cache.is_pinned(DEVICE_ID));
    }

    #[tokio::test]
    async fn test_permanent_cache_conflict() {
        let (cache, _, _) = cache();
        let first = cache.get_ref_device(DEVICE_ID).await.unwrap();
        cache.store_to_permanent_cache(&first).unwrap();
        cache.remove_from_permanent_cache(&first).await;
        cache.evict(DEVICE_ID).await.unwrap();
        first.release().await.unwrap();

        let second = cache.get_ref_device(DEVICE_ID).await.unwrap();
        cache.store_to_permanent_cache(&second).unwrap();

        let stale = first.acquire();
        assert!(matches!(
            cache.store_to_permanent_cache(&stale),
            Err(ClientError::DeviceCacheConflict(_))
        ));
        stale.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_lease_gives_up_reference() {
        let (cache, _, _) = cache();
        let lease = cache.get_ref_device(DEVICE_ID).await.unwrap();
        let extra = lease.acquire();
        drop(extra);
        assert_eq!(lease.ref_count(), 2);
    }
}
