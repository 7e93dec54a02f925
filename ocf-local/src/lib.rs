//! # ocf-local
//!
//! Client for OCF devices reachable on the local network.
//!
//! The [`Client`] resolves devices through a [`DeviceDiscovery`]
//! implementation, keeps them in a reference-counted [`DeviceCache`] and
//! multiplexes resource observations: any number of handlers observing the
//! same resource of the same device share one physical CoAP observation.
//!
//! Observation ids returned by [`Client::observe_resource`] have the form
//! `<registry key>/<subscription id>`.

pub mod client;
pub mod config;
pub mod device_cache;
pub mod error;
mod observe;

pub use client::Client;
pub use config::ClientConfig;
pub use device_cache::{DeviceCache, DeviceDiscovery, DeviceLease, DiscoveredDevice, RefDevice};
pub use error::{ClientError, DiscoveryError, Result};
pub use observe::{parse_observation_id, registry_key};
