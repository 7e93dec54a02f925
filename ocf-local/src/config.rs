//! Configuration for the local client.

use std::time::Duration;

use ocf_core::DeviceConfig;

/// Settings for [`crate::Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Connection policy for every device the client talks to
    pub device: DeviceConfig,

    /// Deadline for one-shot requests and for registering an observation
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    /// Plain CoAP only, no credentials needed.
    pub fn insecure() -> Self {
        Self {
            device: DeviceConfig::insecure(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        self.device.validate()?;

        if self.request_timeout.is_zero() {
            return Err("request_timeout must be greater than 0".to_string());
        }
        if self.request_timeout < self.device.dial_timeout {
            return Err("request_timeout must not be shorter than dial_timeout".to_string());
        }
        Ok(())
    }

    pub fn with_device_config(mut self, device: DeviceConfig) -> Self {
        self.device = device;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}
