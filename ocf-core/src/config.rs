//! Configuration for device connections.

use std::time::Duration;

/// Connection policy applied by a [`crate::Device`].
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Refuse `coaps` endpoints
    pub disable_dtls: bool,

    /// Refuse `coaps+tcp` endpoints
    pub disable_tcp_tls: bool,

    /// Upper bound on a single dial including the handshake
    pub dial_timeout: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            disable_dtls: false,
            disable_tcp_tls: false,
            dial_timeout: Duration::from_secs(10),
        }
    }
}

impl DeviceConfig {
    /// Plain CoAP only, for lab networks without provisioning.
    pub fn insecure() -> Self {
        Self {
            disable_dtls: true,
            disable_tcp_tls: true,
            ..Default::default()
        }
    }

    /// Stream transports only.
    pub fn tcp_only() -> Self {
        Self {
            disable_dtls: true,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.dial_timeout.is_zero() {
            return Err("dial_timeout must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn with_disable_dtls(mut self, disable: bool) -> Self {
        self.disable_dtls = disable;
        self
    }

    pub fn with_disable_tcp_tls(mut self, disable: bool) -> Self {
        self.disable_tcp_tls = disable;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }
}
