//! Configuration for the cloud gateway client

use std::time::Duration;

/// Settings for [`Client`](crate::Client).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upper bound for opening a subscription or retrieving a resource
    pub request_timeout: Duration,

    /// Maximum number of live observations, `None` for no limit
    pub max_subscriptions: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_subscriptions: None,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.request_timeout.is_zero() {
            return Err("request_timeout must be greater than 0".to_string());
        }

        if self.max_subscriptions == Some(0) {
            return Err("max_subscriptions must be greater than 0".to_string());
        }

        Ok(())
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_subscriptions(mut self, max: usize) -> Self {
        self.max_subscriptions = Some(max);
        self
    }
}
