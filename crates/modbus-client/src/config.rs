use std::time::Duration;

use types::ConfigError;

/// Configuration for one `ConnectionManager`.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Opaque connection string, e.g. `modbus:tcp://10.0.0.5:502?unit-identifier=1`.
    pub connection_string: String,
    pub request_timeout: Duration,
    pub max_retries: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Fractional jitter applied to computed backoff delays, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection_string: "modbus:tcp://127.0.0.1:502?unit-identifier=1".to_string(),
            request_timeout: Duration::from_secs(5),
            max_retries: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection_string.trim().is_empty() {
            return Err(ConfigError::Blank { field: "connection_string" });
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::NotPositive { field: "request_timeout" });
        }
        if self.initial_backoff.is_zero() {
            return Err(ConfigError::NotPositive { field: "initial_backoff" });
        }
        if self.max_backoff < self.initial_backoff {
            return Err(ConfigError::NotPositive { field: "max_backoff" });
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::JitterOutOfRange(self.jitter));
        }
        Ok(())
    }
}
