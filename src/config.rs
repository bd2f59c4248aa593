//! Client configuration.

use std::time::Duration;

/// Default number of attempts for replayable requests.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Endpoint discovery service.
pub const DISCOVERY_URL: &str = "https://drive.amazonaws.com/drive/v1";

/// Settings shared by every request a [`CloudDrive`](crate::CloudDrive) makes.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Maximum attempts for requests whose body can be replayed.
    pub max_retries: u32,
    /// Backoff ceiling before retry `n` (zero-based) is `backoff_unit * 2^n`.
    pub backoff_unit: Duration,
    pub discovery_url: String,
    /// Per-attempt timeout; none by default.
    pub request_timeout: Option<Duration>,
    /// Fixed seed for the backoff jitter; seeded from entropy when unset.
    pub jitter_seed: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_unit: Duration::from_secs(1),
            discovery_url: DISCOVERY_URL.to_string(),
            request_timeout: None,
            jitter_seed: None,
        }
    }
}

impl ClientConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    pub fn with_discovery_url(mut self, url: impl Into<String>) -> Self {
        self.discovery_url = url.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = Some(seed);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.backoff_unit, Duration::from_secs(1));
        assert_eq!(config.discovery_url, DISCOVERY_URL);
        assert!(config.request_timeout.is_none());
        assert!(config.jitter_seed.is_none());
    }

    #[test]
    fn test_builders() {
        let config = ClientConfig::default()
            .with_max_retries(2)
            .with_backoff_unit(Duration::from_millis(5))
            .with_discovery_url("http://127.0.0.1:1234")
            .with_jitter_seed(7);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.backoff_unit, Duration::from_millis(5));
        assert_eq!(config.discovery_url, "http://127.0.0.1:1234");
        assert_eq!(config.jitter_seed, Some(7));
    }
}
