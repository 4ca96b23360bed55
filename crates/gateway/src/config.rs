/// Gateway configuration
/// Relay timing, quota limit and upstream endpoint
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_DAILY_LIMIT: u32 = 10;
pub const DEFAULT_UPSTREAM_BASE: &str = "https://queue.fal.run";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Countable calls allowed per calendar day for non-premium sessions
    pub daily_limit: u32,

    /// Interval between key requests sent to the parent
    pub retry_interval_ms: u64,

    /// Maximum time to wait for the parent to hand over a key
    pub relay_timeout_ms: u64,

    /// Origins accepted for inbound messages (empty accepts any)
    pub allowed_origins: Vec<String>,

    /// Queue API base URL
    pub upstream_base: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            daily_limit: DEFAULT_DAILY_LIMIT,
            retry_interval_ms: 2_000,
            relay_timeout_ms: 10_000,
            allowed_origins: Vec::new(),
            upstream_base: DEFAULT_UPSTREAM_BASE.to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// With daily call limit
    pub fn with_daily_limit(mut self, limit: u32) -> Self {
        self.daily_limit = limit;
        self
    }

    /// With relay retry interval and overall timeout
    pub fn with_relay_timing(mut self, retry_interval: Duration, timeout: Duration) -> Self {
        self.retry_interval_ms = retry_interval.as_millis() as u64;
        self.relay_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// With an accepted parent origin
    pub fn with_allowed_origin(mut self, origin: impl Into<String>) -> Self {
        self.allowed_origins.push(origin.into());
        self
    }

    /// With queue API base URL
    pub fn with_upstream_base(mut self, base: impl Into<String>) -> Self {
        self.upstream_base = base.into();
        self
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn relay_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_timeout_ms)
    }

    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.is_empty() || self.allowed_origins.iter().any(|o| o == origin)
    }

    /// Save configuration to JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load configuration from JSON
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.daily_limit, 10);
        assert_eq!(config.retry_interval(), Duration::from_secs(2));
        assert_eq!(config.relay_timeout(), Duration::from_secs(10));
        assert!(config.origin_allowed("https://anything.example"));
    }

    #[test]
    fn test_origin_allow_list() {
        let config = GatewayConfig::new().with_allowed_origin("https://host.example");
        assert!(config.origin_allowed("https://host.example"));
        assert!(!config.origin_allowed("https://evil.example"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.json");

        let config = GatewayConfig::new()
            .with_daily_limit(3)
            .with_upstream_base("http://localhost:9000");
        config.save(&path).unwrap();

        let loaded = GatewayConfig::load(&path).unwrap();
        assert_eq!(loaded.daily_limit, 3);
        assert_eq!(loaded.upstream_base, "http://localhost:9000");
        assert_eq!(loaded.relay_timeout_ms, 10_000);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: GatewayConfig = serde_json::from_str(r#"{"daily_limit": 25}"#).unwrap();
        assert_eq!(config.daily_limit, 25);
        assert_eq!(config.upstream_base, DEFAULT_UPSTREAM_BASE);
    }
}
