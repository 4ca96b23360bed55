/// Generation gateway
/// Credential relay, daily quota gate and request dispatch for the generation API
use thiserror::Error;

pub mod clock;
pub mod config;
pub mod dispatch;
pub mod messages;
pub mod queue;
pub mod quota;
pub mod relay;
pub mod store;
pub mod window;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::GatewayConfig;
pub use dispatch::{Dispatcher, OutboundRequest, ReqwestTransport, Transport, UpstreamResponse};
pub use messages::{InboundMessage, OutboundMessage};
pub use queue::{QueueClient, QueueState, QueueStatus, QueueSubmission};
pub use quota::{QuotaGate, QuotaStatus};
pub use relay::KeyRelay;
pub use store::{JsonFileStore, KeyValueStore, MemoryStore};
pub use window::{ChannelParent, ParentWindow};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing API credential: the host did not provide a key")]
    MissingCredential,

    #[error("daily quota exceeded: {used}/{limit} generation calls used today")]
    QuotaExceeded { used: u32, limit: u32 },

    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

impl GatewayError {
    /// Callers match on this to offer an upgrade instead of a generic failure.
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, GatewayError::QuotaExceeded { .. })
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        GatewayError::Network(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Local storage key names shared by the relay and the quota gate
pub mod keys {
    pub const CREDENTIAL: &str = "falai_api_key";
    pub const PREMIUM: &str = "is_premium";
    pub const DAILY_CALLS: &str = "daily_api_calls";
    pub const RESET_DATE: &str = "api_calls_reset_date";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_error_message_is_matchable() {
        let err = GatewayError::QuotaExceeded { used: 10, limit: 10 };
        assert!(err.is_quota_exceeded());
        assert!(err.to_string().contains("quota exceeded"));
        assert!(!GatewayError::MissingCredential.is_quota_exceeded());
    }
}
