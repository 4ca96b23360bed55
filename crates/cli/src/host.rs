//! Stand-in host for headless use: answers the relay from the environment.

use gateway::{KeyRelay, OutboundMessage};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

pub const HOST_ORIGIN: &str = "cli://host";

/// What the host knows about the session
#[derive(Debug, Clone, Default)]
pub struct HostSession {
    pub api_key: Option<String>,
    pub premium: bool,
}

impl HostSession {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("FAL_KEY").ok().filter(|k| !k.is_empty()),
            premium: std::env::var("FAL_PREMIUM")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }
}

/// Serve relay messages until the client side goes away. Session data is
/// pushed once the client reports ready; key requests get a key response.
pub fn spawn(
    session: HostSession,
    relay: Arc<KeyRelay>,
    mut rx: mpsc::UnboundedReceiver<OutboundMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            debug!(?message, "host received");
            match message {
                OutboundMessage::IframeReady => {
                    relay.handle_message(
                        HOST_ORIGIN,
                        &json!({
                            "type": "USER_DATA",
                            "apiKeys": { "falai": session.api_key },
                            "isPremium": session.premium,
                        }),
                    );
                }
                OutboundMessage::RequestKey { .. } => {
                    if let Some(key) = &session.api_key {
                        relay.handle_message(
                            HOST_ORIGIN,
                            &json!({ "type": "KEY_RESPONSE", "key": key }),
                        );
                    }
                }
                OutboundMessage::PingResponse { .. } => {}
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway::{ChannelParent, GatewayConfig, MemoryStore};

    #[tokio::test]
    async fn test_host_answers_handshake() {
        let store = Arc::new(MemoryStore::new());
        let (parent, rx) = ChannelParent::new();
        let relay = Arc::new(KeyRelay::new(
            GatewayConfig::default(),
            store,
            Arc::new(parent),
        ));

        let session = HostSession {
            api_key: Some("env-key".to_string()),
            premium: false,
        };
        spawn(session, relay.clone(), rx);

        assert_eq!(relay.start().await.as_deref(), Some("env-key"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_without_key_stays_silent() {
        let store = Arc::new(MemoryStore::new());
        let (parent, rx) = ChannelParent::new();
        let relay = Arc::new(KeyRelay::new(
            GatewayConfig::default(),
            store,
            Arc::new(parent),
        ));

        spawn(HostSession::default(), relay.clone(), rx);

        assert_eq!(relay.start().await, None);
    }
}
