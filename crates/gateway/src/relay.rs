/// Key relay
/// Obtains the API credential from the host context and keeps it in the local store
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::GatewayConfig;
use crate::keys;
use crate::messages::{InboundMessage, OutboundMessage};
use crate::store::KeyValueStore;
use crate::window::{ParentWindow, WILDCARD_ORIGIN};

pub struct KeyRelay {
    config: GatewayConfig,
    store: Arc<dyn KeyValueStore>,
    parent: Arc<dyn ParentWindow>,
    /// Last credential written, observed by pending waits
    credential_tx: watch::Sender<Option<String>>,
}

impl KeyRelay {
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn KeyValueStore>,
        parent: Arc<dyn ParentWindow>,
    ) -> Self {
        let current = store.get(keys::CREDENTIAL).filter(|k| !k.is_empty());
        let (credential_tx, _) = watch::channel(current);

        Self {
            config,
            store,
            parent,
            credential_tx,
        }
    }

    /// Credential currently in the local store
    pub fn credential(&self) -> Option<String> {
        self.store.get(keys::CREDENTIAL).filter(|k| !k.is_empty())
    }

    /// Announce readiness, try the same-origin fast path, then run the handshake.
    pub async fn start(&self) -> Option<String> {
        self.post(OutboundMessage::IframeReady);

        if let Some(key) = self
            .parent
            .read_parent_storage(keys::CREDENTIAL)
            .filter(|k| !k.is_empty())
        {
            info!("Credential read directly from host storage");
            self.store_credential(&key);
            return Some(key);
        }

        self.handshake().await
    }

    /// Request the key and re-request every retry interval until it arrives
    /// or the relay timeout runs out.
    pub async fn handshake(&self) -> Option<String> {
        let deadline = Instant::now() + self.config.relay_timeout();
        let interval = self.config.retry_interval();
        let mut rx = self.credential_tx.subscribe();
        let mut attempt = 0u32;

        loop {
            if let Some(key) = self.credential() {
                return Some(key);
            }

            self.post(OutboundMessage::request_key(attempt > 0));
            attempt += 1;

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match timeout(remaining.min(interval), next_credential(&mut rx)).await {
                Ok(Some(key)) => {
                    debug!("Credential received after {} request(s)", attempt);
                    return Some(key);
                }
                Ok(None) => break,
                Err(_) if Instant::now() >= deadline => break,
                Err(_) => trace!("No key response yet, re-requesting"),
            }
        }

        warn!(
            "Host did not provide a credential within {:?} ({} requests); continuing without",
            self.config.relay_timeout(),
            attempt
        );
        None
    }

    /// Wait up to `limit` for a credential. Resolves early when one is written.
    pub async fn wait_for_credential(&self, limit: Duration) -> Option<String> {
        let mut rx = self.credential_tx.subscribe();
        if let Some(key) = self.credential() {
            return Some(key);
        }

        timeout(limit, next_credential(&mut rx)).await.ok().flatten()
    }

    /// Last-chance key request, fired when a call fails for lack of a key
    pub fn request_key_once(&self) {
        self.post(OutboundMessage::request_key(true));
    }

    /// Process one message from the host. Returns false when it was ignored.
    pub fn handle_message(&self, origin: &str, payload: &serde_json::Value) -> bool {
        if !self.config.origin_allowed(origin) {
            trace!("Ignoring message from untrusted origin {}", origin);
            return false;
        }

        let Some(message) = InboundMessage::parse(payload) else {
            trace!("Ignoring unrecognised message from {}", origin);
            return false;
        };

        match message {
            InboundMessage::UserData {
                api_keys,
                is_premium,
            } => {
                if let Some(premium) = is_premium {
                    if let Err(e) = self.store.set(keys::PREMIUM, &premium.to_string()) {
                        warn!("Failed to store premium flag: {}", e);
                    }
                }
                match api_keys.falai.filter(|k| !k.is_empty()) {
                    Some(key) => {
                        info!("Credential received with session data");
                        self.store_credential(&key);
                    }
                    None => debug!("Session data carried no credential"),
                }
            }
            InboundMessage::KeyResponse { key } => {
                if key.is_empty() {
                    trace!("Ignoring empty key response");
                    return false;
                }
                info!("Credential received from host");
                self.store_credential(&key);
            }
            InboundMessage::PingTest { message } => {
                self.post(OutboundMessage::PingResponse { message });
            }
        }

        true
    }

    fn store_credential(&self, key: &str) {
        if let Err(e) = self.store.set(keys::CREDENTIAL, key) {
            warn!("Failed to persist credential: {}", e);
        }
        self.credential_tx.send_replace(Some(key.to_string()));
    }

    fn post(&self, message: OutboundMessage) {
        if let Err(e) = self.parent.post_message(message, WILDCARD_ORIGIN) {
            warn!("Failed to reach host: {}", e);
        }
    }
}

/// Next credential written after the receiver was last marked seen
async fn next_credential(rx: &mut watch::Receiver<Option<String>>) -> Option<String> {
    while rx.changed().await.is_ok() {
        if let Some(key) = rx.borrow_and_update().clone() {
            return Some(key);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChannelParent, MemoryStore};
    use serde_json::json;

    fn relay_with_store() -> (KeyRelay, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let (parent, _rx) = ChannelParent::new();
        let relay = KeyRelay::new(GatewayConfig::default(), store.clone(), Arc::new(parent));
        (relay, store)
    }

    #[test]
    fn test_user_data_stores_credential_and_premium() {
        let (relay, store) = relay_with_store();

        let handled = relay.handle_message(
            "https://host.example",
            &json!({ "type": "USER_DATA", "apiKeys": { "falai": "k-1" }, "isPremium": true }),
        );

        assert!(handled);
        assert_eq!(relay.credential().as_deref(), Some("k-1"));
        assert_eq!(store.get(keys::PREMIUM).as_deref(), Some("true"));
    }

    #[test]
    fn test_last_write_wins() {
        let (relay, _store) = relay_with_store();

        relay.handle_message("o", &json!({ "type": "KEY_RESPONSE", "key": "first" }));
        relay.handle_message("o", &json!({ "type": "FALAI_KEY_RESPONSE", "key": "second" }));

        assert_eq!(relay.credential().as_deref(), Some("second"));
    }

    #[test]
    fn test_malformed_and_empty_messages_ignored() {
        let (relay, _store) = relay_with_store();

        assert!(!relay.handle_message("o", &json!({ "type": "KEY_RESPONSE" })));
        assert!(!relay.handle_message("o", &json!({ "type": "KEY_RESPONSE", "key": "" })));
        assert!(!relay.handle_message("o", &json!({ "type": "NOPE" })));
        assert_eq!(relay.credential(), None);
    }

    #[test]
    fn test_untrusted_origin_ignored() {
        let store = Arc::new(MemoryStore::new());
        let (parent, _rx) = ChannelParent::new();
        let config = GatewayConfig::new().with_allowed_origin("https://host.example");
        let relay = KeyRelay::new(config, store, Arc::new(parent));

        assert!(!relay.handle_message(
            "https://evil.example",
            &json!({ "type": "KEY_RESPONSE", "key": "stolen" })
        ));
        assert_eq!(relay.credential(), None);

        assert!(relay.handle_message(
            "https://host.example",
            &json!({ "type": "KEY_RESPONSE", "key": "real" })
        ));
        assert_eq!(relay.credential().as_deref(), Some("real"));
    }

    #[test]
    fn test_ping_is_answered() {
        let store = Arc::new(MemoryStore::new());
        let (parent, mut rx) = ChannelParent::new();
        let relay = KeyRelay::new(GatewayConfig::default(), store, Arc::new(parent));

        relay.handle_message("o", &json!({ "type": "PING_TEST", "message": "hello" }));

        assert_eq!(
            rx.try_recv().unwrap(),
            OutboundMessage::PingResponse {
                message: "hello".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_existing_credential_short_circuits_wait() {
        let (relay, store) = relay_with_store();
        store.set(keys::CREDENTIAL, "stored").unwrap();

        let key = relay.wait_for_credential(Duration::from_millis(1)).await;
        assert_eq!(key.as_deref(), Some("stored"));
    }
}
