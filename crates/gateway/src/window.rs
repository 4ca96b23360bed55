//! Host context seen from the embedded client

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::messages::OutboundMessage;
use crate::store::KeyValueStore;
use crate::{GatewayError, Result};

/// Destination origin for outbound messages. Delivery accepts any origin;
/// inbound messages are origin-checked on receipt instead.
pub const WILDCARD_ORIGIN: &str = "*";

pub trait ParentWindow: Send + Sync {
    /// Deliver a message to the host
    fn post_message(&self, message: OutboundMessage, target_origin: &str) -> Result<()>;

    /// Direct read of the host's storage. Only possible when both contexts
    /// share an origin; `None` otherwise.
    fn read_parent_storage(&self, _key: &str) -> Option<String> {
        None
    }
}

/// In-process host reached over a channel
pub struct ChannelParent {
    tx: mpsc::UnboundedSender<OutboundMessage>,
    shared_storage: Option<Arc<dyn KeyValueStore>>,
}

impl ChannelParent {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                shared_storage: None,
            },
            rx,
        )
    }

    /// Host storage reachable through the same-origin fast path
    pub fn with_shared_storage(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.shared_storage = Some(store);
        self
    }
}

impl ParentWindow for ChannelParent {
    fn post_message(&self, message: OutboundMessage, target_origin: &str) -> Result<()> {
        debug!(?message, target_origin, "posting message to host");
        self.tx
            .send(message)
            .map_err(|e| GatewayError::Network(format!("host channel closed: {}", e)))
    }

    fn read_parent_storage(&self, key: &str) -> Option<String> {
        self.shared_storage.as_ref().and_then(|s| s.get(key))
    }
}
