/// Window message protocol between the embedded client and its host
use serde::{Deserialize, Serialize};

/// Messages the host sends to the embedded client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    /// Session handshake pushed by the host
    #[serde(rename = "USER_DATA", rename_all = "camelCase")]
    UserData {
        #[serde(default)]
        api_keys: ApiKeys,
        #[serde(default)]
        is_premium: Option<bool>,
    },

    #[serde(rename = "KEY_RESPONSE", alias = "FALAI_KEY_RESPONSE")]
    KeyResponse { key: String },

    #[serde(rename = "PING_TEST")]
    PingTest { message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiKeys {
    #[serde(default)]
    pub falai: Option<String>,
}

impl InboundMessage {
    /// Parses a raw message; anything malformed or unknown yields `None`.
    pub fn parse(payload: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(payload.clone()).ok()
    }
}

/// Messages the embedded client sends to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    #[serde(rename = "REQUEST_KEY", alias = "REQUEST_FALAI_KEY")]
    RequestKey {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },

    #[serde(rename = "IFRAME_READY")]
    IframeReady,

    #[serde(rename = "PING_RESPONSE")]
    PingResponse { message: String },
}

impl OutboundMessage {
    pub fn request_key(retry: bool) -> Self {
        OutboundMessage::RequestKey {
            retry: retry.then_some(true),
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
        }
    }

    pub fn is_key_request(&self) -> bool {
        matches!(self, OutboundMessage::RequestKey { .. })
    }
}
