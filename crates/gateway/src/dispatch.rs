/// Request dispatch
/// Every outbound generation call passes through here: credential lookup,
/// quota enforcement, then the transport.
use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::quota::QuotaGate;
use crate::relay::KeyRelay;
use crate::{GatewayError, Result};

#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    /// Status checks and result fetches issued while waiting on a job
    pub polling: bool,
}

impl OutboundRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            polling: false,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn polling(mut self) -> Self {
        self.polling = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Network side of the dispatcher
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: OutboundRequest, credential: &str) -> Result<UpstreamResponse>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: OutboundRequest, credential: &str) -> Result<UpstreamResponse> {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .header("Authorization", format!("Key {}", credential));

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?.to_vec();

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

pub struct Dispatcher {
    relay: Arc<KeyRelay>,
    quota: Arc<QuotaGate>,
    transport: Arc<dyn Transport>,
    credential_wait: Duration,
}

impl Dispatcher {
    pub fn new(
        relay: Arc<KeyRelay>,
        quota: Arc<QuotaGate>,
        transport: Arc<dyn Transport>,
        credential_wait: Duration,
    ) -> Self {
        Self {
            relay,
            quota,
            transport,
            credential_wait,
        }
    }

    pub fn relay(&self) -> &Arc<KeyRelay> {
        &self.relay
    }

    pub fn quota(&self) -> &Arc<QuotaGate> {
        &self.quota
    }

    /// Send one request. Nothing reaches the network without a credential or
    /// once today's quota is spent.
    pub async fn dispatch(&self, request: OutboundRequest) -> Result<UpstreamResponse> {
        let credential = match self.relay.credential() {
            Some(key) => key,
            None => {
                debug!("No credential stored, waiting on relay");
                match self.relay.wait_for_credential(self.credential_wait).await {
                    Some(key) => key,
                    None => {
                        self.relay.request_key_once();
                        return Err(GatewayError::MissingCredential);
                    }
                }
            }
        };

        self.quota
            .check_and_record(&request.url, &request.method, request.polling)?;

        let method = request.method.clone();
        let url = request.url.clone();
        let response = self.transport.send(request, &credential).await?;

        if !response.is_success() {
            warn!("{} {} failed with {}", method, url, response.status);
            return Err(GatewayError::Upstream {
                status: response.status,
                body: response.text(),
            });
        }

        debug!("{} {} -> {}", method, url, response.status);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let req = OutboundRequest::post("https://queue.fal.run/fal-ai/flux")
            .json(serde_json::json!({ "prompt": "a cat" }))
            .header("x-trace", "1");
        assert_eq!(req.method, Method::POST);
        assert!(!req.polling);
        assert_eq!(req.headers, vec![("x-trace".to_string(), "1".to_string())]);

        let poll = OutboundRequest::get("https://queue.fal.run/x/requests/1/status").polling();
        assert!(poll.polling);
    }

    #[test]
    fn test_response_helpers() {
        let ok = UpstreamResponse {
            status: 200,
            headers: Vec::new(),
            body: br#"{"request_id":"r1"}"#.to_vec(),
        };
        assert!(ok.is_success());
        let value: serde_json::Value = ok.json().unwrap();
        assert_eq!(value["request_id"], "r1");

        let failed = UpstreamResponse {
            status: 422,
            headers: Vec::new(),
            body: b"bad input".to_vec(),
        };
        assert!(!failed.is_success());
        assert_eq!(failed.text(), "bad input");
    }
}
