/// Queue API client
/// Submits generation jobs and tracks them to completion.
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::dispatch::{Dispatcher, OutboundRequest};
use crate::{GatewayError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSubmission {
    pub request_id: String,
    #[serde(default)]
    pub status_url: Option<String>,
    #[serde(default)]
    pub response_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueState {
    InQueue,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub status: QueueState,
    #[serde(default)]
    pub queue_position: Option<u32>,
    #[serde(default)]
    pub logs: Option<Vec<serde_json::Value>>,
}

pub struct QueueClient {
    dispatcher: Arc<Dispatcher>,
    base_url: String,
}

impl QueueClient {
    pub fn new(dispatcher: Arc<Dispatcher>, base_url: impl Into<String>) -> Self {
        Self {
            dispatcher,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Submit a job. This is the only call that consumes quota.
    pub async fn submit(
        &self,
        endpoint: &str,
        input: serde_json::Value,
    ) -> Result<QueueSubmission> {
        let url = format!("{}/{}", self.base_url, endpoint.trim_matches('/'));
        let response = self
            .dispatcher
            .dispatch(OutboundRequest::post(url).json(input))
            .await?;

        let submission: QueueSubmission = response.json()?;
        info!("Submitted {} as {}", endpoint, submission.request_id);
        Ok(submission)
    }

    pub async fn status(&self, endpoint: &str, request_id: &str) -> Result<QueueStatus> {
        let url = format!("{}/status", self.request_url(endpoint, request_id));
        let response = self
            .dispatcher
            .dispatch(OutboundRequest::get(url).polling())
            .await?;
        response.json()
    }

    pub async fn result(&self, endpoint: &str, request_id: &str) -> Result<serde_json::Value> {
        let url = self.request_url(endpoint, request_id);
        let response = self
            .dispatcher
            .dispatch(OutboundRequest::get(url).polling())
            .await?;
        response.json()
    }

    /// Submit, poll until completed, then fetch the result.
    pub async fn subscribe(
        &self,
        endpoint: &str,
        input: serde_json::Value,
        poll_interval: Duration,
        limit: Duration,
    ) -> Result<serde_json::Value> {
        let submission = self.submit(endpoint, input).await?;
        let deadline = Instant::now() + limit;

        loop {
            let status = self.status(endpoint, &submission.request_id).await?;
            match status.status {
                QueueState::Completed => break,
                state => debug!(
                    "{} is {:?} (position {:?})",
                    submission.request_id, state, status.queue_position
                ),
            }

            if Instant::now() + poll_interval > deadline {
                return Err(GatewayError::Timeout(format!(
                    "request {} did not complete within {:?}",
                    submission.request_id, limit
                )));
            }
            tokio::time::sleep(poll_interval).await;
        }

        self.result(endpoint, &submission.request_id).await
    }

    fn request_url(&self, endpoint: &str, request_id: &str) -> String {
        format!("{}/{}/requests/{}", self.base_url, app_id(endpoint), request_id)
    }
}

/// Owner and app name of an endpoint; any trailing sub-path is dropped.
fn app_id(endpoint: &str) -> String {
    endpoint
        .trim_matches('/')
        .split('/')
        .take(2)
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_id() {
        assert_eq!(app_id("fal-ai/flux/dev"), "fal-ai/flux");
        assert_eq!(app_id("/fal-ai/kling-video/v1/standard/text-to-video"), "fal-ai/kling-video");
        assert_eq!(app_id("fal-ai/fast-sdxl"), "fal-ai/fast-sdxl");
    }

    #[test]
    fn test_status_parsing() {
        let status: QueueStatus =
            serde_json::from_str(r#"{"status":"IN_QUEUE","queue_position":3}"#).unwrap();
        assert_eq!(status.status, QueueState::InQueue);
        assert_eq!(status.queue_position, Some(3));

        let done: QueueStatus = serde_json::from_str(r#"{"status":"COMPLETED","logs":[]}"#).unwrap();
        assert_eq!(done.status, QueueState::Completed);
    }
}
