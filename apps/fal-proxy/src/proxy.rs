/// Upstream forwarding route
/// Resolves the target, attaches a credential and relays the exchange verbatim
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::any,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, warn};

use crate::config::ProxyConfig;

pub const TARGET_URL_HEADER: &str = "x-fal-target-url";
pub const KEY_HEADER: &str = "x-fal-key";

/// Generation inputs may carry inline media
pub const MAX_BODY_BYTES: usize = 100 * 1024 * 1024;

/// Request headers that never cross the hop
const SKIPPED_REQUEST_HEADERS: [&str; 7] = [
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "authorization",
    TARGET_URL_HEADER,
    KEY_HEADER,
];

const SKIPPED_RESPONSE_HEADERS: [&str; 3] = ["connection", "content-length", "transfer-encoding"];

pub struct ProxyState {
    pub client: reqwest::Client,
    pub config: ProxyConfig,
}

impl ProxyState {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

pub enum ProxyError {
    MissingTarget,
    InvalidTarget(String),
    ForbiddenTarget(String),
    MissingCredential,
    Forward(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ProxyError::MissingTarget => (
                StatusCode::BAD_REQUEST,
                "Missing target URL: set the x-fal-target-url header or a path".to_string(),
            ),
            ProxyError::InvalidTarget(url) => {
                (StatusCode::BAD_REQUEST, format!("Invalid target URL: {}", url))
            }
            ProxyError::ForbiddenTarget(host) => (
                StatusCode::BAD_REQUEST,
                format!("Target host not allowed: {}", host),
            ),
            ProxyError::MissingCredential => (
                StatusCode::UNAUTHORIZED,
                "Missing credential: no API key provided".to_string(),
            ),
            ProxyError::Forward(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to forward request: {}", e),
            ),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub fn router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/api/fal/proxy", any(proxy))
        .route("/api/fal/proxy/*path", any(proxy))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// ANY /api/fal/proxy[/*path] - Forward to the generation API
pub async fn proxy(
    State(state): State<Arc<ProxyState>>,
    path: Option<Path<String>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    let target = resolve_target(
        &headers,
        path.as_ref().map(|Path(p)| p.as_str()),
        uri.query(),
        &state.config,
    )?;
    let authorization = resolve_authorization(&headers, state.config.fallback_key.as_deref())?;

    debug!("{} -> {}", method, target);

    let mut upstream_headers = HeaderMap::new();
    for (name, value) in headers.iter() {
        if !SKIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
            upstream_headers.append(name.clone(), value.clone());
        }
    }
    upstream_headers.insert(header::AUTHORIZATION, authorization);

    let upstream = state
        .client
        .request(method, target.clone())
        .headers(upstream_headers)
        .body(body)
        .send()
        .await
        .map_err(|e| {
            error!("Forwarding to {} failed: {}", target, e);
            ProxyError::Forward(e.to_string())
        })?;

    let status = upstream.status();
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream.headers().iter() {
        if !SKIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
            response_headers.append(name.clone(), value.clone());
        }
    }

    let bytes = upstream.bytes().await.map_err(|e| {
        error!("Reading upstream body from {} failed: {}", target, e);
        ProxyError::Forward(e.to_string())
    })?;

    if !status.is_success() {
        warn!("Upstream {} answered {}", target, status);
    }

    Ok((status, response_headers, bytes).into_response())
}

/// Target from the explicit header, else the path suffix under the upstream base
fn resolve_target(
    headers: &HeaderMap,
    path: Option<&str>,
    query: Option<&str>,
    config: &ProxyConfig,
) -> Result<reqwest::Url, ProxyError> {
    let raw = match headers
        .get(TARGET_URL_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        Some(explicit) => explicit.to_string(),
        None => {
            let suffix = path
                .map(|p| p.trim_matches('/'))
                .filter(|p| !p.is_empty())
                .ok_or(ProxyError::MissingTarget)?;
            let mut url = format!("{}/{}", config.upstream_base.trim_end_matches('/'), suffix);
            if let Some(q) = query {
                url.push('?');
                url.push_str(q);
            }
            url
        }
    };

    let url = reqwest::Url::parse(&raw).map_err(|_| ProxyError::InvalidTarget(raw.clone()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ProxyError::InvalidTarget(raw));
    }

    // Credentials only ever travel to known hosts
    let host = url.host_str().unwrap_or_default().to_string();
    if !config.host_allowed(&host) {
        warn!("Refusing target outside the allow-list: {}", host);
        return Err(ProxyError::ForbiddenTarget(host));
    }
    Ok(url)
}

/// Inbound authorization passes through; otherwise a key header or the
/// server-held key is turned into one.
fn resolve_authorization(
    headers: &HeaderMap,
    fallback_key: Option<&str>,
) -> Result<HeaderValue, ProxyError> {
    if let Some(auth) = headers
        .get(header::AUTHORIZATION)
        .filter(|v| !v.is_empty())
    {
        return Ok(auth.clone());
    }

    let key = headers
        .get(HeaderName::from_static(KEY_HEADER))
        .and_then(|v| v.to_str().ok())
        .filter(|k| !k.is_empty())
        .or(fallback_key.filter(|k| !k.is_empty()))
        .ok_or(ProxyError::MissingCredential)?;

    HeaderValue::from_str(&format!("Key {}", key))
        .map_err(|e| ProxyError::Forward(format!("unusable credential: {}", e)))
}
