//! Generation API proxy
//! Forwards browser calls to the queue API with a credential attached

mod config;
mod proxy;

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::ProxyConfig;
use crate::proxy::ProxyState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter("fal_proxy=debug,tower_http=info")
        .init();

    let config = ProxyConfig::from_env();
    if config.fallback_key.is_none() {
        warn!("FAL_KEY not set; requests without their own credential will be rejected");
    }

    let addr = config.addr.clone();
    info!("Upstream base: {}", config.upstream_base);

    let app = proxy::router(Arc::new(ProxyState::new(config)));

    info!("Proxy listening on http://{}", addr);
    info!("  ANY /api/fal/proxy        - target from x-fal-target-url");
    info!("  ANY /api/fal/proxy/*path  - target under the upstream base");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
