use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gateway::{
    ChannelParent, Dispatcher, GatewayConfig, GatewayError, JsonFileStore, KeyRelay,
    KeyValueStore, QueueClient, QuotaGate, ReqwestTransport, SystemClock,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

mod host;

#[derive(Parser)]
#[command(name = "studio-cli")]
#[command(about = "Generation Studio CLI - Submit and track generation jobs from the terminal")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Session store (defaults to the app data directory)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Gateway configuration JSON
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a generation job
    Submit {
        /// Model endpoint, e.g. fal-ai/flux/dev
        endpoint: String,

        /// Prompt text
        #[arg(short, long)]
        prompt: Option<String>,

        /// Full JSON input (overrides --prompt)
        #[arg(long)]
        input: Option<String>,

        /// Wait for completion and print the result
        #[arg(long)]
        wait: bool,

        /// Poll interval in milliseconds
        #[arg(long, default_value = "1000")]
        poll_interval_ms: u64,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "600")]
        timeout_secs: u64,
    },

    /// Show the status of a submitted job
    Status {
        endpoint: String,
        request_id: String,
    },

    /// Fetch the result of a completed job
    Result {
        endpoint: String,
        request_id: String,
    },

    /// Show today's quota usage
    Quota {
        /// Zero today's counter
        #[arg(long)]
        reset: bool,
    },
}

fn default_store_path() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
    base.join("generation_studio").join("storage.json")
}

struct Session {
    relay: Arc<KeyRelay>,
    quota: Arc<QuotaGate>,
    queue: QueueClient,
}

fn open_session(
    config: GatewayConfig,
    store: Arc<dyn KeyValueStore>,
    host: host::HostSession,
) -> Session {
    let (parent, host_rx) = ChannelParent::new();
    let relay = Arc::new(KeyRelay::new(config.clone(), store.clone(), Arc::new(parent)));
    let quota = Arc::new(QuotaGate::new(
        store,
        Arc::new(SystemClock),
        config.daily_limit,
    ));

    host::spawn(host, relay.clone(), host_rx);

    let dispatcher = Arc::new(Dispatcher::new(
        relay.clone(),
        quota.clone(),
        Arc::new(ReqwestTransport::new()),
        config.relay_timeout(),
    ));
    let queue = QueueClient::new(dispatcher, config.upstream_base.clone());

    Session {
        relay,
        quota,
        queue,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    let config = match &cli.config {
        Some(path) => GatewayConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    let store_path = cli.store.clone().unwrap_or_else(default_store_path);
    let store: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::open(&store_path)?);
    let session = open_session(config, store, host::HostSession::from_env());

    let outcome = match cli.command {
        Commands::Submit {
            endpoint,
            prompt,
            input,
            wait,
            poll_interval_ms,
            timeout_secs,
        } => {
            submit_command(
                &session,
                endpoint,
                prompt,
                input,
                wait,
                Duration::from_millis(poll_interval_ms),
                Duration::from_secs(timeout_secs),
            )
            .await
        }
        Commands::Status {
            endpoint,
            request_id,
        } => status_command(&session, endpoint, request_id).await,
        Commands::Result {
            endpoint,
            request_id,
        } => result_command(&session, endpoint, request_id).await,
        Commands::Quota { reset } => quota_command(&session, reset),
    };

    outcome.map_err(|e| {
        if let Some(GatewayError::QuotaExceeded { .. }) = e.downcast_ref::<GatewayError>() {
            warn!("Upgrade to premium to lift the daily limit");
        }
        e
    })
}

fn build_input(prompt: Option<String>, input: Option<String>) -> Result<serde_json::Value> {
    match (input, prompt) {
        (Some(raw), _) => serde_json::from_str(&raw).context("--input is not valid JSON"),
        (None, Some(prompt)) => Ok(serde_json::json!({ "prompt": prompt })),
        (None, None) => anyhow::bail!("either --prompt or --input is required"),
    }
}

/// Run the handshake once. Without a key there is nothing to dispatch.
async fn connect(session: &Session) -> Result<()> {
    match session.relay.start().await {
        Some(_) => Ok(()),
        None => Err(GatewayError::MissingCredential.into()),
    }
}

async fn submit_command(
    session: &Session,
    endpoint: String,
    prompt: Option<String>,
    input: Option<String>,
    wait: bool,
    poll_interval: Duration,
    limit: Duration,
) -> Result<()> {
    let input = build_input(prompt, input)?;
    connect(session).await?;

    if wait {
        let result = session
            .queue
            .subscribe(&endpoint, input, poll_interval, limit)
            .await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        let submission = session.queue.submit(&endpoint, input).await?;
        info!("Request queued: {}", submission.request_id);
        println!("{}", submission.request_id);
    }

    let status = session.quota.status();
    if !status.premium {
        info!("{} of {} calls left today", status.remaining(), status.limit);
    }
    Ok(())
}

async fn status_command(session: &Session, endpoint: String, request_id: String) -> Result<()> {
    connect(session).await?;
    let status = session.queue.status(&endpoint, &request_id).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn result_command(session: &Session, endpoint: String, request_id: String) -> Result<()> {
    connect(session).await?;
    let result = session.queue.result(&endpoint, &request_id).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn quota_command(session: &Session, reset: bool) -> Result<()> {
    if reset {
        session.quota.reset()?;
        info!("Quota counter reset");
    }

    let status = session.quota.status();
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway::MemoryStore;

    #[tokio::test(start_paused = true)]
    async fn test_connect_without_key_fails_after_one_handshake() {
        let config = GatewayConfig::default();
        let timeout = config.relay_timeout();
        let session = open_session(
            config,
            Arc::new(MemoryStore::new()),
            host::HostSession::default(),
        );

        let started = tokio::time::Instant::now();
        let err = connect(&session).await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(
            err.downcast_ref::<GatewayError>(),
            Some(GatewayError::MissingCredential)
        ));
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_secs(1));
        assert_eq!(session.quota.status().used, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_with_host_key() {
        let session = open_session(
            GatewayConfig::default(),
            Arc::new(MemoryStore::new()),
            host::HostSession {
                api_key: Some("env-key".to_string()),
                premium: false,
            },
        );

        connect(&session).await.unwrap();
        assert_eq!(session.relay.credential().as_deref(), Some("env-key"));
    }

    #[test]
    fn test_build_input() {
        let from_prompt = build_input(Some("a fox".to_string()), None).unwrap();
        assert_eq!(from_prompt, serde_json::json!({ "prompt": "a fox" }));

        let raw = build_input(
            Some("ignored".to_string()),
            Some(r#"{"prompt":"x","num_images":2}"#.to_string()),
        )
        .unwrap();
        assert_eq!(raw["num_images"], 2);

        assert!(build_input(None, Some("{oops".to_string())).is_err());
        assert!(build_input(None, None).is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "studio-cli",
            "submit",
            "fal-ai/flux/dev",
            "--prompt",
            "a lighthouse",
            "--wait",
        ])
        .unwrap();

        match cli.command {
            Commands::Submit { endpoint, wait, .. } => {
                assert_eq!(endpoint, "fal-ai/flux/dev");
                assert!(wait);
            }
            _ => panic!("expected submit"),
        }
    }
}
