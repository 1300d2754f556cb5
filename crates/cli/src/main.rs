//! Process entry point: load configuration, initialise tracing, wire the
//! vault, auth manager, optional upstream chat bridge, and gateway
//! state together, then serve until a shutdown signal arrives.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use relay_gateway::state::ChatFallbackConfig;
use relay_gateway::GatewayState;
use relay_vault::VaultFacade;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 18900;
const DEFAULT_OPENROUTER_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";

#[derive(Parser)]
#[command(name = "relay-gatewayd", about = "Local agent relay gateway")]
struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, default_value_t = false)]
    json_logs: bool,

    /// Address to bind the WebSocket + REST surface to.
    #[arg(long, env = "RELAY_HOST")]
    host: Option<String>,
    /// Port to listen on.
    #[arg(long, env = "RELAY_PORT")]
    port: Option<u16>,

    /// Vault root directory.
    #[arg(long, env = "VAULT_PATH")]
    vault_path: Option<std::path::PathBuf>,

    /// Relay's own API key; unset runs the gateway in open mode.
    #[arg(long, env = "AGENTHQ_API_KEY")]
    agenthq_api_key: Option<String>,

    /// Default chat completion model for the synchronous fallback path.
    #[arg(long, env = "DEFAULT_MODEL", default_value = "gpt-4o-mini")]
    default_model: String,

    /// Chat completion credential for the synchronous fallback path.
    #[arg(long, env = "OPENROUTER_API_KEY")]
    openrouter_api_key: Option<String>,

    /// Embedding model identifier, read through but not acted on here —
    /// the embedding pipeline is out of scope for this gateway.
    #[arg(long, env = "EMBEDDING_MODEL")]
    embedding_model: Option<String>,

    /// Upstream agent harness WebSocket host, for the Upstream Chat Bridge.
    #[arg(long, env = "AGENT_WS_HOST")]
    agent_ws_host: Option<String>,
    /// Upstream agent harness WebSocket port.
    #[arg(long, env = "AGENT_WS_PORT")]
    agent_ws_port: Option<u16>,
}

/// Configuration resolved once at boot and never mutated afterward, per
/// the Design Note on global mutable state.
struct RelayConfig {
    host: String,
    port: u16,
    vault_path: std::path::PathBuf,
    agenthq_api_key: Option<String>,
    default_model: String,
    openrouter_api_key: Option<String>,
    agent_ws: Option<(String, u16)>,
}

impl RelayConfig {
    fn from_cli(cli: Cli) -> Self {
        Self {
            host: cli.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: cli.port.unwrap_or(DEFAULT_PORT),
            vault_path: cli.vault_path.unwrap_or_else(|| std::path::PathBuf::from("./vault")),
            agenthq_api_key: cli.agenthq_api_key,
            default_model: cli.default_model,
            openrouter_api_key: cli.openrouter_api_key,
            agent_ws: cli.agent_ws_host.zip(cli.agent_ws_port),
        }
    }
}

fn init_telemetry(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry.with(fmt::layer().json().with_target(true).with_thread_ids(false)).init();
    } else {
        registry.with(fmt::layer().with_target(false).with_thread_ids(false).with_ansi(true)).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    let embedding_model = cli.embedding_model.clone();
    let config = RelayConfig::from_cli(cli);
    if let Some(model) = embedding_model {
        info!(model, "embedding model configured (embedding pipeline is out of scope for this process)");
    }

    info!(version = env!("CARGO_PKG_VERSION"), "relay-gatewayd starting");

    if config.agenthq_api_key.is_none() {
        warn!("AGENTHQ_API_KEY not set; gateway is running in open mode");
    }

    let vault = match VaultFacade::open(&config.vault_path) {
        Ok(v) => v,
        Err(e) => {
            error!(vault_path = %config.vault_path.display(), error = %e, "fatal: unable to open vault");
            std::process::exit(1);
        },
    };

    let auth = relay_gateway::auth::AuthManager::new(config.agenthq_api_key.clone());

    let (chat_bridge, bridge_events) = match config.agent_ws {
        Some((host, port)) => {
            info!(host, port, "connecting upstream chat bridge");
            let (bridge, events) = relay_chat::UpstreamChatBridge::connect(&host, port);
            (Some(bridge), Some(events))
        },
        None => {
            info!("no AGENT_WS_HOST/AGENT_WS_PORT configured; chat will use the fallback path only");
            (None, None)
        },
    };

    let chat_fallback = ChatFallbackConfig {
        endpoint: DEFAULT_OPENROUTER_ENDPOINT.to_string(),
        api_key: config.openrouter_api_key.clone(),
        model: config.default_model.clone(),
    };

    let state = Arc::new(GatewayState::new(vault, auth, chat_bridge, chat_fallback));
    relay_gateway::spawn_background_tasks(state.clone(), bridge_events);

    let app = relay_gateway::build_app(state);

    let addr: SocketAddr = match format!("{}:{}", config.host, config.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(host = config.host, port = config.port, error = %e, "fatal: invalid bind address");
            std::process::exit(1);
        },
    };

    let shutdown = async {
        let ctrl_c = async {
            tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
        };
        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
        info!("shutdown signal received, draining in-flight connections");
    };

    if let Err(e) = relay_gateway::serve(app, addr, shutdown).await {
        error!(error = %e, "fatal: gateway server error");
        std::process::exit(1);
    }

    info!("relay-gatewayd shut down cleanly");
    Ok(())
}
