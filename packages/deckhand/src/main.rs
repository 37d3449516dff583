use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, post},
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::{net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use uuid::Uuid;

mod clusters;
mod config;
mod drain;
mod error;
mod handlers;
mod metrics;
#[cfg(test)]
mod test_helpers;
mod ws;

use live_relay::log_stream::LogStreamController;
use live_relay::release::ReleaseChangeBridge;
use live_relay::resource_watch::ResourceWatchBridge;
use live_relay::{ClusterApi, HubHandle, WatcherRegistry, hub};

use crate::clusters::KubeClusters;
use crate::config::{DeckhandConfig, FileConfig, RelaySettings};
use crate::metrics::ServerMetrics;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "deckhand")]
#[command(about = "Live event relay for a multi-cluster Kubernetes dashboard")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (defaults to ./deckhand.toml, then ~/.config/deckhand/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server in the foreground (the default)
    Serve(ServeArgs),

    /// Print the default configuration as TOML
    Config,
}

#[derive(Parser, Default)]
struct ServeArgs {
    /// Port for the web server
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub api: Arc<dyn ClusterApi>,
    pub hub: HubHandle,
    /// Resource watches and log tails
    pub registry: WatcherRegistry,
    pub watches: ResourceWatchBridge,
    pub logs: LogStreamController,
    pub releases: ReleaseChangeBridge,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
}

impl AppState {
    pub fn new(api: Arc<dyn ClusterApi>, hub: HubHandle, relay: &RelaySettings) -> Self {
        let registry = WatcherRegistry::new();
        Self {
            watches: ResourceWatchBridge::new(
                api.clone(),
                hub.clone(),
                registry.clone(),
                relay.api_request_timeout,
            ),
            logs: LogStreamController::new(api.clone(), hub.clone(), registry.clone(), relay.logs),
            releases: ReleaseChangeBridge::new(api.clone(), hub.clone(), relay.api_request_timeout),
            metrics: Arc::new(ServerMetrics::new()),
            registry,
            api,
            hub,
        }
    }

    /// Stop every watcher, log tail and release cache.
    pub async fn stop_listeners(&self) {
        let watchers = self.registry.stop_all().await;
        let caches = self.releases.shutdown().await;
        info!(watchers, caches, "listeners stopped");
    }
}

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/ping", get(handlers::ping_handler))
        .route("/api/lookup_configs", get(handlers::lookup_configs))
        .route("/api/watch_dynamic_resource", post(handlers::watch_dynamic_resource))
        .route(
            "/api/watch_events_dynamic_resource",
            post(handlers::watch_events_dynamic_resource),
        )
        .route("/api/stream_pod_logs", post(handlers::stream_pod_logs))
        .route("/api/stop_pod_log_stream", post(handlers::stop_pod_log_stream))
        .route("/api/get_pod_logs", post(handlers::get_pod_logs))
        .route("/api/helm_releases", post(handlers::list_helm_releases))
        .route("/api/helm_release", post(handlers::get_helm_release))
        .route("/api/drain_node", post(handlers::drain_node))
        .route("/api/ws", get(handlers::websocket_handler))
        .route("/healthz", get(handlers::health_live_handler))
        .route("/readyz", get(handlers::health_ready_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve(ServeArgs::default())) {
        Commands::Config => {
            let template = toml::to_string_pretty(&FileConfig::template())
                .context("Failed to render configuration")?;
            print!("{template}");
            Ok(())
        }
        Commands::Serve(args) => run_server(cli.config, args).await,
    }
}

fn init_tracing(config: &DeckhandConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_directive()));
    let registry = tracing_subscriber::registry().with(env_filter);
    if config.log.json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn run_server(config_path: Option<PathBuf>, args: ServeArgs) -> Result<()> {
    let path = config::resolve_config_path(config_path.as_deref())?;
    let mut file_config: FileConfig = config::load_config(path.as_deref())
        .extract()
        .context("Failed to load configuration")?;

    if let Some(host) = args.host {
        file_config.server.host = host;
    }
    if let Some(port) = args.port {
        file_config.server.port = port;
    }
    if args.debug {
        file_config.log.level = "debug".to_string();
    }

    let kubeconfig_env = std::env::var_os("KUBECONFIG");
    let config = DeckhandConfig::from_file(file_config, kubeconfig_env.as_deref())?;
    init_tracing(&config);
    match &path {
        Some(path) => info!(path = %path.display(), "Loaded configuration"),
        None => info!("No config file found, using defaults"),
    }

    let clusters = KubeClusters::connect(&config.clusters)
        .await
        .context("Failed to connect to clusters")?;

    let shutdown = CancellationToken::new();
    let (hub, hub_task) = hub::spawn(config.relay.hub, shutdown.clone());
    let state = AppState::new(Arc::new(clusters), hub, &config.relay);
    let app = router(state.clone());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(%addr, clusters = ?state.api.clusters(), "Server listening");

    // Websocket connections only end once the hub drops their queues, so the
    // hub goes down as part of the signal rather than after serve returns.
    let graceful = {
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!("Shutting down...");
            state.stop_listeners().await;
            shutdown.cancel();
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(graceful)
        .await
        .context("Server error")?;

    if let Err(e) = hub_task.await {
        warn!(error = %e, "Broadcast hub ended abnormally");
    }
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
}
