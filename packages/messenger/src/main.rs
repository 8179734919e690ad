use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{delete, get, patch, post},
};
use clap::{Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

use chat_hub::{Hub, HubConfig};

mod auth;
mod config;
mod db;
mod error;
mod handlers;
mod metrics;
mod models;
mod reconcile;
mod repository;
mod uploads;
mod ws;

#[cfg(test)]
mod test_helpers;

use crate::config::{FileConfig, MessagesConfig, MessengerConfig, WebSocketConfig};
use crate::db::Database;
use crate::metrics::ServerMetrics;
use crate::reconcile::ReadReconciler;
use crate::repository::ChatRepository;
use crate::uploads::UploadService;

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
#[command(name = "messenger")]
#[command(about = "Chat server with live delivery over WebSocket")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Custom data directory (defaults to ~/.messenger)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server in the foreground (the default)
    Server(ServerArgs),

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Parser, Default)]
struct ServerArgs {
    /// Port for the web server, overrides `[server] port`
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to, overrides `[server] host`
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone)]
#[allow(dead_code)]
pub(crate) struct AppState {
    pub config: Arc<MessengerConfig>,
    /// Limits served by `/config` and enforced on send
    pub messages_config: Arc<MessagesConfig>,
    pub ws_config: Arc<WebSocketConfig>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
    pub db: Arc<Database>,
    pub repository: Arc<ChatRepository>,
    /// Room registry and fan-out for live connections
    pub hub: Hub,
    pub reconciler: ReadReconciler,
    /// Presigning and confirmation of direct-to-storage uploads
    pub uploads: Arc<UploadService>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = MessengerConfig::new(cli.data_dir.clone())?;
    let file_config: FileConfig = config::load_config(&config.data_dir)
        .extract()
        .with_context(|| {
            format!(
                "Invalid configuration in {}",
                config.config_toml_path().display()
            )
        })?;

    match cli.command {
        Some(Commands::Config) => {
            let rendered =
                toml::to_string_pretty(&file_config).context("Failed to render configuration")?;
            print!("{rendered}");
            Ok(())
        }
        Some(Commands::Server(args)) => run_server(args, config, file_config).await,
        None => run_server(ServerArgs::default(), config, file_config).await,
    }
}

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        // Identity
        .route("/signin", post(handlers::signin))
        .route("/config", get(handlers::get_config))
        // Chats
        .route("/chats", get(handlers::list_chats).post(handlers::create_chat))
        .route("/chats/unread-count", get(handlers::total_unread_count))
        .route("/chats/delete", post(handlers::delete_chats))
        .route("/chats/{chat_id}", get(handlers::get_chat))
        // Messages
        .route(
            "/chats/{chat_id}/messages",
            get(handlers::get_messages).post(handlers::send_message),
        )
        .route("/chats/{chat_id}/messages/read", patch(handlers::mark_read))
        .route(
            "/chats/{chat_id}/messages/delete",
            post(handlers::delete_messages),
        )
        .route(
            "/chats/{chat_id}/messages/{message_id}",
            delete(handlers::delete_message),
        )
        // Uploads
        .route("/uploads/presign-upload", post(handlers::presign_upload))
        .route("/uploads/presign-download", post(handlers::presign_download))
        .route("/uploads/confirm", post(handlers::confirm_upload))
        // Live delivery
        .route("/ws", get(handlers::websocket_handler))
        // Health endpoints
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/health/ready", get(handlers::health_ready_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn run_server(args: ServerArgs, config: MessengerConfig, file_config: FileConfig) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "messenger=debug,chat_hub=debug,tower_http=debug,info"
    } else {
        "messenger=info,chat_hub=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting messenger");

    let config = Arc::new(config);

    // Initialize database
    info!("Initializing database...");
    let db = Arc::new(Database::new(&config, &file_config.database).await?);
    let repository = Arc::new(ChatRepository::new(db.pool.clone()));

    // Start the hub actor
    let hub = Hub::spawn(HubConfig::default());
    let reconciler = ReadReconciler::new(repository.clone(), hub.clone());

    let uploads = Arc::new(
        UploadService::new(&file_config.uploads, repository.clone())
            .context("Invalid [uploads] configuration")?,
    );
    info!(
        "Uploads: endpoint={}, bucket={}, ttl={}s",
        file_config.uploads.endpoint, file_config.uploads.bucket, file_config.uploads.presign_ttl_secs
    );

    let ws_config = Arc::new(WebSocketConfig::from_file(&file_config.websocket));
    info!(
        "WebSocket config: queue={}, write_timeout={:?}, ping={:?}, read_timeout={:?}",
        ws_config.send_queue_capacity,
        ws_config.pump.write_timeout,
        ws_config.pump.ping_interval,
        ws_config.read_timeout
    );

    let app_state = AppState {
        config: config.clone(),
        messages_config: Arc::new(file_config.messages.clone()),
        ws_config,
        metrics: Arc::new(ServerMetrics::new()),
        db: db.clone(),
        repository,
        hub,
        reconciler,
        uploads,
    };

    let app = build_router(app_state);

    let host = args.host.unwrap_or(file_config.server.host);
    let port = args.port.unwrap_or(file_config.server.port);
    let addr = format!("{}:{}", host, port)
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Messenger listening on http://{}", actual_addr);
    info!("  POST   /signin?user_id=N        - Identify as a user");
    info!("  GET    /chats                   - List chats");
    info!("  POST   /chats/:id/messages      - Send a message");
    info!("  POST   /uploads/presign-upload  - Get an upload URL");
    info!("  GET    /ws                      - Live events");

    // Create shutdown signal handler
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    // Run server with graceful shutdown
    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    db.pool.close().await;
    info!("Shutdown complete");
    server_result
}
