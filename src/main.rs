//! # Parley Pairing Server
//!
//! Pairs anonymous participants for one-to-one text chat behind a
//! proof-of-work admission gate, with layered rate limiting and a
//! moderation pipeline protecting the pool.

mod admin;
mod ban_cache;
mod breaker;
mod config;
mod db;
mod gateway;
mod handlers;
mod matchmaking;
mod metrics;
mod models;
mod moderation;
mod rate_limit;
mod relay;
mod scorer;
mod session;
mod state;
mod validation;

use anyhow::Result;
use axum::{
    routing::{delete, get, post},
    Router,
};
use clap::Parser;
use config::Config;
use state::{AppState, SharedState};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server bind address
    #[arg(short = 'a', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Database file path
    #[arg(short = 'd', long, default_value = "parley.db")]
    database: String,

    /// Toxicity scorer endpoint (overrides PARLEY_SCORER_URL)
    #[arg(long)]
    scorer_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let mut config = Config::from_env();
    if args.scorer_url.is_some() {
        config.scorer_url = args.scorer_url.clone();
    }

    info!("Starting Parley Pairing Server");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Bind address: {}:{}", args.host, args.port);
    if config.scorer_url.is_none() {
        warn!("No toxicity scorer configured - external scoring disabled");
    }
    if config.admin_token.is_none() {
        warn!("No admin token configured - admin routes disabled");
    }

    info!("Initializing database: {}", args.database);
    let app_state = AppState::new(&args.database, config).await?;
    let state: SharedState = Arc::new(app_state);

    // Periodic violation flush
    let flush_state = state.clone();
    let flush_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(flush_state.config.violation_flush_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            flush_state.moderation.flush_pending(&flush_state.db).await;
        }
    });
    state.background_tasks.lock().await.push(flush_task);

    // Build the router with all endpoints
    let app = Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/stats", get(handlers::stats_handler))
        .route("/metrics", get(handlers::metrics_handler))
        // Admin endpoints
        .route("/admin/stats", get(admin::admin_stats_handler))
        .route(
            "/admin/rules",
            get(admin::list_rules_handler).post(admin::create_rule_handler),
        )
        .route("/admin/rules/:id", delete(admin::delete_rule_handler))
        .route(
            "/admin/whitelist",
            get(admin::list_whitelist_handler).post(admin::add_whitelist_handler),
        )
        .route(
            "/admin/ranges",
            get(admin::list_ranges_handler)
                .post(admin::add_range_handler)
                .delete(admin::remove_range_handler),
        )
        .route("/admin/bans/:identity", delete(admin::lift_ban_handler))
        // WebSocket endpoint
        .route("/ws", get(handlers::ws_handler))
        .with_state(state.clone())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_methods(Any)
                        .allow_headers(Any)
                        .allow_origin(Any),
                ),
        );

    let listener = tokio::net::TcpListener::bind(&format!("{}:{}", args.host, args.port)).await?;
    info!("Server successfully bound to {}:{}", args.host, args.port);

    let shutdown_state = state.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        // Hard deadline: the process exits even if teardown hangs.
        if tokio::time::timeout(
            shutdown_state.config.shutdown_deadline,
            shutdown_state.shutdown(),
        )
        .await
        .is_err()
        {
            warn!("shutdown deadline exceeded, exiting anyway");
        }
    })
    .await?;

    state.db.close().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
