//! Buildcast server binary.
//!
//! Starts an axum HTTP server with structured logging, the shared broker,
//! and graceful shutdown on SIGTERM/SIGINT.

use buildcast_server::{api_ws::ConnectionManager, app, build_launcher, config, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("BUILDCAST_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration; the server cannot start without valid config");

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    let broker_url = config.broker.url.as_deref();
    let broker = buildcast_broker::connect(broker_url)
        .await
        .expect("failed to connect to broker; check broker.url in config");
    tracing::info!(
        backend = if broker_url.is_some() { "redis" } else { "memory" },
        "broker ready"
    );

    let launcher = build_launcher(&config.launcher, Arc::clone(&broker), broker_url);
    tracing::info!(mode = ?config.launcher.mode, "build launcher ready");

    let state = AppState {
        broker: Arc::clone(&broker),
        connections: ConnectionManager::new(),
        launcher: Arc::clone(&launcher),
        preview_domain: config.server.preview_domain.clone(),
    };

    let app = app(state);
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, "starting buildcast server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address; is another process using this port?");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(Arc::clone(&broker)))
    .await
    .expect("server error");

    launcher.shutdown().await;
    tracing::info!("buildcast server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal, then shuts the broker
/// down so open viewer sessions end and the server can drain.
async fn shutdown_signal(broker: Arc<dyn buildcast_broker::Broker>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }

    broker.shutdown().await;
}
