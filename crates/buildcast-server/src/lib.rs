//! Buildcast server library logic.
//!
//! Serves live build logs to WebSocket viewers and accepts build triggers.
//! Logs arrive through the shared [`Broker`]; the server never reads build
//! output directly.

pub mod api;
pub mod api_project;
pub mod api_ws;
pub mod config;
pub mod launcher;

use axum::{
    routing::{get, post},
    Extension, Router,
};
use buildcast_broker::Broker;
use buildcast_builder::FilesystemStore;
use config::{LauncherConfig, LauncherMode};
use launcher::{BuildLauncher, CommandLauncher, InProcessLauncher};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
pub struct AppState {
    /// Broker the viewers subscribe through.
    pub broker: Arc<dyn Broker>,
    /// Live viewer connections.
    pub connections: api_ws::ConnectionManager,
    /// Starts builds for `POST /project`.
    pub launcher: Arc<dyn BuildLauncher>,
    /// Domain under which build previews are served.
    pub preview_domain: String,
}

/// Builds the launcher selected by `config`.
///
/// `broker_url` is handed to spawned builders so they publish to the same
/// broker as the server.
pub fn build_launcher(
    config: &LauncherConfig,
    broker: Arc<dyn Broker>,
    broker_url: Option<&str>,
) -> Arc<dyn BuildLauncher> {
    match config.mode {
        LauncherMode::Command => {
            if broker_url.is_none() {
                tracing::warn!(
                    "command launcher without a broker URL; builder logs will not reach this server"
                );
            }
            Arc::new(CommandLauncher::new(
                &config.program,
                broker_url.map(str::to_string),
            ))
        }
        LauncherMode::InProcess => Arc::new(InProcessLauncher::new(
            broker,
            Arc::new(FilesystemStore::new(&config.artifact_root)),
            &config.workspace,
            config.build_command.clone(),
        )),
    }
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/project", post(api_project::create_project_handler))
        .route("/ws", get(api_ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
