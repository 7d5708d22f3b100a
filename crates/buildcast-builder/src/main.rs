//! Buildcast builder binary: runs one build and streams its logs.
//!
//! Configured entirely from the environment (see
//! [`BuilderConfig::from_env`]). Exits non-zero if the build fails.

use buildcast_builder::{Build, BuilderConfig, FilesystemStore};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match BuilderConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("buildcast-builder: {e}");
            return ExitCode::FAILURE;
        }
    };

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

    let broker = match buildcast_broker::connect(config.broker_url.as_deref()).await {
        Ok(broker) => broker,
        Err(e) => {
            tracing::error!("failed to connect to broker: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let store = Arc::new(FilesystemStore::new(&config.artifact_root));
    let build = Build::new(
        config.build_id.clone(),
        &config.working_dir,
        Arc::clone(&broker),
        store,
    )
    .command(config.command.clone())
    .dist_dir(&config.dist_dir);

    let result = build.run().await;
    broker.shutdown().await;

    match result {
        Ok(outcome) if outcome.succeeded() => ExitCode::SUCCESS,
        Ok(outcome) => {
            tracing::error!(code = ?outcome.status.code(), "build exited unsuccessfully");
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!("build failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
