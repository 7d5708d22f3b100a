use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("failed to start build process in {dir:?}: {source}")]
    Spawn {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for build process: {0}")]
    Wait(#[source] std::io::Error),

    #[error("failed to store artifact {key}: {source}")]
    Artifact {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to walk artifact directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("build task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
