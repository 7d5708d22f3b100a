//! Build execution for Buildcast.
//!
//! Runs a project's build command, turns its stdout and stderr into ordered
//! [`LogEvent`](buildcast_types::LogEvent)s published on `logs:<build id>`,
//! and hands the build output to an [`ArtifactStore`].
//!
//! Publishing never blocks the build: events go through an unbounded queue
//! drained by a single task, and broker failures are logged and dropped.

pub mod artifact;
pub mod config;
pub mod encoder;
pub mod error;
pub mod pipeline;
pub mod runner;

pub use artifact::{artifact_key, collect_artifacts, Artifact, ArtifactStore, FilesystemStore};
pub use config::{BuilderConfig, ConfigError, LoggingConfig};
pub use encoder::LogEncoder;
pub use error::BuildError;
pub use pipeline::{
    Build, BuildOutcome, BUILD_COMPLETE, BUILD_DONE, BUILD_FAILED, BUILD_STARTED,
    DEFAULT_BUILD_COMMAND, UPLOAD_FAILED, UPLOAD_STARTED,
};
pub use runner::{Completion, OutputStream, ProcessRunner, RunningProcess, CHUNK_SIZE};
