//! One build from start to artifact handoff.

use crate::artifact::{artifact_key, collect_artifacts, ArtifactStore};
use crate::encoder::LogEncoder;
use crate::error::BuildError;
use crate::runner::{OutputStream, ProcessRunner};
use buildcast_broker::Broker;
use buildcast_types::{BuildId, StreamKind};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use tokio::io::AsyncRead;

pub const BUILD_STARTED: &str = "Build Started...";
pub const BUILD_COMPLETE: &str = "Build Complete";
pub const BUILD_FAILED: &str = "Build Failed";
pub const UPLOAD_STARTED: &str = "Starting to upload";
pub const UPLOAD_FAILED: &str = "Upload Failed";
pub const BUILD_DONE: &str = "Done";

pub const DEFAULT_BUILD_COMMAND: &str = "npm install && npm run build";

/// Result of a build that ran to completion.
#[derive(Debug, Clone, Copy)]
pub struct BuildOutcome {
    pub status: ExitStatus,
    /// Log events accepted by the broker.
    pub published: usize,
    /// Artifacts handed to the store.
    pub uploaded: usize,
}

impl BuildOutcome {
    pub fn succeeded(&self) -> bool {
        self.status.success()
    }
}

/// A build of one project checkout.
///
/// Runs the build command, streams its output to `logs:<build id>`, and
/// hands the contents of the dist directory to an [`ArtifactStore`].
pub struct Build {
    id: BuildId,
    working_dir: PathBuf,
    command: String,
    dist_dir: PathBuf,
    runner: ProcessRunner,
    broker: Arc<dyn Broker>,
    store: Arc<dyn ArtifactStore>,
}

impl Build {
    /// Creates a build with the default command and `<working_dir>/dist` as
    /// the artifact directory.
    pub fn new(
        id: BuildId,
        working_dir: impl AsRef<Path>,
        broker: Arc<dyn Broker>,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        let working_dir = working_dir.as_ref().to_path_buf();
        Self {
            id,
            dist_dir: working_dir.join("dist"),
            working_dir,
            command: DEFAULT_BUILD_COMMAND.to_string(),
            runner: ProcessRunner::default(),
            broker,
            store,
        }
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn dist_dir(mut self, dist_dir: impl AsRef<Path>) -> Self {
        self.dist_dir = dist_dir.as_ref().to_path_buf();
        self
    }

    pub fn runner(mut self, runner: ProcessRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn id(&self) -> &BuildId {
        &self.id
    }

    /// Runs the build.
    ///
    /// A non-zero exit status is not an error: it is reported through
    /// [`BuildOutcome::status`] and a `Build Failed` event, and artifacts are
    /// still uploaded.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Spawn`] or [`BuildError::Wait`] if the process
    /// could not be run, and [`BuildError::Artifact`] if an upload failed.
    /// All queued log events are published before the error is returned.
    pub async fn run(&self) -> Result<BuildOutcome, BuildError> {
        let encoder = LogEncoder::spawn(self.id.clone(), Arc::clone(&self.broker));
        tracing::info!(build_id = %self.id, command = %self.command, "build started");
        encoder.system(BUILD_STARTED);

        let status = match self.execute(&encoder).await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(build_id = %self.id, "{}", e);
                encoder.system(BUILD_FAILED);
                encoder.finish().await;
                return Err(e);
            }
        };

        if status.success() {
            tracing::info!(build_id = %self.id, "build complete");
            encoder.system(BUILD_COMPLETE);
        } else {
            tracing::warn!(build_id = %self.id, code = ?status.code(), "build failed");
            encoder.system(BUILD_FAILED);
        }

        let uploaded = match self.upload_artifacts(&encoder).await {
            Ok(uploaded) => uploaded,
            Err(e) => {
                tracing::error!(build_id = %self.id, "artifact upload failed: {}", e);
                encoder.system(UPLOAD_FAILED);
                encoder.finish().await;
                return Err(e);
            }
        };

        encoder.system(BUILD_DONE);
        let published = encoder.finish().await;
        tracing::info!(build_id = %self.id, published, uploaded, "build done");

        Ok(BuildOutcome {
            status,
            published,
            uploaded,
        })
    }

    async fn execute(&self, encoder: &LogEncoder) -> Result<ExitStatus, BuildError> {
        let (stdout, stderr, completion) = self
            .runner
            .spawn(&self.working_dir, &self.command)?
            .into_parts();
        tracing::info!(
            build_id = %self.id,
            pid = completion.id(),
            command = %self.command,
            "build command started"
        );

        let stdout = tokio::spawn(pump(stdout, encoder.clone()));
        let stderr = tokio::spawn(pump(stderr, encoder.clone()));

        let status = match completion.wait().await {
            Ok(status) => status,
            Err(e) => {
                stdout.abort();
                stderr.abort();
                return Err(e);
            }
        };

        // Output can still be in the pipes after the process exits.
        let (out, err) = tokio::join!(stdout, stderr);
        out?;
        err?;
        Ok(status)
    }

    async fn upload_artifacts(&self, encoder: &LogEncoder) -> Result<usize, BuildError> {
        encoder.system(UPLOAD_STARTED);

        let is_dir = tokio::fs::metadata(&self.dist_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            tracing::warn!(build_id = %self.id, dir = %self.dist_dir.display(), "no build output found");
            encoder.system(format!(
                "No build output found at {}",
                self.dist_dir.display()
            ));
            return Ok(0);
        }

        let dir = self.dist_dir.clone();
        let artifacts = tokio::task::spawn_blocking(move || collect_artifacts(&dir)).await??;

        for artifact in &artifacts {
            encoder.system(format!("uploading {}", artifact.relative));
            let key = artifact_key(&self.id, &artifact.relative);
            self.store.put(&key, &artifact.path).await?;
            tracing::debug!(build_id = %self.id, key = %key, "artifact stored");
            encoder.system(format!("uploaded {}", artifact.relative));
        }

        Ok(artifacts.len())
    }
}

/// Forwards one output stream into the encoder, mirroring it locally.
async fn pump<R: AsyncRead + Unpin>(mut stream: OutputStream<R>, encoder: LogEncoder) {
    let kind = stream.kind();
    while let Some(chunk) = stream.next_chunk().await {
        match kind {
            StreamKind::Stderr => {
                tracing::warn!(build_id = %encoder.build_id(), "{}", String::from_utf8_lossy(&chunk))
            }
            _ => tracing::info!(build_id = %encoder.build_id(), "{}", String::from_utf8_lossy(&chunk)),
        }
        encoder.emit(kind, chunk);
    }
}
