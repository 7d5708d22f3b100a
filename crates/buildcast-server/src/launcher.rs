//! Starting builds for triggered projects.

use async_trait::async_trait;
use buildcast_broker::Broker;
use buildcast_builder::{ArtifactStore, Build, LogEncoder, BUILD_FAILED};
use buildcast_types::BuildId;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::process::Command;
use tokio::task::JoinSet;

/// A build to start.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub git_url: String,
    pub build_id: BuildId,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("build {0} is already running")]
    AlreadyRunning(BuildId),

    #[error("failed to start builder: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to prepare workspace {path:?}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Starts builds in the background.
#[async_trait]
pub trait BuildLauncher: Send + Sync {
    /// Starts the build and returns once it is under way. The build itself
    /// reports progress on its log channel.
    ///
    /// Fails with [`LaunchError::AlreadyRunning`] while an earlier build with
    /// the same id is still in flight.
    async fn launch(&self, request: LaunchRequest) -> Result<(), LaunchError>;

    /// Stops supervising running builds.
    async fn shutdown(&self) {}
}

/// Background tasks owned by a launcher, plus the ids they are building.
#[derive(Default)]
struct Supervisor {
    tasks: Mutex<JoinSet<()>>,
    active: Arc<Mutex<HashSet<BuildId>>>,
}

/// Marks a build id as in flight until dropped.
struct ActiveBuild {
    active: Arc<Mutex<HashSet<BuildId>>>,
    build_id: BuildId,
}

impl Drop for ActiveBuild {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.build_id);
    }
}

impl Supervisor {
    /// Claims `build_id`, failing if a build with that id is still running.
    fn reserve(&self, build_id: &BuildId) -> Result<ActiveBuild, LaunchError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(build_id.clone()) {
            return Err(LaunchError::AlreadyRunning(build_id.clone()));
        }
        Ok(ActiveBuild {
            active: Arc::clone(&self.active),
            build_id: build_id.clone(),
        })
    }

    /// Runs `task` in the background, holding `guard` until it ends or is
    /// aborted.
    fn spawn<F>(&self, guard: ActiveBuild, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                tracing::warn!("build task failed: {}", e);
            }
        }
        tasks.spawn(async move {
            let _guard = guard;
            task.await;
        });
    }

    async fn shutdown(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        tasks.shutdown().await;
    }

    fn running(&self) -> usize {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Runs each build as a separate builder process.
///
/// The child gets `GIT_REPOSITORY__URL` and `PROJECT_ID`, plus
/// `BUILDCAST_BROKER_URL` when a shared broker is configured, and is reaped
/// in the background.
pub struct CommandLauncher {
    program: PathBuf,
    broker_url: Option<String>,
    supervisor: Supervisor,
}

impl CommandLauncher {
    pub fn new(program: impl AsRef<Path>, broker_url: Option<String>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            broker_url,
            supervisor: Supervisor::default(),
        }
    }
}

#[async_trait]
impl BuildLauncher for CommandLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<(), LaunchError> {
        let mut command = Command::new(&self.program);
        command
            .env("GIT_REPOSITORY__URL", &request.git_url)
            .env("PROJECT_ID", request.build_id.as_str())
            .stdin(Stdio::null());
        if let Some(url) = &self.broker_url {
            command.env("BUILDCAST_BROKER_URL", url);
        }

        let guard = self.supervisor.reserve(&request.build_id)?;
        let mut child = command.spawn().map_err(LaunchError::Spawn)?;
        let build_id = request.build_id;
        tracing::info!(build_id = %build_id, pid = child.id(), "builder started");

        self.supervisor.spawn(guard, async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    tracing::info!(build_id = %build_id, "builder exited");
                }
                Ok(status) => {
                    tracing::warn!(build_id = %build_id, code = ?status.code(), "builder failed");
                }
                Err(e) => tracing::error!(build_id = %build_id, "failed to wait for builder: {}", e),
            }
        });
        Ok(())
    }

    async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }
}

/// Clones the repository and runs the build inside the server process,
/// against the server's own broker.
pub struct InProcessLauncher {
    broker: Arc<dyn Broker>,
    store: Arc<dyn ArtifactStore>,
    workspace: PathBuf,
    command: String,
    git: PathBuf,
    supervisor: Supervisor,
}

impl InProcessLauncher {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn ArtifactStore>,
        workspace: impl AsRef<Path>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            store,
            workspace: workspace.as_ref().to_path_buf(),
            command: command.into(),
            git: PathBuf::from("git"),
            supervisor: Supervisor::default(),
        }
    }

    /// Overrides the `git` executable used for checkouts.
    pub fn git_program(mut self, git: impl AsRef<Path>) -> Self {
        self.git = git.as_ref().to_path_buf();
        self
    }

    /// Number of builds not yet reaped.
    pub fn running(&self) -> usize {
        self.supervisor.running()
    }
}

#[async_trait]
impl BuildLauncher for InProcessLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<(), LaunchError> {
        let guard = self.supervisor.reserve(&request.build_id)?;
        tokio::fs::create_dir_all(&self.workspace)
            .await
            .map_err(|source| LaunchError::Workspace {
                path: self.workspace.clone(),
                source,
            })?;

        let checkout = self.workspace.join(request.build_id.as_str());
        let build = Build::new(
            request.build_id.clone(),
            &checkout,
            Arc::clone(&self.broker),
            Arc::clone(&self.store),
        )
        .command(self.command.clone());
        let broker = Arc::clone(&self.broker);
        let git = self.git.clone();

        self.supervisor.spawn(guard, async move {
            if let Err(message) = clone_repository(&git, &request.git_url, &checkout).await {
                tracing::error!(build_id = %request.build_id, "{}", message);
                let encoder = LogEncoder::spawn(request.build_id, broker);
                encoder.system(message);
                encoder.system(BUILD_FAILED);
                encoder.finish().await;
                return;
            }
            match build.run().await {
                Ok(outcome) => tracing::info!(
                    build_id = %build.id(),
                    success = outcome.succeeded(),
                    uploaded = outcome.uploaded,
                    "build finished"
                ),
                Err(e) => tracing::error!(build_id = %build.id(), "build aborted: {}", e),
            }
        });
        Ok(())
    }

    async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }
}

/// Shallow-clones `url` into `dir`, replacing a checkout left by an earlier
/// build with the same id.
async fn clone_repository(git: &Path, url: &str, dir: &Path) -> Result<(), String> {
    if tokio::fs::metadata(dir).await.is_ok() {
        tokio::fs::remove_dir_all(dir)
            .await
            .map_err(|e| format!("failed to clear {}: {}", dir.display(), e))?;
    }

    let output = Command::new(git)
        .args(["clone", "--depth", "1", "--", url])
        .arg(dir)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| format!("failed to run git: {}", e))?;

    if output.status.success() {
        Ok(())
    } else {
        Err(format!(
            "git clone failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}
