//! Artifact handoff after a build.

use crate::error::BuildError;
use async_trait::async_trait;
use buildcast_types::BuildId;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Destination for build outputs, keyed by build identity.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Stores the file at `source` under `key`.
    async fn put(&self, key: &str, source: &Path) -> Result<(), BuildError>;
}

/// Stores artifacts as plain files below a root directory.
#[derive(Debug, Clone)]
pub struct FilesystemStore {
    root: PathBuf,
}

impl FilesystemStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ArtifactStore for FilesystemStore {
    async fn put(&self, key: &str, source: &Path) -> Result<(), BuildError> {
        let destination = self.root.join(key);
        let io_error = |source| BuildError::Artifact {
            key: key.to_string(),
            source,
        };
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        tokio::fs::copy(source, &destination).await.map_err(io_error)?;
        Ok(())
    }
}

/// A file found in the artifact directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Path relative to the artifact directory, `/`-separated.
    pub relative: String,
    pub path: PathBuf,
}

/// Lists every regular file below `dir`, in a stable order.
pub fn collect_artifacts(dir: &Path) -> Result<Vec<Artifact>, BuildError> {
    let mut artifacts = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .unwrap_or(entry.path())
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        artifacts.push(Artifact {
            relative,
            path: entry.into_path(),
        });
    }
    Ok(artifacts)
}

/// Storage key of an artifact: `__outputs/<build id>/<relative path>`.
pub fn artifact_key(build_id: &BuildId, relative: &str) -> String {
    format!("__outputs/{}/{}", build_id, relative)
}
