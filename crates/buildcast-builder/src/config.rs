//! Builder configuration from the process environment.

use crate::pipeline::DEFAULT_BUILD_COMMAND;
use buildcast_types::BuildId;
use std::path::PathBuf;
use thiserror::Error;

/// Settings for one builder run.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    pub build_id: BuildId,
    /// Redis URL; `None` uses an in-process broker.
    pub broker_url: Option<String>,
    pub working_dir: PathBuf,
    pub command: String,
    pub dist_dir: PathBuf,
    pub artifact_root: PathBuf,
    pub logging: LoggingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "buildcast_builder=debug,info").
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("invalid PROJECT_ID: {0}")]
    InvalidBuildId(#[from] buildcast_types::TypesError),
}

impl BuilderConfig {
    /// Reads the configuration from environment variables.
    ///
    /// - `PROJECT_ID` (required) is the build identity
    /// - `BUILDCAST_BROKER_URL`, then `REDIS_URL`, selects the broker
    /// - `BUILDCAST_WORKDIR` (default `output`) is where the command runs
    /// - `BUILDCAST_BUILD_COMMAND` overrides the build command
    /// - `BUILDCAST_DIST_DIR` (default `<workdir>/dist`) holds the artifacts
    /// - `BUILDCAST_ARTIFACT_ROOT` (default `artifacts`) is the store root
    /// - `BUILDCAST_LOG_LEVEL` and `BUILDCAST_LOG_JSON` control logging
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `PROJECT_ID` is missing or not a valid id.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`BuilderConfig::from_env`], reading variables through `lookup`.
    /// Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let build_id = BuildId::new(var("PROJECT_ID").ok_or(ConfigError::Missing("PROJECT_ID"))?)?;
        let working_dir = PathBuf::from(var("BUILDCAST_WORKDIR").unwrap_or_else(|| "output".into()));
        let dist_dir = var("BUILDCAST_DIST_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| working_dir.join("dist"));

        let mut logging = LoggingConfig::default();
        if let Some(level) = var("BUILDCAST_LOG_LEVEL") {
            logging.level = level;
        }
        if let Some(json) = var("BUILDCAST_LOG_JSON") {
            logging.json = json == "true" || json == "1";
        }

        Ok(Self {
            build_id,
            broker_url: var("BUILDCAST_BROKER_URL").or_else(|| var("REDIS_URL")),
            command: var("BUILDCAST_BUILD_COMMAND")
                .unwrap_or_else(|| DEFAULT_BUILD_COMMAND.to_string()),
            artifact_root: PathBuf::from(
                var("BUILDCAST_ARTIFACT_ROOT").unwrap_or_else(|| "artifacts".into()),
            ),
            working_dir,
            dist_dir,
            logging,
        })
    }
}
