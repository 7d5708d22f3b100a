//! Server configuration loading from file and environment variables.

use buildcast_builder::DEFAULT_BUILD_COMMAND;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Message broker settings.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// How triggered builds are run.
    #[serde(default)]
    pub launcher: LauncherConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Domain under which build previews are served, as
    /// `http://<slug>.<preview_domain>`.
    #[serde(default = "default_preview_domain")]
    pub preview_domain: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerConfig {
    /// Redis URL. Unset means an in-process broker.
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LauncherMode {
    /// Clone and build inside the server process.
    #[default]
    InProcess,
    /// Spawn a `buildcast-builder` process per build.
    Command,
}

impl FromStr for LauncherMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in-process" => Ok(LauncherMode::InProcess),
            "command" => Ok(LauncherMode::Command),
            other => Err(format!("unknown launcher mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LauncherConfig {
    #[serde(default)]
    pub mode: LauncherMode,

    /// Builder executable for `command` mode.
    #[serde(default = "default_program")]
    pub program: PathBuf,

    /// Checkout directory for `in-process` mode.
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,

    #[serde(default = "default_build_command")]
    pub build_command: String,

    /// Artifact store root for `in-process` mode.
    #[serde(default = "default_artifact_root")]
    pub artifact_root: PathBuf,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "buildcast_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    9000
}

fn default_preview_domain() -> String {
    "localhost:8000".to_string()
}

fn default_program() -> PathBuf {
    PathBuf::from("buildcast-builder")
}

fn default_workspace() -> PathBuf {
    PathBuf::from("builds")
}

fn default_build_command() -> String {
    DEFAULT_BUILD_COMMAND.to_string()
}

fn default_artifact_root() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            preview_domain: default_preview_domain(),
        }
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            mode: LauncherMode::default(),
            program: default_program(),
            workspace: default_workspace(),
            build_command: default_build_command(),
            artifact_root: default_artifact_root(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `BUILDCAST_HOST` overrides `server.host`
/// - `BUILDCAST_PORT` (or `PORT`) overrides `server.port`
/// - `BUILDCAST_PREVIEW_DOMAIN` overrides `server.preview_domain`
/// - `BUILDCAST_BROKER_URL` (or `REDIS_URL`) overrides `broker.url`
/// - `BUILDCAST_LAUNCHER` overrides `launcher.mode`
/// - `BUILDCAST_BUILDER_PROGRAM` overrides `launcher.program`
/// - `BUILDCAST_WORKSPACE` overrides `launcher.workspace`
/// - `BUILDCAST_BUILD_COMMAND` overrides `launcher.build_command`
/// - `BUILDCAST_ARTIFACT_ROOT` overrides `launcher.artifact_root`
/// - `BUILDCAST_LOG_LEVEL` overrides `logging.level`
/// - `BUILDCAST_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    load_config_with(path, |key| std::env::var(key).ok())
}

/// Like [`load_config`], reading environment variables through `env`.
pub fn load_config_with<F>(path: Option<&str>, env: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    let var = |key: &str| env(key).filter(|v| !v.trim().is_empty());

    if let Some(host) = var("BUILDCAST_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = var("BUILDCAST_PORT").or_else(|| var("PORT")) {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(domain) = var("BUILDCAST_PREVIEW_DOMAIN") {
        config.server.preview_domain = domain;
    }
    if let Some(url) = var("BUILDCAST_BROKER_URL").or_else(|| var("REDIS_URL")) {
        config.broker.url = Some(url);
    }
    if let Some(mode) = var("BUILDCAST_LAUNCHER") {
        match mode.parse() {
            Ok(parsed) => config.launcher.mode = parsed,
            Err(e) => tracing::warn!("ignoring BUILDCAST_LAUNCHER: {}", e),
        }
    }
    if let Some(program) = var("BUILDCAST_BUILDER_PROGRAM") {
        config.launcher.program = PathBuf::from(program);
    }
    if let Some(workspace) = var("BUILDCAST_WORKSPACE") {
        config.launcher.workspace = PathBuf::from(workspace);
    }
    if let Some(command) = var("BUILDCAST_BUILD_COMMAND") {
        config.launcher.build_command = command;
    }
    if let Some(root) = var("BUILDCAST_ARTIFACT_ROOT") {
        config.launcher.artifact_root = PathBuf::from(root);
    }
    if let Some(level) = var("BUILDCAST_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("BUILDCAST_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_file() {
        let config = load_config_with(None, env(&[])).unwrap();
        assert_eq!(config.server.host, default_host());
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.preview_domain, "localhost:8000");
        assert_eq!(config.broker.url, None);
        assert_eq!(config.launcher.mode, LauncherMode::InProcess);
        assert_eq!(config.launcher.program, PathBuf::from("buildcast-builder"));
        assert_eq!(config.launcher.build_command, DEFAULT_BUILD_COMMAND);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = load_config_with(Some("/no/such/config.toml"), env(&[])).unwrap();
        assert_eq!(config.server.port, 9000);
    }

    #[test]
    fn reads_file_and_applies_env_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[server]
port = 7000
preview_domain = "preview.example.com"

[launcher]
mode = "command"
program = "/usr/local/bin/buildcast-builder"

[logging]
level = "debug"
"#,
        )
        .unwrap();

        let config = load_config_with(
            path.to_str(),
            env(&[("PORT", "7100"), ("REDIS_URL", "redis://localhost:6379")]),
        )
        .unwrap();

        assert_eq!(config.server.port, 7100);
        assert_eq!(config.server.preview_domain, "preview.example.com");
        assert_eq!(config.launcher.mode, LauncherMode::Command);
        assert_eq!(config.broker.url.as_deref(), Some("redis://localhost:6379"));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn buildcast_port_wins_over_port() {
        let config =
            load_config_with(None, env(&[("PORT", "1"), ("BUILDCAST_PORT", "2")])).unwrap();
        assert_eq!(config.server.port, 2);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();
        assert!(matches!(
            load_config_with(path.to_str(), env(&[])),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn unknown_launcher_mode_is_ignored() {
        let config = load_config_with(None, env(&[("BUILDCAST_LAUNCHER", "docker")])).unwrap();
        assert_eq!(config.launcher.mode, LauncherMode::InProcess);
    }
}
