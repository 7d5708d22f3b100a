//! Shared types for the buildcast log-streaming pipeline.
//!
//! This crate holds the vocabulary every other crate speaks: build
//! identities, the channel naming convention, the [`LogEvent`] record
//! produced on the build side, and the JSON payload that travels over the
//! broker. It has no runtime dependencies so both the builder and the
//! server can depend on it without pulling in each other's stacks.

use serde::{Deserialize, Serialize};
use std::fmt;

mod glob;

pub use glob::pattern_matches;

/// Namespace prepended to every build identity to form its channel name.
pub const CHANNEL_PREFIX: &str = "logs:";

/// Pattern matching every build channel.
pub const ALL_BUILDS_PATTERN: &str = "logs:*";

/// Longest accepted build identity, in bytes.
pub const MAX_BUILD_ID_LEN: usize = 64;

/// Errors raised when constructing shared types from untrusted input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TypesError {
    /// The build identity is empty, too long, or contains anything other
    /// than ASCII letters, digits, `-` and `_`.
    #[error("invalid build id: {0:?}")]
    InvalidBuildId(String),
}

/// Opaque identifier of a single build run.
///
/// Used to derive the channel name (`logs:<id>`), checkout directories,
/// artifact storage keys and preview host names. Only ASCII letters, digits,
/// `-` and `_` are accepted, up to [`MAX_BUILD_ID_LEN`] bytes, so an id is
/// always a single path segment and never doubles as a glob pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct BuildId(String);

impl BuildId {
    /// Validates and wraps a build identity.
    pub fn new(id: impl Into<String>) -> Result<Self, TypesError> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= MAX_BUILD_ID_LEN
            && id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if valid {
            Ok(Self(id))
        } else {
            Err(TypesError::InvalidBuildId(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the broker channel carrying this build's log events.
    pub fn channel(&self) -> String {
        format!("{}{}", CHANNEL_PREFIX, self.0)
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for BuildId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for BuildId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        BuildId::new(raw).map_err(serde::de::Error::custom)
    }
}

/// Origin of a chunk of build output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// The build process's standard output.
    Stdout,
    /// The build process's standard error.
    Stderr,
    /// Lifecycle messages emitted by the pipeline itself.
    System,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::System => "system",
        }
    }
}

/// One structured, ordered unit of build output.
///
/// `sequence` orders events within a single build only; there is no global
/// order across builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub build_id: BuildId,
    pub stream: StreamKind,
    pub text: Vec<u8>,
    pub sequence: u64,
}

impl LogEvent {
    /// Renders the event as the text viewers see.
    ///
    /// Output is decoded lossily since a chunk boundary may split a
    /// multi-byte character. Stderr output carries an `error: ` prefix.
    pub fn render(&self) -> String {
        let text = String::from_utf8_lossy(&self.text);
        match self.stream {
            StreamKind::Stderr => format!("error: {}", text),
            StreamKind::Stdout | StreamKind::System => text.into_owned(),
        }
    }

    /// Encodes the event into the JSON payload published on the broker.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&LogPayload { log: self.render() })
    }
}

/// Payload published on a build channel: `{"log": "<text>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPayload {
    pub log: String,
}

impl LogPayload {
    /// Parses a raw broker payload, returning `None` if it is not a log
    /// payload.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(stream: StreamKind, text: &[u8]) -> LogEvent {
        LogEvent {
            build_id: BuildId::new("abc123").unwrap(),
            stream,
            text: text.to_vec(),
            sequence: 0,
        }
    }

    #[test]
    fn build_id_channel_uses_prefix() {
        let id = BuildId::new("abc123").unwrap();
        assert_eq!(id.channel(), "logs:abc123");
        assert!(pattern_matches(ALL_BUILDS_PATTERN, &id.channel()));
    }

    #[test]
    fn build_id_rejects_empty_and_glob_characters() {
        for bad in ["", "a b", "abc*", "a?", "[x]", "back\\slash", "tab\there"] {
            assert_eq!(
                BuildId::new(bad),
                Err(TypesError::InvalidBuildId(bad.to_string())),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn build_id_rejects_path_components() {
        let overlong = "a".repeat(MAX_BUILD_ID_LEN + 1);
        for bad in ["..", ".", "/abs", "a/b", "a\\b", "site.example", "é", overlong.as_str()] {
            assert_eq!(
                BuildId::new(bad),
                Err(TypesError::InvalidBuildId(bad.to_string())),
                "{bad:?} should be rejected"
            );
        }
        assert!(BuildId::new("a".repeat(MAX_BUILD_ID_LEN)).is_ok());
        assert!(BuildId::new("My_site-2").is_ok());
    }

    #[test]
    fn build_id_deserialize_validates() {
        let ok: BuildId = serde_json::from_str("\"my-site\"").unwrap();
        assert_eq!(ok.as_str(), "my-site");
        assert!(serde_json::from_str::<BuildId>("\"bad id\"").is_err());
    }

    #[test]
    fn stderr_events_are_prefixed() {
        assert_eq!(event(StreamKind::Stdout, b"Installing...\n").render(), "Installing...\n");
        assert_eq!(
            event(StreamKind::Stderr, b"warning: x\n").render(),
            "error: warning: x\n"
        );
        assert_eq!(event(StreamKind::System, b"Build Complete").render(), "Build Complete");
    }

    #[test]
    fn encode_escapes_text() {
        let encoded = event(StreamKind::Stdout, b"say \"hi\"\n").encode().unwrap();
        assert_eq!(encoded, r#"{"log":"say \"hi\"\n"}"#);
        let decoded = LogPayload::parse(&encoded).unwrap();
        assert_eq!(decoded.log, "say \"hi\"\n");
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let rendered = event(StreamKind::Stdout, &[0x66, 0x6f, 0xff]).render();
        assert_eq!(rendered, "fo\u{fffd}");
    }

    #[test]
    fn parse_rejects_non_log_payloads() {
        assert!(LogPayload::parse("not json").is_none());
        assert!(LogPayload::parse(r#"{"other":"x"}"#).is_none());
    }
}
