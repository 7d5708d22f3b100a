//! Error types for the broker layer.

/// Errors that can occur while publishing or subscribing.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The subscription pattern is empty or longer than
    /// [`MAX_PATTERN_LEN`](crate::MAX_PATTERN_LEN).
    #[error("invalid subscription pattern: {0:?}")]
    InvalidPattern(String),

    /// The broker has been shut down and accepts no further work.
    #[error("broker is shut down")]
    Closed,

    /// A broker URL was configured but this binary was built without the
    /// `redis` feature.
    #[error("broker url {0:?} requires the `redis` feature")]
    Unsupported(String),

    /// The Redis server rejected a command or could not be reached.
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
