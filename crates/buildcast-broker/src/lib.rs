//! Publish/subscribe channels for build logs.
//!
//! Every build publishes to its own channel (`logs:<build id>`); viewers
//! subscribe with a glob pattern that may cover one build or all of them
//! (`logs:*`). Channels have no explicit lifecycle: publishing to a channel
//! nobody listens on drops the message, and subscribing to a channel nobody
//! publishes on yet simply waits.
//!
//! # Backends
//!
//! - [`MemoryBroker`]: in-process registry, used when the builder runs
//!   inside the server and in tests.
//! - [`RedisBroker`]: `PUBLISH`/`PSUBSCRIBE` against a Redis server, for
//!   builders running in their own containers (feature `redis`).
//!
//! Both are used through the object-safe [`Broker`] trait. One broker is
//! created at startup and shared as `Arc<dyn Broker>` by every component that
//! publishes or subscribes.
//!
//! # Delivery
//!
//! Delivery is best-effort and at-most-once. Each subscription has a bounded
//! queue of [`SUBSCRIPTION_CAPACITY`] messages; when it is full the message
//! is dropped for that subscriber only and the publisher carries on. Messages
//! from one publisher reach one subscriber in publish order.

mod error;
mod memory;
#[cfg(feature = "redis")]
mod redis_broker;
mod subscription;

use async_trait::async_trait;
use std::sync::Arc;

pub use error::BrokerError;
pub use memory::MemoryBroker;
#[cfg(feature = "redis")]
pub use redis_broker::RedisBroker;
pub use subscription::{Subscription, SubscriptionId};

/// Maximum number of undelivered messages buffered per subscription.
pub const SUBSCRIPTION_CAPACITY: usize = 1024;

/// Longest accepted subscription pattern, in bytes.
pub const MAX_PATTERN_LEN: usize = 256;

/// A message delivered to a subscription.
///
/// Both fields are reference counted: a single publish fans out to every
/// matching subscriber without copying the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Concrete channel the message was published on.
    pub channel: Arc<str>,
    /// Raw payload as published.
    pub payload: Arc<str>,
}

/// A many-producer/many-consumer publish/subscribe broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publishes `payload` on `channel`.
    ///
    /// Never waits for subscribers. Publishing to a channel without
    /// subscribers succeeds and drops the payload.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError>;

    /// Opens a subscription covering every channel that matches `pattern`.
    ///
    /// Only messages published after this call returns are delivered.
    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BrokerError>;

    /// Number of subscriptions currently held open through this broker.
    fn subscriber_count(&self) -> usize;

    /// Stops the broker. Live subscriptions terminate and further calls fail
    /// with [`BrokerError::Closed`].
    async fn shutdown(&self) {}
}

/// Creates the process-wide broker.
///
/// With no URL an in-process [`MemoryBroker`] is used. A URL selects the
/// Redis backend, which must be reachable now: failure here is a fatal
/// startup error.
pub async fn connect(url: Option<&str>) -> Result<Arc<dyn Broker>, BrokerError> {
    match url {
        None => {
            tracing::info!("using in-process memory broker");
            Ok(Arc::new(MemoryBroker::new()))
        }
        #[cfg(feature = "redis")]
        Some(url) => Ok(Arc::new(RedisBroker::connect(url).await?)),
        #[cfg(not(feature = "redis"))]
        Some(url) => Err(BrokerError::Unsupported(url.to_string())),
    }
}

pub(crate) fn validate_pattern(pattern: &str) -> Result<(), BrokerError> {
    if pattern.is_empty() || pattern.len() > MAX_PATTERN_LEN {
        return Err(BrokerError::InvalidPattern(pattern.to_string()));
    }
    Ok(())
}
