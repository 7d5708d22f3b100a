//! Subscription handle shared by every broker backend.

use crate::BrokerMessage;
use futures_util::Stream;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Identifier of a subscription, unique within one broker.
pub type SubscriptionId = u64;

type Release = Box<dyn FnOnce() + Send>;

/// A live pattern subscription.
///
/// Yields messages until [`unsubscribe`](Self::unsubscribe) is called, the
/// handle is dropped, or the backend loses its connection. Dropping the
/// handle releases the broker-side registration.
pub struct Subscription {
    id: SubscriptionId,
    pattern: String,
    receiver: mpsc::Receiver<BrokerMessage>,
    release: Option<Release>,
}

impl Subscription {
    /// Builds a handle around a backend's delivery queue.
    ///
    /// `release` runs exactly once, on the first `unsubscribe` or on drop.
    pub fn new(
        id: SubscriptionId,
        pattern: impl Into<String>,
        receiver: mpsc::Receiver<BrokerMessage>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            id,
            pattern: pattern.into(),
            receiver,
            release: Some(Box::new(release)),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_closed(&self) -> bool {
        self.release.is_none()
    }

    /// Waits for the next message.
    ///
    /// Returns `None` once the subscription has been closed or the backend
    /// terminated it.
    pub async fn recv(&mut self) -> Option<BrokerMessage> {
        if self.is_closed() {
            return None;
        }
        self.receiver.recv().await
    }

    /// Releases the subscription. Calling this more than once, or after the
    /// backend already terminated the subscription, is a no-op.
    pub fn unsubscribe(&mut self) {
        if let Some(release) = self.release.take() {
            self.receiver.close();
            release();
            tracing::debug!(
                subscription = self.id,
                pattern = %self.pattern,
                "subscription released"
            );
        }
    }
}

impl Stream for Subscription {
    type Item = BrokerMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.is_closed() {
            return Poll::Ready(None);
        }
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .field("closed", &self.is_closed())
            .finish()
    }
}
