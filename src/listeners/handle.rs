//! Subscription handles returned to callers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::platform::{PlatformAdapter, SubscriptionId};

use super::{EntryId, ListenerRegistry};

/// What a [`Listener`] is subscribed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerKind {
    Intent { intent: String },
    Context,
}

/// The adapter-side half of a subscription.
pub(crate) struct RemoteSubscription {
    pub adapter: Arc<dyn PlatformAdapter>,
    pub id: SubscriptionId,
    pub timeout: Duration,
}

struct Inner {
    kind: ListenerKind,
    platform: String,
    entry: EntryId,
    registry: Weak<ListenerRegistry>,
    remote: Option<RemoteSubscription>,
    unsubscribed: AtomicBool,
}

/// Handle to a live subscription.
///
/// Clones share state: unsubscribing through any clone ends the
/// subscription for all of them.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("kind", &self.inner.kind)
            .field("platform", &self.inner.platform)
            .field("entry", &self.inner.entry)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Listener {
    pub(crate) fn new(
        kind: ListenerKind,
        platform: impl Into<String>,
        entry: EntryId,
        registry: &Arc<ListenerRegistry>,
        remote: Option<RemoteSubscription>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                kind,
                platform: platform.into(),
                entry,
                registry: Arc::downgrade(registry),
                remote,
                unsubscribed: AtomicBool::new(false),
            }),
        }
    }

    pub fn kind(&self) -> &ListenerKind {
        &self.inner.kind
    }

    pub fn platform(&self) -> &str {
        &self.inner.platform
    }

    pub fn is_active(&self) -> bool {
        !self.inner.unsubscribed.load(Ordering::Acquire)
    }

    /// End the subscription.
    ///
    /// The local entry is removed before anything else, so no event is
    /// delivered once this starts. The adapter-side registration is then
    /// dropped best-effort: failures and timeouts are logged, never
    /// returned. Calling this again is a no-op.
    pub async fn unsubscribe(&self) {
        if self.inner.unsubscribed.swap(true, Ordering::AcqRel) {
            tracing::trace!(platform = %self.inner.platform, "listener already unsubscribed");
            return;
        }

        if let Some(registry) = self.inner.registry.upgrade() {
            registry.remove(self.inner.entry);
        }

        let Some(remote) = &self.inner.remote else {
            return;
        };
        match tokio::time::timeout(remote.timeout, remote.adapter.unregister(remote.id)).await {
            Ok(Ok(())) => {
                tracing::debug!(platform = %self.inner.platform, subscription = remote.id.0, "listener unregistered");
            }
            Ok(Err(e)) => {
                tracing::warn!(platform = %self.inner.platform, error = %e, "failed to unregister listener");
            }
            Err(_) => {
                tracing::warn!(platform = %self.inner.platform, timeout = ?remote.timeout, "unregister timed out");
            }
        }
    }
}
