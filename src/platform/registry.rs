//! Platform registry — known adapters and their online status.
//!
//! Registration is keyed by name: registering a second adapter under an
//! existing name replaces the first in place. Fan-out callers work on
//! snapshots from [`PlatformRegistry::list_online`], so a platform going
//! offline mid-call never cancels the call itself.
//!
//! Every state change bumps a registry-wide generation counter. Caches
//! keyed by platform compare generations to detect staleness.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::model::Platform;

use super::{PlatformAdapter, PlatformHealth};

const ONLINE_STATUS: &str = "connected";

struct Slot {
    adapter: Arc<dyn PlatformAdapter>,
    online: bool,
    status: String,
    generation: u64,
    /// Unique per registration; lets a stale monitor detect replacement.
    seq: u64,
    monitor: Option<JoinHandle<()>>,
}

impl Slot {
    fn name(&self) -> &str {
        self.adapter.name()
    }
}

struct Inner {
    slots: Mutex<Vec<Slot>>,
    clock: AtomicU64,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Apply a status change. Returns `false` if no slot matched.
    fn set_status(&self, name: &str, seq: Option<u64>, online: bool, status: String) -> bool {
        let generation = self.tick();
        let mut slots = self.lock();
        let Some(slot) = slots
            .iter_mut()
            .find(|s| s.name() == name && seq.is_none_or(|seq| s.seq == seq))
        else {
            return false;
        };
        if slot.online != online {
            if online {
                tracing::info!(platform = name, "platform online");
            } else {
                tracing::warn!(platform = name, reason = %status, "platform offline");
            }
        }
        slot.online = online;
        slot.status = status;
        slot.generation = generation;
        true
    }
}

/// Point-in-time view of one registered platform.
#[derive(Clone)]
pub struct PlatformSnapshot {
    pub adapter: Arc<dyn PlatformAdapter>,
    pub online: bool,
    /// Connection status text; the offline reason when offline.
    pub status: String,
}

impl PlatformSnapshot {
    pub fn name(&self) -> &str {
        self.adapter.name()
    }
}

/// Set of registered platform adapters.
#[derive(Clone)]
pub struct PlatformRegistry {
    inner: Arc<Inner>,
}

impl Default for PlatformRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PlatformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.inner.lock().iter().map(|s| s.name().to_string()).collect();
        f.debug_struct("PlatformRegistry").field("platforms", &names).finish()
    }
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(Vec::new()),
                clock: AtomicU64::new(0),
            }),
        }
    }

    /// Register an adapter, replacing any adapter with the same name.
    ///
    /// The platform starts online. If the adapter publishes a health
    /// stream and a tokio runtime is available, a monitor task keeps the
    /// online flag in sync with it.
    pub fn register(&self, adapter: Arc<dyn PlatformAdapter>) {
        let name = adapter.name().to_string();
        let seq = self.inner.tick();
        let health = adapter.health();

        let slot = Slot {
            adapter,
            online: true,
            status: ONLINE_STATUS.to_string(),
            generation: seq,
            seq,
            monitor: None,
        };

        {
            let mut slots = self.inner.lock();
            match slots.iter_mut().find(|s| s.name() == name) {
                Some(existing) => {
                    if let Some(old) = existing.monitor.take() {
                        old.abort();
                    }
                    *existing = slot;
                    tracing::info!(platform = %name, "platform replaced");
                }
                None => {
                    slots.push(slot);
                    tracing::info!(platform = %name, "platform registered");
                }
            }
        }

        // The slot must exist before the monitor's first status update.
        let Some(monitor) =
            health.and_then(|rx| spawn_monitor(Arc::downgrade(&self.inner), name.clone(), seq, rx))
        else {
            return;
        };
        let mut slots = self.inner.lock();
        match slots.iter_mut().find(|s| s.name() == name && s.seq == seq) {
            Some(slot) => slot.monitor = Some(monitor),
            None => monitor.abort(),
        }
    }

    /// Remove a platform. Returns `false` if it was not registered.
    pub fn deregister(&self, name: &str) -> bool {
        self.inner.tick();
        let mut slots = self.inner.lock();
        let Some(pos) = slots.iter().position(|s| s.name() == name) else {
            return false;
        };
        let mut slot = slots.remove(pos);
        if let Some(monitor) = slot.monitor.take() {
            monitor.abort();
        }
        tracing::info!(platform = name, "platform deregistered");
        true
    }

    /// Every registered platform with its status, in registration order.
    pub fn snapshot(&self) -> Vec<PlatformSnapshot> {
        self.inner
            .lock()
            .iter()
            .map(|s| PlatformSnapshot {
                adapter: Arc::clone(&s.adapter),
                online: s.online,
                status: s.status.clone(),
            })
            .collect()
    }

    /// Snapshot of online adapters, in registration order.
    pub fn list_online(&self) -> Vec<Arc<dyn PlatformAdapter>> {
        self.snapshot()
            .into_iter()
            .filter(|s| s.online)
            .map(|s| s.adapter)
            .collect()
    }

    /// Descriptors for every registered platform.
    pub fn list(&self) -> Vec<Platform> {
        self.snapshot()
            .into_iter()
            .map(|s| {
                let info = s.adapter.describe();
                Platform {
                    name: s.name().to_string(),
                    version: info.version,
                    online: s.online,
                    connection_status: s.status,
                    config: info.config,
                }
            })
            .collect()
    }

    /// Look up an adapter and its online flag.
    pub fn get(&self, name: &str) -> Option<(Arc<dyn PlatformAdapter>, bool)> {
        self.inner
            .lock()
            .iter()
            .find(|s| s.name() == name)
            .map(|s| (Arc::clone(&s.adapter), s.online))
    }

    pub fn is_online(&self, name: &str) -> bool {
        self.get(name).is_some_and(|(_, online)| online)
    }

    /// Current generation of a platform's registration, if registered.
    pub fn generation(&self, name: &str) -> Option<u64> {
        self.inner
            .lock()
            .iter()
            .find(|s| s.name() == name)
            .map(|s| s.generation)
    }

    /// Exclude a platform from future fan-outs. In-flight calls continue.
    pub fn mark_offline(&self, name: &str, reason: &str) -> bool {
        self.inner.set_status(name, None, false, reason.to_string())
    }

    pub fn mark_online(&self, name: &str) -> bool {
        self.inner.set_status(name, None, true, ONLINE_STATUS.to_string())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn spawn_monitor(
    registry: Weak<Inner>,
    name: String,
    seq: u64,
    mut rx: watch::Receiver<PlatformHealth>,
) -> Option<JoinHandle<()>> {
    let handle = tokio::runtime::Handle::try_current().ok()?;
    Some(handle.spawn(async move {
        loop {
            let health = rx.borrow_and_update().clone();
            let Some(inner) = registry.upgrade() else {
                return;
            };
            let applied = match health {
                PlatformHealth::Online => {
                    inner.set_status(&name, Some(seq), true, ONLINE_STATUS.to_string())
                }
                PlatformHealth::Offline { reason } => inner.set_status(&name, Some(seq), false, reason),
            };
            drop(inner);
            if !applied {
                tracing::debug!(platform = %name, "health monitor detached");
                return;
            }
            if rx.changed().await.is_err() {
                tracing::debug!(platform = %name, "health stream closed");
                return;
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::platform::testing::{Script, ScriptedPlatform};

    fn scripted(name: &str) -> Arc<ScriptedPlatform> {
        ScriptedPlatform::new(name, Script::Reply(vec![])).arc()
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // -- Registration --

    #[test]
    fn reregister_replaces_by_name() {
        let reg = PlatformRegistry::new();
        reg.register(scripted("A"));
        reg.register(scripted("B"));
        reg.register(scripted("A"));
        assert_eq!(reg.len(), 2);
        let names: Vec<String> = reg.list().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[test]
    fn deregister_removes() {
        let reg = PlatformRegistry::new();
        reg.register(scripted("A"));
        assert!(reg.deregister("A"));
        assert!(!reg.deregister("A"));
        assert!(reg.is_empty());
        assert!(reg.generation("A").is_none());
    }

    // -- Status --

    #[test]
    fn offline_platforms_excluded_from_snapshot() {
        let reg = PlatformRegistry::new();
        reg.register(scripted("A"));
        reg.register(scripted("B"));
        let before = reg.generation("B").unwrap();

        assert!(reg.mark_offline("B", "socket closed"));
        let online: Vec<String> = reg.list_online().iter().map(|a| a.name().to_string()).collect();
        assert_eq!(online, vec!["A"]);
        assert!(reg.generation("B").unwrap() > before);

        let b = reg.list().into_iter().find(|p| p.name == "B").unwrap();
        assert!(!b.online);
        assert_eq!(b.connection_status, "socket closed");

        reg.mark_online("B");
        assert_eq!(reg.list_online().len(), 2);
    }

    #[test]
    fn mark_unknown_platform() {
        let reg = PlatformRegistry::new();
        assert!(!reg.mark_offline("nope", "x"));
    }

    // -- Health monitor --

    #[tokio::test]
    async fn health_stream_drives_online_flag() {
        let platform = ScriptedPlatform::new("A", Script::Reply(vec![])).with_health().arc();
        let reg = PlatformRegistry::new();
        reg.register(platform.clone());
        settle().await;
        assert!(reg.is_online("A"));

        let tx = platform.health.as_ref().unwrap();
        tx.send_replace(PlatformHealth::Offline {
            reason: "heartbeat lost".into(),
        });
        settle().await;
        assert!(!reg.is_online("A"));

        tx.send_replace(PlatformHealth::Online);
        settle().await;
        assert!(reg.is_online("A"));
    }

    #[tokio::test]
    async fn replaced_platform_ignores_old_health() {
        let old = ScriptedPlatform::new("A", Script::Reply(vec![])).with_health().arc();
        let reg = PlatformRegistry::new();
        reg.register(old.clone());
        settle().await;
        reg.register(scripted("A"));

        old.health.as_ref().unwrap().send_replace(PlatformHealth::Offline {
            reason: "stale".into(),
        });
        settle().await;
        assert!(reg.is_online("A"));
    }
}
