//! Interop engine — resolution, dispatch and broadcast across platforms.
//!
//! The engine owns the platform registry, the application cache and one
//! listener registry per platform scope. Every call that reaches an
//! adapter runs under an engine-side timeout; a slow or failing platform
//! contributes nothing but never blocks or fails the others.
//!
//! Submodules:
//! - [`resolve`] — fan-out queries and candidate merging
//! - [`dispatch`] — raise, launch-then-deliver, pass-through calls

pub mod dispatch;
pub mod resolve;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;

use crate::directory::{AppDirectory, ApplicationCache};
use crate::error::{PlatformFailure, SendError, join_failures};
use crate::listeners::handle::RemoteSubscription;
use crate::listeners::{
    ContextCallback, EntryId, HandlerError, IntentCallback, Listener, ListenerKind,
    ListenerRegistry, SubscribeError, context_handler, intent_handler,
};
use crate::model::{
    AppIdentity, ApplicationInstance, BroadcastResult, Context, ContextError, ContextTypes,
    Platform,
};
use crate::platform::{
    ContextRegistration, IntentRegistration, PlatformAdapter, PlatformRegistry,
};

pub use dispatch::RaiseOutcome;
pub use resolve::{Query, Resolution};

/// Engine tuning and identity.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Per-platform bound on resolution queries.
    pub query_timeout: Duration,
    /// Bound on launch-until-registered.
    pub launch_timeout: Duration,
    /// Bound on intent delivery and broadcast sends.
    pub delivery_timeout: Duration,
    /// Bound on best-effort adapter unregistration.
    pub unregister_timeout: Duration,
    /// Platform used by listeners that name none.
    pub default_platform: Option<String>,
    /// Identity this engine subscribes under.
    pub identity: AppIdentity,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(5),
            launch_timeout: Duration::from_secs(30),
            delivery_timeout: Duration::from_secs(30),
            unregister_timeout: Duration::from_secs(5),
            default_platform: None,
            identity: AppIdentity::default(),
        }
    }
}

struct Inner {
    config: EngineConfig,
    registry: PlatformRegistry,
    cache: ApplicationCache,
    listeners: Mutex<HashMap<String, Arc<ListenerRegistry>>>,
}

/// Handle to the interop engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.inner.registry)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self::build(config, None)
    }

    /// Engine that enriches candidates from an App Directory.
    pub fn with_directory(config: EngineConfig, directory: Arc<dyn AppDirectory>) -> Self {
        Self::build(config, Some(directory))
    }

    fn build(config: EngineConfig, directory: Option<Arc<dyn AppDirectory>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry: PlatformRegistry::new(),
                cache: ApplicationCache::new(directory),
                listeners: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &PlatformRegistry {
        &self.inner.registry
    }

    // -- Platforms --

    pub fn register_platform(&self, adapter: Arc<dyn PlatformAdapter>) {
        self.inner.cache.invalidate(adapter.name());
        self.inner.registry.register(adapter);
    }

    /// Remove a platform. Listeners scoped to it stop receiving events.
    pub fn deregister_platform(&self, name: &str) -> bool {
        self.inner.cache.invalidate(name);
        if let Some(local) = self.lock_listeners().remove(name) {
            local.clear();
        }
        self.inner.registry.deregister(name)
    }

    pub fn mark_offline(&self, name: &str, reason: &str) -> bool {
        self.inner.cache.invalidate(name);
        self.inner.registry.mark_offline(name, reason)
    }

    pub fn mark_online(&self, name: &str) -> bool {
        self.inner.cache.invalidate(name);
        self.inner.registry.mark_online(name)
    }

    pub fn list_platforms(&self) -> Vec<Platform> {
        self.inner.registry.list()
    }

    // -- Listeners --

    fn lock_listeners(&self) -> MutexGuard<'_, HashMap<String, Arc<ListenerRegistry>>> {
        self.inner.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn local_registry(&self, platform: &str) -> Arc<ListenerRegistry> {
        let mut listeners = self.lock_listeners();
        Arc::clone(
            listeners
                .entry(platform.to_string())
                .or_insert_with(|| Arc::new(ListenerRegistry::new(platform))),
        )
    }

    /// Resolve a listener scope to an online adapter.
    fn scope(&self, platform: Option<&str>) -> Result<(String, Arc<dyn PlatformAdapter>), SubscribeError> {
        let name = platform
            .map(str::to_string)
            .or_else(|| self.inner.config.default_platform.clone())
            .ok_or(SubscribeError::NoPlatform)?;
        match self.inner.registry.get(&name) {
            None => Err(SubscribeError::UnknownPlatform(name)),
            Some((_, false)) => Err(SubscribeError::PlatformNotConnected(name)),
            Some((adapter, true)) => Ok((name, adapter)),
        }
    }

    /// Subscribe to an intent on the default platform.
    pub async fn subscribe_intent(
        &self,
        intent: &str,
        context_types: ContextTypes,
        handler: IntentCallback,
    ) -> Result<Listener, SubscribeError> {
        self.subscribe_intent_in(None, intent, context_types, handler).await
    }

    pub async fn subscribe_intent_on(
        &self,
        platform: &str,
        intent: &str,
        context_types: ContextTypes,
        handler: IntentCallback,
    ) -> Result<Listener, SubscribeError> {
        self.subscribe_intent_in(Some(platform), intent, context_types, handler)
            .await
    }

    async fn subscribe_intent_in(
        &self,
        platform: Option<&str>,
        intent: &str,
        context_types: ContextTypes,
        handler: IntentCallback,
    ) -> Result<Listener, SubscribeError> {
        if intent.is_empty() {
            return Err(SubscribeError::EmptyIntent);
        }
        let (name, adapter) = self.scope(platform)?;
        let local = self.local_registry(&name);
        let entry = local.add_intent(intent, context_types.clone(), handler)?;

        let registration = IntentRegistration {
            intent: intent.to_string(),
            context_types,
            owner: self.inner.config.identity.instance_on(&name),
            handler: forward_intent(Arc::downgrade(&local), entry),
        };
        let registered = tokio::time::timeout(
            self.inner.config.query_timeout,
            adapter.register_intent_listener(registration),
        )
        .await;
        let id = match registered {
            Ok(Ok(id)) => id,
            Ok(Err(e)) => {
                local.remove(entry);
                return Err(SubscribeError::Platform {
                    platform: name,
                    detail: e.to_string(),
                });
            }
            Err(_) => {
                local.remove(entry);
                return Err(SubscribeError::Platform {
                    platform: name,
                    detail: "registration timed out".to_string(),
                });
            }
        };

        tracing::debug!(platform = %name, intent, subscription = %id, "intent listener subscribed");
        Ok(Listener::new(
            ListenerKind::Intent {
                intent: intent.to_string(),
            },
            name,
            entry,
            &local,
            Some(RemoteSubscription {
                adapter,
                id,
                timeout: self.inner.config.unregister_timeout,
            }),
        ))
    }

    /// Subscribe to broadcast contexts on the default platform.
    pub async fn subscribe_context(&self, handler: ContextCallback) -> Result<Listener, SubscribeError> {
        self.subscribe_context_in(None, handler).await
    }

    pub async fn subscribe_context_on(
        &self,
        platform: &str,
        handler: ContextCallback,
    ) -> Result<Listener, SubscribeError> {
        self.subscribe_context_in(Some(platform), handler).await
    }

    async fn subscribe_context_in(
        &self,
        platform: Option<&str>,
        handler: ContextCallback,
    ) -> Result<Listener, SubscribeError> {
        let (name, adapter) = self.scope(platform)?;
        let local = self.local_registry(&name);
        let entry = local.add_context(handler);

        let registration = ContextRegistration {
            owner: Some(self.inner.config.identity.instance_on(&name)),
            handler: forward_context(Arc::downgrade(&local), entry),
        };
        let registered = tokio::time::timeout(
            self.inner.config.query_timeout,
            adapter.register_context_listener(registration),
        )
        .await;
        let id = match registered {
            Ok(Ok(id)) => id,
            Ok(Err(e)) => {
                local.remove(entry);
                return Err(SubscribeError::Platform {
                    platform: name,
                    detail: e.to_string(),
                });
            }
            Err(_) => {
                local.remove(entry);
                return Err(SubscribeError::Platform {
                    platform: name,
                    detail: "registration timed out".to_string(),
                });
            }
        };

        tracing::debug!(platform = %name, subscription = %id, "context listener subscribed");
        Ok(Listener::new(
            ListenerKind::Context,
            name,
            entry,
            &local,
            Some(RemoteSubscription {
                adapter,
                id,
                timeout: self.inner.config.unregister_timeout,
            }),
        ))
    }

    // -- Broadcast --

    /// Publish a context to every online platform.
    ///
    /// Listener failures never affect the result. Platform failures do:
    /// the broadcast fails only when no platform accepted it.
    pub async fn broadcast(
        &self,
        context: &Context,
        from: Option<&ApplicationInstance>,
    ) -> Result<BroadcastResult, ContextError> {
        context.validate()?;

        let snapshot = self.inner.registry.snapshot();
        let mut failures: Vec<PlatformFailure> = snapshot
            .iter()
            .filter(|s| !s.online)
            .map(|s| PlatformFailure::offline(s.name(), &s.status))
            .collect();
        let online: Vec<Arc<dyn PlatformAdapter>> = snapshot
            .into_iter()
            .filter(|s| s.online)
            .map(|s| s.adapter)
            .collect();
        if online.is_empty() {
            return Ok(BroadcastResult::failed(
                SendError::PlatformNotConnected,
                "no platform is connected",
            ));
        }

        let sent = online.len();
        let outcomes: Vec<Result<(), PlatformFailure>> = online
            .iter()
            .map(|adapter| self.send_one(adapter.as_ref(), context, from))
            .collect::<FuturesUnordered<_>>()
            .collect()
            .await;
        let send_failures: Vec<PlatformFailure> = outcomes.into_iter().filter_map(Result::err).collect();
        let all_failed = send_failures.len() == sent;
        failures.extend(send_failures);

        if all_failed {
            return Ok(BroadcastResult::failed(
                SendError::PlatformError,
                join_failures(&failures),
            ));
        }
        let mut result = BroadcastResult::ok();
        if !failures.is_empty() {
            result.error_msg = Some(join_failures(&failures));
        }
        Ok(result)
    }

    /// Publish a context to one named platform.
    pub async fn broadcast_on(
        &self,
        platform: &str,
        context: &Context,
        from: Option<&ApplicationInstance>,
    ) -> Result<BroadcastResult, ContextError> {
        context.validate()?;
        let result = match self.inner.registry.get(platform) {
            None => BroadcastResult::failed(
                SendError::UnknownPlatform,
                format!("unknown platform: {platform}"),
            ),
            Some((_, false)) => BroadcastResult::failed(
                SendError::PlatformNotConnected,
                format!("platform {platform} is not connected"),
            ),
            Some((adapter, true)) => match self.send_one(adapter.as_ref(), context, from).await {
                Ok(()) => BroadcastResult::ok(),
                Err(failure) => BroadcastResult::failed(SendError::PlatformError, failure.to_string()),
            },
        };
        Ok(result)
    }

    async fn send_one(
        &self,
        adapter: &dyn PlatformAdapter,
        context: &Context,
        from: Option<&ApplicationInstance>,
    ) -> Result<(), PlatformFailure> {
        let name = adapter.name();
        match tokio::time::timeout(self.inner.config.delivery_timeout, adapter.broadcast(context, from)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::warn!(platform = name, error = %e, "broadcast failed");
                Err(PlatformFailure::error(name, e.to_string()))
            }
            Err(_) => {
                tracing::warn!(platform = name, "broadcast timed out");
                Err(PlatformFailure::timeout(name))
            }
        }
    }
}

/// Adapter-side callback that routes into one local registry entry.
fn forward_intent(local: Weak<ListenerRegistry>, entry: EntryId) -> IntentCallback {
    intent_handler(move |invocation| {
        let local = local.clone();
        async move {
            let Some(local) = local.upgrade() else {
                return Err(HandlerError::new("listener scope removed"));
            };
            local
                .deliver_intent_to(entry, invocation)
                .await
                .map_err(|e| HandlerError::new(e.to_string()))
        }
    })
}

fn forward_context(local: Weak<ListenerRegistry>, entry: EntryId) -> ContextCallback {
    context_handler(move |context, from| {
        if let Some(local) = local.upgrade() {
            local.deliver_context_to(entry, context, from);
        }
        Ok(())
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::model::{ContextData, Instrument};
    use crate::platform::testing::{Script, ScriptedPlatform};
    use crate::platform::{HostedPlatform, NoLauncher};

    pub(crate) fn ctx(ticker: &str) -> Context {
        Context::single(ContextData::Instrument(Instrument {
            ticker: Some(ticker.into()),
            ..Default::default()
        }))
    }

    pub(crate) fn fast_config() -> EngineConfig {
        EngineConfig {
            query_timeout: Duration::from_millis(100),
            launch_timeout: Duration::from_secs(2),
            delivery_timeout: Duration::from_secs(2),
            unregister_timeout: Duration::from_millis(100),
            default_platform: Some("hosted".into()),
            identity: AppIdentity::new("engine-test"),
        }
    }

    fn hosted_engine() -> (Engine, HostedPlatform) {
        let engine = Engine::new(fast_config());
        let hosted = HostedPlatform::new("hosted", Arc::new(NoLauncher));
        engine.register_platform(Arc::new(hosted.clone()));
        (engine, hosted)
    }

    fn counter_handler(hits: &Arc<AtomicUsize>) -> ContextCallback {
        let hits = Arc::clone(hits);
        context_handler(move |_, _| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    // -- Platforms --

    #[test]
    fn list_platforms_reports_status() {
        let engine = Engine::new(fast_config());
        engine.register_platform(ScriptedPlatform::new("A", Script::Reply(vec![])).arc());
        engine.register_platform(ScriptedPlatform::new("B", Script::Reply(vec![])).arc());
        engine.mark_offline("B", "heartbeat lost");

        let platforms = engine.list_platforms();
        assert_eq!(platforms.len(), 2);
        assert!(platforms[0].online);
        assert!(!platforms[1].online);
        assert_eq!(platforms[1].connection_status, "heartbeat lost");
    }

    // -- Listeners --

    #[tokio::test]
    async fn overlapping_intent_subscriptions_rejected() {
        let (engine, _hosted) = hosted_engine();
        let handler = || intent_handler(|_| async { Ok(None) });
        engine
            .subscribe_intent("ViewChart", ContextTypes::of(["fdc3.instrument"]), handler())
            .await
            .unwrap();
        let err = engine
            .subscribe_intent("ViewChart", ContextTypes::Any, handler())
            .await
            .unwrap_err();
        assert!(matches!(err, SubscribeError::Overlap { .. }));
    }

    #[tokio::test]
    async fn subscribe_requires_known_online_platform() {
        let (engine, _hosted) = hosted_engine();
        let err = engine
            .subscribe_context_on("nope", context_handler(|_, _| Ok(())))
            .await
            .unwrap_err();
        assert_eq!(err, SubscribeError::UnknownPlatform("nope".into()));

        engine.mark_offline("hosted", "maintenance");
        let err = engine
            .subscribe_context(context_handler(|_, _| Ok(())))
            .await
            .unwrap_err();
        assert_eq!(err, SubscribeError::PlatformNotConnected("hosted".into()));
    }

    #[tokio::test]
    async fn subscribe_without_default_platform() {
        let engine = Engine::new(EngineConfig::default());
        let err = engine
            .subscribe_context(context_handler(|_, _| Ok(())))
            .await
            .unwrap_err();
        assert_eq!(err, SubscribeError::NoPlatform);
    }

    #[tokio::test]
    async fn unsubscribe_twice_stops_delivery_once() {
        let platform = ScriptedPlatform::new("A", Script::Reply(vec![])).arc();
        let engine = Engine::new(fast_config());
        engine.register_platform(platform.clone());

        let listener = engine
            .subscribe_context_on("A", context_handler(|_, _| Ok(())))
            .await
            .unwrap();
        assert_eq!(platform.registrations.lock().unwrap().len(), 1);

        listener.unsubscribe().await;
        listener.unsubscribe().await;
        assert!(!listener.is_active());
        assert!(platform.registrations.lock().unwrap().is_empty());
        // The adapter is told exactly once.
        assert_eq!(platform.unregistered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unsubscribed_listener_receives_nothing() {
        let (engine, _hosted) = hosted_engine();
        let hits = Arc::new(AtomicUsize::new(0));
        let listener = engine.subscribe_context(counter_handler(&hits)).await.unwrap();

        engine.broadcast(&ctx("AAPL"), None).await.unwrap();
        listener.unsubscribe().await;
        engine.broadcast(&ctx("MSFT"), None).await.unwrap();
        listener.unsubscribe().await;
        engine.broadcast(&ctx("IBM"), None).await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    // -- Broadcast --

    #[tokio::test]
    async fn broadcast_isolates_failing_listeners() {
        let (engine, _hosted) = hosted_engine();
        let hits = Arc::new(AtomicUsize::new(0));
        engine.subscribe_context(counter_handler(&hits)).await.unwrap();
        engine
            .subscribe_context(context_handler(|_, _| Err(HandlerError::new("boom"))))
            .await
            .unwrap();
        engine
            .subscribe_context(context_handler(|_, _| panic!("listener bug")))
            .await
            .unwrap();
        engine.subscribe_context(counter_handler(&hits)).await.unwrap();

        let result = engine.broadcast(&ctx("AAPL"), None).await.unwrap();
        assert!(result.success);
        assert_eq!(result.error, SendError::SendOk);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn three_listeners_all_receive_broadcast() {
        let (engine, _hosted) = hosted_engine();
        let received = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let received = Arc::clone(&received);
            engine
                .subscribe_context(context_handler(move |c, _| {
                    received.lock().unwrap().push((n, c.clone()));
                    if n == 1 {
                        return Err(HandlerError::new("listener 1 throws"));
                    }
                    Ok(())
                }))
                .await
                .unwrap();
        }
        let result = engine.broadcast(&ctx("AAPL"), None).await.unwrap();
        assert!(result.success);
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 3);
        assert!(received.iter().all(|(_, c)| *c == ctx("AAPL")));
    }

    #[tokio::test]
    async fn broadcast_without_platforms() {
        let engine = Engine::new(fast_config());
        let result = engine.broadcast(&ctx("AAPL"), None).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error, SendError::PlatformNotConnected);
    }

    #[tokio::test]
    async fn broadcast_partial_and_total_failure() {
        let a = ScriptedPlatform::new("A", Script::Reply(vec![])).arc();
        let b = ScriptedPlatform::new("B", Script::Reply(vec![])).arc();
        *b.broadcast_fails.lock().unwrap() = Some("socket reset".into());
        let engine = Engine::new(fast_config());
        engine.register_platform(a.clone());
        engine.register_platform(b.clone());

        let partial = engine.broadcast(&ctx("AAPL"), None).await.unwrap();
        assert!(partial.success);
        assert!(partial.error_msg.unwrap().contains("B"));
        assert_eq!(a.broadcasts.lock().unwrap().len(), 1);

        *a.broadcast_fails.lock().unwrap() = Some("down".into());
        let total = engine.broadcast(&ctx("AAPL"), None).await.unwrap();
        assert!(!total.success);
        assert_eq!(total.error, SendError::PlatformError);
    }

    #[tokio::test]
    async fn broadcast_on_unknown_platform() {
        let (engine, _hosted) = hosted_engine();
        let result = engine.broadcast_on("nope", &ctx("AAPL"), None).await.unwrap();
        assert_eq!(result.error, SendError::UnknownPlatform);
        let ok = engine.broadcast_on("hosted", &ctx("AAPL"), None).await.unwrap();
        assert!(ok.success);
    }

    #[tokio::test]
    async fn broadcast_rejects_empty_context() {
        let (engine, _hosted) = hosted_engine();
        let err = engine.broadcast(&Context::default(), None).await.unwrap_err();
        assert_eq!(err, ContextError::Empty);
    }

    #[tokio::test]
    async fn intent_broadcast_channels_are_separate() {
        let (engine, _hosted) = hosted_engine();
        let invoked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&invoked);
        engine
            .subscribe_intent(
                "fdc3.instrument",
                ContextTypes::Any,
                intent_handler(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok(None) }
                }),
            )
            .await
            .unwrap();
        engine.broadcast(&ctx("AAPL"), None).await.unwrap();
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn deregister_silences_scoped_listeners() {
        let (engine, hosted) = hosted_engine();
        let hits = Arc::new(AtomicUsize::new(0));
        let listener = engine.subscribe_context(counter_handler(&hits)).await.unwrap();
        assert!(engine.deregister_platform("hosted"));

        // Adapter still alive, but the engine-side entry is gone.
        hosted.broadcast(&ctx("AAPL"), None).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        listener.unsubscribe().await;
    }
}
