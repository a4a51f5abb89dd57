//! Hosted platform — applications attached directly to this broker.
//!
//! The hosted platform keeps a catalog of launchable applications, the
//! set of attached instances (each with its own listener registry), and
//! the launches still waiting for their instance to attach.
//!
//! Launch sequencing: `open` hands the launcher a one-time token and
//! waits on a oneshot channel. The new instance presents the token when
//! it attaches, which completes the channel. Only then does `open`
//! return, so callers always observe "instance registered" before they
//! can deliver anything to it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, oneshot, watch};

use crate::error::OpenError;
use crate::listeners::{DeliveryError, EntryId, IntentInvocation, ListenerRegistry};
use crate::model::{
    Application, ApplicationInstance, Context, ContextTypes, HandlerTarget, IntentHandler,
    IntentList, IntentResult,
};

use super::launcher::{LaunchRequest, Launcher};
use super::{
    ContextRegistration, IntentRegistration, IntentRequest, PlatformAdapter, PlatformError,
    PlatformHealth, PlatformInfo, SubscriptionId,
};

/// An intent an application declares in its catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredIntent {
    pub name: String,
    #[serde(default)]
    pub context_types: ContextTypes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

/// A launchable application and the intents it services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDefinition {
    pub app: Application,
    pub intents: Vec<DeclaredIntent>,
}

#[derive(Debug, Clone)]
pub struct HostedConfig {
    pub version: String,
    /// How long `open` waits for the launched instance to attach.
    pub launch_timeout: Duration,
    /// How long a raise waits for a matching listener on the target.
    pub listener_wait: Duration,
}

impl Default for HostedConfig {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            launch_timeout: Duration::from_secs(30),
            listener_wait: Duration::from_secs(5),
        }
    }
}

struct HostedInstance {
    instance: ApplicationInstance,
    listeners: Arc<ListenerRegistry>,
    /// Signalled whenever a listener is added or the instance detaches.
    changed: Arc<Notify>,
    /// Context passed to `open`, held for the first context listener.
    initial_context: Option<Context>,
}

struct PendingLaunch {
    tx: oneshot::Sender<ApplicationInstance>,
    context: Option<Context>,
}

struct State {
    catalog: Vec<AppDefinition>,
    instances: Vec<HostedInstance>,
    anonymous: Arc<ListenerRegistry>,
    pending: HashMap<String, PendingLaunch>,
    subscriptions: HashMap<SubscriptionId, (Arc<ListenerRegistry>, EntryId)>,
}

impl State {
    fn instance(&self, instance: &ApplicationInstance) -> Option<&HostedInstance> {
        self.instances.iter().find(|h| h.instance == *instance)
    }

    fn catalog_entry(&self, name_or_id: &str) -> Option<&AppDefinition> {
        self.catalog.iter().find(|d| d.app.matches(name_or_id))
    }
}

struct Inner {
    name: String,
    config: HostedConfig,
    launcher: Arc<dyn Launcher>,
    health: watch::Sender<PlatformHealth>,
    state: Mutex<State>,
    next_subscription: AtomicU64,
}

/// In-process platform adapter.
#[derive(Clone)]
pub struct HostedPlatform {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for HostedPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostedPlatform")
            .field("name", &self.inner.name)
            .field("instances", &self.lock().instances.len())
            .finish()
    }
}

impl HostedPlatform {
    pub fn new(name: impl Into<String>, launcher: Arc<dyn Launcher>) -> Self {
        Self::with_config(name, launcher, HostedConfig::default())
    }

    pub fn with_config(
        name: impl Into<String>,
        launcher: Arc<dyn Launcher>,
        config: HostedConfig,
    ) -> Self {
        let name = name.into();
        let (health, _) = watch::channel(PlatformHealth::Online);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    catalog: Vec::new(),
                    instances: Vec::new(),
                    anonymous: Arc::new(ListenerRegistry::new(format!("{name}/anonymous"))),
                    pending: HashMap::new(),
                    subscriptions: HashMap::new(),
                }),
                name,
                config,
                launcher,
                health,
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_subscription(&self) -> SubscriptionId {
        SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed))
    }

    // -- Catalog --

    /// Add or replace a launchable application.
    pub fn add_app(&self, mut definition: AppDefinition) {
        definition.app.platform_name = self.inner.name.clone();
        let mut state = self.lock();
        let key = definition.app.key().to_string();
        match state.catalog.iter_mut().find(|d| d.app.key() == key) {
            Some(existing) => *existing = definition,
            None => state.catalog.push(definition),
        }
    }

    pub fn catalog(&self) -> Vec<AppDefinition> {
        self.lock().catalog.clone()
    }

    // -- Instances --

    /// Attach a running instance.
    ///
    /// If `launch_token` matches a pending launch, that launch completes
    /// with the returned instance. Re-attaching an existing instance keeps
    /// its listeners.
    pub fn attach(
        &self,
        mut app: Application,
        instance_id: Option<String>,
        launch_token: Option<&str>,
    ) -> ApplicationInstance {
        app.platform_name = self.inner.name.clone();
        let mut state = self.lock();

        if let Some(entry) = state.catalog_entry(app.key()) {
            if app.name.is_none() {
                app.name = entry.app.name.clone();
            }
            if app.app_type.is_none() {
                app.app_type = entry.app.app_type.clone();
            }
        }

        let instance = ApplicationInstance::new(
            app,
            instance_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        );
        let pending = launch_token.and_then(|t| state.pending.remove(t));

        if state.instance(&instance).is_none() {
            let scope = format!("{}/{}", self.inner.name, instance);
            state.instances.push(HostedInstance {
                instance: instance.clone(),
                listeners: Arc::new(ListenerRegistry::new(scope)),
                changed: Arc::new(Notify::new()),
                initial_context: None,
            });
        }
        tracing::info!(platform = %self.inner.name, instance = %instance, "instance attached");

        if let Some(PendingLaunch { tx, context }) = pending {
            if let Some(hosted) = state.instances.iter_mut().find(|h| h.instance == instance) {
                hosted.initial_context = context;
            }
            if tx.send(instance.clone()).is_err() {
                tracing::warn!(instance = %instance, "launch completed after opener gave up");
            }
        }
        instance
    }

    /// Detach an instance and drop its listeners.
    pub fn detach(&self, instance: &ApplicationInstance) -> bool {
        let removed = {
            let mut state = self.lock();
            let Some(pos) = state.instances.iter().position(|h| h.instance == *instance) else {
                return false;
            };
            let removed = state.instances.remove(pos);
            state
                .subscriptions
                .retain(|_, (registry, _)| !Arc::ptr_eq(registry, &removed.listeners));
            removed
        };
        removed.listeners.clear();
        removed.changed.notify_waiters();
        tracing::info!(platform = %self.inner.name, instance = %instance, "instance detached");
        true
    }

    pub fn instances(&self) -> Vec<ApplicationInstance> {
        self.lock().instances.iter().map(|h| h.instance.clone()).collect()
    }

    pub fn set_health(&self, health: PlatformHealth) {
        self.inner.health.send_replace(health);
    }

    /// Find the instance's registry, attaching it first if unknown.
    fn registry_for(
        &self,
        owner: &ApplicationInstance,
    ) -> (Arc<ListenerRegistry>, Arc<Notify>) {
        let lookup = |state: &State| {
            state
                .instance(owner)
                .map(|h| (Arc::clone(&h.listeners), Arc::clone(&h.changed)))
        };
        if let Some(found) = lookup(&self.lock()) {
            return found;
        }
        let attached = self.attach(owner.app.clone(), Some(owner.instance_id.clone()), None);
        let state = self.lock();
        match state.instance(&attached) {
            Some(h) => (Arc::clone(&h.listeners), Arc::clone(&h.changed)),
            // Detached concurrently; hand out a registry nobody routes to.
            None => (
                Arc::new(ListenerRegistry::new(attached.to_string())),
                Arc::new(Notify::new()),
            ),
        }
    }

    /// Collect candidates from live listeners and the catalog.
    fn collect(&self, intent: Option<&str>, accepts: impl Fn(&ContextTypes) -> bool) -> Vec<IntentList> {
        let state = self.lock();
        let mut lists: Vec<IntentList> = Vec::new();
        let mut add = |name: &str, handler: IntentHandler| {
            match lists.iter_mut().find(|l| l.intent == name) {
                Some(list) => list.push(handler),
                None => lists.push(IntentList::new(name).with(handler)),
            }
        };

        for hosted in &state.instances {
            for (name, types) in hosted.listeners.intent_declarations() {
                if intent.is_some_and(|i| i != name) || !accepts(&types) {
                    continue;
                }
                add(&name, IntentHandler::for_instance(hosted.instance.clone(), types));
            }
        }
        for def in &state.catalog {
            for declared in &def.intents {
                if intent.is_some_and(|i| i != declared.name) || !accepts(&declared.context_types) {
                    continue;
                }
                let mut handler = IntentHandler::for_app(def.app.clone(), declared.context_types.clone());
                handler.method = declared.method.clone();
                add(&declared.name, handler);
            }
        }
        lists
    }

    async fn wait_for_listener(
        &self,
        registry: &ListenerRegistry,
        changed: &Notify,
        instance: &ApplicationInstance,
        intent: &str,
        context: &Context,
    ) -> bool {
        let wait = async {
            loop {
                let notified = changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if registry.accepts_intent(intent, context) {
                    return true;
                }
                if self.lock().instance(instance).is_none() {
                    return false;
                }
                notified.await;
            }
        };
        tokio::time::timeout(self.inner.config.listener_wait, wait)
            .await
            .unwrap_or(false)
    }
}

#[async_trait]
impl PlatformAdapter for HostedPlatform {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn describe(&self) -> PlatformInfo {
        PlatformInfo {
            version: self.inner.config.version.clone(),
            config: None,
        }
    }

    async fn open(
        &self,
        app: &Application,
        context: Option<&Context>,
        config: Option<&str>,
    ) -> Result<ApplicationInstance, OpenError> {
        let key = app.key().to_string();
        let definition = self
            .lock()
            .catalog_entry(&key)
            .cloned()
            .ok_or_else(|| OpenError::AppNotFound(key.clone()))?;

        let token = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.lock().pending.insert(
            token.clone(),
            PendingLaunch {
                tx,
                context: context.cloned(),
            },
        );

        let request = LaunchRequest {
            app: definition.app.clone(),
            token: token.clone(),
            config: config.map(str::to_string),
        };
        tracing::info!(platform = %self.inner.name, app = %definition.app, "launching application");
        if let Err(e) = self.inner.launcher.launch(self.clone(), request).await {
            self.lock().pending.remove(&token);
            return Err(OpenError::ErrorOnLaunch {
                app: key,
                detail: e.to_string(),
            });
        }

        let timeout = self.inner.config.launch_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(instance)) => Ok(instance),
            Ok(Err(_)) => Err(OpenError::ErrorOnLaunch {
                app: key,
                detail: "launch abandoned".to_string(),
            }),
            Err(_) => {
                self.lock().pending.remove(&token);
                Err(OpenError::AppTimeout { app: key, timeout })
            }
        }
    }

    async fn list_instances(
        &self,
        app: &Application,
    ) -> Result<Vec<ApplicationInstance>, PlatformError> {
        Ok(self
            .lock()
            .instances
            .iter()
            .filter(|h| h.instance.app.matches(app.key()))
            .map(|h| h.instance.clone())
            .collect())
    }

    async fn activate_instance(&self, instance: &ApplicationInstance) -> Result<(), PlatformError> {
        if self.lock().instance(instance).is_none() {
            return Err(PlatformError::UnknownInstance(instance.to_string()));
        }
        tracing::debug!(instance = %instance, "instance activated");
        Ok(())
    }

    async fn resolve_by_intent(
        &self,
        intent: &str,
        context: Option<&Context>,
    ) -> Result<Vec<IntentList>, PlatformError> {
        Ok(self.collect(Some(intent), |types| context.is_none_or(|c| types.accepts(c))))
    }

    async fn resolve_by_context(&self, context: &Context) -> Result<Vec<IntentList>, PlatformError> {
        Ok(self.collect(None, |types| types.accepts(context)))
    }

    async fn resolve_by_context_type(
        &self,
        types: &[String],
    ) -> Result<Vec<IntentList>, PlatformError> {
        Ok(self.collect(None, |declared| declared.accepts_any_of(types)))
    }

    async fn raise_intent(&self, request: IntentRequest) -> Result<IntentResult, PlatformError> {
        let instance = match request.target.target {
            HandlerTarget::Instance { instance } => instance,
            HandlerTarget::Application { application } => {
                return Err(PlatformError::NotRunning(application.to_string()));
            }
        };
        let (registry, changed) = self
            .lock()
            .instance(&instance)
            .map(|h| (Arc::clone(&h.listeners), Arc::clone(&h.changed)))
            .ok_or_else(|| PlatformError::UnknownInstance(instance.to_string()))?;

        // A freshly launched instance may not have subscribed yet.
        if !self
            .wait_for_listener(&registry, &changed, &instance, &request.intent, &request.context)
            .await
        {
            return Err(PlatformError::NoHandler {
                intent: request.intent,
                detail: format!("{instance} has no matching listener"),
            });
        }

        let invocation = IntentInvocation {
            intent: request.intent.clone(),
            context: request.context,
            caller: request.caller,
        };
        match registry.deliver_intent(invocation).await {
            Ok(data) => Ok(IntentResult { instance, data }),
            Err(DeliveryError::NoListener { intent, offered }) => Err(PlatformError::NoHandler {
                intent,
                detail: format!("no listener accepts [{offered}]"),
            }),
            Err(e) => Err(PlatformError::Rejected(e.to_string())),
        }
    }

    async fn register_intent_listener(
        &self,
        registration: IntentRegistration,
    ) -> Result<SubscriptionId, PlatformError> {
        let (registry, changed) = self.registry_for(&registration.owner);
        let entry = registry
            .add_intent(
                &registration.intent,
                registration.context_types,
                registration.handler,
            )
            .map_err(|e| PlatformError::Rejected(e.to_string()))?;
        let id = self.next_subscription();
        self.lock().subscriptions.insert(id, (registry, entry));
        changed.notify_waiters();
        Ok(id)
    }

    async fn register_context_listener(
        &self,
        registration: ContextRegistration,
    ) -> Result<SubscriptionId, PlatformError> {
        let registry = match &registration.owner {
            Some(owner) => self.registry_for(owner).0,
            None => Arc::clone(&self.lock().anonymous),
        };
        let entry = registry.add_context(registration.handler);
        let id = self.next_subscription();

        let initial = {
            let mut state = self.lock();
            state.subscriptions.insert(id, (Arc::clone(&registry), entry));
            registration.owner.as_ref().and_then(|owner| {
                state
                    .instances
                    .iter_mut()
                    .find(|h| h.instance == *owner)
                    .and_then(|h| h.initial_context.take())
            })
        };
        if let Some(context) = initial {
            registry.deliver_context_to(entry, &context, None);
        }
        Ok(id)
    }

    async fn broadcast(
        &self,
        context: &Context,
        from: Option<&ApplicationInstance>,
    ) -> Result<(), PlatformError> {
        let targets: Vec<Arc<ListenerRegistry>> = {
            let state = self.lock();
            state
                .instances
                .iter()
                .filter(|h| from != Some(&h.instance))
                .map(|h| Arc::clone(&h.listeners))
                .chain(std::iter::once(Arc::clone(&state.anonymous)))
                .collect()
        };
        let delivered: usize = targets
            .iter()
            .map(|registry| registry.deliver_context(context, from))
            .sum();
        tracing::debug!(platform = %self.inner.name, delivered, "context broadcast");
        Ok(())
    }

    async fn unregister(&self, id: SubscriptionId) -> Result<(), PlatformError> {
        if let Some((registry, entry)) = self.lock().subscriptions.remove(&id) {
            registry.remove(entry);
        }
        Ok(())
    }

    fn health(&self) -> Option<watch::Receiver<PlatformHealth>> {
        Some(self.inner.health.subscribe())
    }
}
