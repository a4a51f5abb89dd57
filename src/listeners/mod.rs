//! Listener registry — intent and context subscriptions for one scope.
//!
//! A registry holds two independent subscription kinds:
//!
//! - intent listeners, keyed by intent name and a context-type set.
//!   Within one registry, listeners for the same intent must declare
//!   disjoint type sets so that routing is never ambiguous;
//! - context listeners, which receive every context delivered to the
//!   registry.
//!
//! Delivery runs handlers in registration order. Each handler is
//! isolated: an `Err` or a panic is logged and the remaining handlers
//! still run. The registry is used both by the engine (one registry per
//! platform scope) and by the hosted platform (one per instance).

pub mod handle;

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::model::{ApplicationInstance, Context, ContextTypes};

pub use handle::{Listener, ListenerKind};

/// Failure reported by a subscriber's handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Callback receiving broadcast contexts and the sending instance, if known.
pub type ContextCallback =
    Arc<dyn Fn(&Context, Option<&ApplicationInstance>) -> Result<(), HandlerError> + Send + Sync>;

/// Callback servicing a raised intent. May return a result context.
pub type IntentCallback = Arc<
    dyn Fn(IntentInvocation) -> BoxFuture<'static, Result<Option<Context>, HandlerError>>
        + Send
        + Sync,
>;

/// Wrap a closure as a [`ContextCallback`].
pub fn context_handler<F>(f: F) -> ContextCallback
where
    F: Fn(&Context, Option<&ApplicationInstance>) -> Result<(), HandlerError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// Wrap an async closure as an [`IntentCallback`].
pub fn intent_handler<F, Fut>(f: F) -> IntentCallback
where
    F: Fn(IntentInvocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Context>, HandlerError>> + Send + 'static,
{
    Arc::new(move |invocation| f(invocation).boxed())
}

/// A raised intent on its way to a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentInvocation {
    pub intent: String,
    pub context: Context,
    pub caller: Option<ApplicationInstance>,
}

/// Identifier of one registry entry.
///
/// Process-wide monotonically increasing, so ids from different
/// registries never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl EntryId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// Subscription errors, reported at subscribe time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    #[error("intent name must not be empty")]
    EmptyIntent,
    #[error("listener for {intent} on {scope} overlaps existing context types [{existing}]")]
    Overlap {
        intent: String,
        scope: String,
        existing: ContextTypes,
    },
    #[error("no platform given and no default platform configured")]
    NoPlatform,
    #[error("unknown platform: {0}")]
    UnknownPlatform(String),
    #[error("platform {0} is not connected")]
    PlatformNotConnected(String),
    #[error("platform {platform} rejected the subscription: {detail}")]
    Platform { platform: String, detail: String },
}

/// Intent routing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("no listener for {intent} accepts [{offered}]")]
    NoListener { intent: String, offered: String },
    #[error("listener is no longer subscribed")]
    Unsubscribed,
    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),
    #[error("handler panicked")]
    Panicked,
}

struct IntentEntry {
    id: EntryId,
    intent: String,
    context_types: ContextTypes,
    handler: IntentCallback,
    active: Arc<AtomicBool>,
}

struct ContextEntry {
    id: EntryId,
    handler: ContextCallback,
    active: Arc<AtomicBool>,
}

#[derive(Default)]
struct Entries {
    intents: Vec<IntentEntry>,
    contexts: Vec<ContextEntry>,
}

/// Subscription table for one scope.
///
/// All mutation and snapshotting happens under a single mutex; handlers
/// are always invoked after the lock is released.
pub struct ListenerRegistry {
    scope: String,
    entries: Mutex<Entries>,
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.lock();
        f.debug_struct("ListenerRegistry")
            .field("scope", &self.scope)
            .field("intents", &entries.intents.len())
            .field("contexts", &entries.contexts.len())
            .finish()
    }
}

impl ListenerRegistry {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            entries: Mutex::new(Entries::default()),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an intent listener.
    ///
    /// Rejects a registration whose context types overlap an existing
    /// listener for the same intent.
    pub fn add_intent(
        &self,
        intent: &str,
        context_types: ContextTypes,
        handler: IntentCallback,
    ) -> Result<EntryId, SubscribeError> {
        if intent.is_empty() {
            return Err(SubscribeError::EmptyIntent);
        }
        let mut entries = self.lock();
        if let Some(existing) = entries
            .intents
            .iter()
            .find(|e| e.intent == intent && e.context_types.overlaps(&context_types))
        {
            return Err(SubscribeError::Overlap {
                intent: intent.to_string(),
                scope: self.scope.clone(),
                existing: existing.context_types.clone(),
            });
        }
        let id = EntryId::next();
        entries.intents.push(IntentEntry {
            id,
            intent: intent.to_string(),
            context_types,
            handler,
            active: Arc::new(AtomicBool::new(true)),
        });
        tracing::debug!(scope = %self.scope, intent, entry = id.0, "intent listener added");
        Ok(id)
    }

    /// Register a context listener.
    pub fn add_context(&self, handler: ContextCallback) -> EntryId {
        let id = EntryId::next();
        self.lock().contexts.push(ContextEntry {
            id,
            handler,
            active: Arc::new(AtomicBool::new(true)),
        });
        tracing::debug!(scope = %self.scope, entry = id.0, "context listener added");
        id
    }

    /// Remove an entry. Returns `false` if it was already gone.
    ///
    /// Once this returns, the entry's handler is never invoked again.
    pub fn remove(&self, id: EntryId) -> bool {
        let mut entries = self.lock();
        if let Some(pos) = entries.intents.iter().position(|e| e.id == id) {
            let entry = entries.intents.remove(pos);
            entry.active.store(false, Ordering::Release);
            return true;
        }
        if let Some(pos) = entries.contexts.iter().position(|e| e.id == id) {
            let entry = entries.contexts.remove(pos);
            entry.active.store(false, Ordering::Release);
            return true;
        }
        false
    }

    /// Remove every entry, e.g. when the owning instance goes away.
    pub fn clear(&self) {
        let mut entries = self.lock();
        for e in entries.intents.drain(..) {
            e.active.store(false, Ordering::Release);
        }
        for e in entries.contexts.drain(..) {
            e.active.store(false, Ordering::Release);
        }
    }

    pub fn contains(&self, id: EntryId) -> bool {
        let entries = self.lock();
        entries.intents.iter().any(|e| e.id == id) || entries.contexts.iter().any(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        let entries = self.lock();
        entries.intents.len() + entries.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn context_listener_count(&self) -> usize {
        self.lock().contexts.len()
    }

    /// Snapshot of `(intent, context types)` for every intent listener.
    pub fn intent_declarations(&self) -> Vec<(String, ContextTypes)> {
        self.lock()
            .intents
            .iter()
            .map(|e| (e.intent.clone(), e.context_types.clone()))
            .collect()
    }

    /// Whether some listener would accept `intent` with `context`.
    pub fn accepts_intent(&self, intent: &str, context: &Context) -> bool {
        self.lock()
            .intents
            .iter()
            .any(|e| e.intent == intent && e.context_types.accepts(context))
    }

    // -- Context delivery --

    /// Deliver a context to every context listener, in registration order.
    ///
    /// Returns the number of handlers that completed without error.
    pub fn deliver_context(&self, context: &Context, from: Option<&ApplicationInstance>) -> usize {
        let snapshot: Vec<(EntryId, ContextCallback, Arc<AtomicBool>)> = self
            .lock()
            .contexts
            .iter()
            .map(|e| (e.id, Arc::clone(&e.handler), Arc::clone(&e.active)))
            .collect();

        snapshot
            .iter()
            .filter(|(id, handler, active)| {
                invoke_context(&self.scope, *id, handler, active, context, from)
            })
            .count()
    }

    /// Deliver a context to one specific listener.
    ///
    /// Returns `false` if the listener is gone or its handler failed.
    pub fn deliver_context_to(
        &self,
        id: EntryId,
        context: &Context,
        from: Option<&ApplicationInstance>,
    ) -> bool {
        let found = self
            .lock()
            .contexts
            .iter()
            .find(|e| e.id == id)
            .map(|e| (Arc::clone(&e.handler), Arc::clone(&e.active)));
        match found {
            Some((handler, active)) => invoke_context(&self.scope, id, &handler, &active, context, from),
            None => false,
        }
    }

    // -- Intent delivery --

    /// Route an intent to the listener whose name and types match.
    ///
    /// Disjoint registration guarantees at most one match.
    pub async fn deliver_intent(
        &self,
        invocation: IntentInvocation,
    ) -> Result<Option<Context>, DeliveryError> {
        let found = self
            .lock()
            .intents
            .iter()
            .find(|e| e.intent == invocation.intent && e.context_types.accepts(&invocation.context))
            .map(|e| (e.id, Arc::clone(&e.handler), Arc::clone(&e.active)));

        match found {
            Some((id, handler, active)) => {
                invoke_intent(&self.scope, id, handler, &active, invocation).await
            }
            None => Err(DeliveryError::NoListener {
                offered: invocation
                    .context
                    .types()
                    .into_iter()
                    .collect::<Vec<_>>()
                    .join(","),
                intent: invocation.intent,
            }),
        }
    }

    /// Route an intent to one specific listener.
    pub async fn deliver_intent_to(
        &self,
        id: EntryId,
        invocation: IntentInvocation,
    ) -> Result<Option<Context>, DeliveryError> {
        let found = self
            .lock()
            .intents
            .iter()
            .find(|e| e.id == id)
            .map(|e| (Arc::clone(&e.handler), Arc::clone(&e.active)));
        match found {
            Some((handler, active)) => {
                invoke_intent(&self.scope, id, handler, &active, invocation).await
            }
            None => Err(DeliveryError::Unsubscribed),
        }
    }
}

fn invoke_context(
    scope: &str,
    id: EntryId,
    handler: &ContextCallback,
    active: &AtomicBool,
    context: &Context,
    from: Option<&ApplicationInstance>,
) -> bool {
    if !active.load(Ordering::Acquire) {
        return false;
    }
    match std::panic::catch_unwind(AssertUnwindSafe(|| handler(context, from))) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::warn!(scope, entry = id.0, error = %e, "context listener failed");
            false
        }
        Err(_) => {
            tracing::warn!(scope, entry = id.0, "context listener panicked");
            false
        }
    }
}

async fn invoke_intent(
    scope: &str,
    id: EntryId,
    handler: IntentCallback,
    active: &AtomicBool,
    invocation: IntentInvocation,
) -> Result<Option<Context>, DeliveryError> {
    if !active.load(Ordering::Acquire) {
        return Err(DeliveryError::Unsubscribed);
    }
    tracing::trace!(scope, entry = id.0, intent = %invocation.intent, "invoking intent listener");

    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(invocation))) {
        Ok(future) => future,
        Err(_) => {
            tracing::warn!(scope, entry = id.0, "intent listener panicked");
            return Err(DeliveryError::Panicked);
        }
    };
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(data)) => Ok(data),
        Ok(Err(e)) => {
            tracing::warn!(scope, entry = id.0, error = %e, "intent listener failed");
            Err(DeliveryError::Handler(e))
        }
        Err(_) => {
            tracing::warn!(scope, entry = id.0, "intent listener panicked");
            Err(DeliveryError::Panicked)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::model::{ContextData, Instrument, Organization};

    fn instrument_ctx() -> Context {
        Context::single(ContextData::Instrument(Instrument {
            ticker: Some("AAPL".into()),
            ..Default::default()
        }))
    }

    fn org_ctx() -> Context {
        Context::single(ContextData::Organization(Organization::default()))
    }

    fn echo() -> IntentCallback {
        intent_handler(|inv: IntentInvocation| async move { Ok(Some(inv.context)) })
    }

    fn counting(counter: &Arc<AtomicUsize>) -> ContextCallback {
        let counter = Arc::clone(counter);
        context_handler(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn invocation(intent: &str, context: Context) -> IntentInvocation {
        IntentInvocation {
            intent: intent.into(),
            context,
            caller: None,
        }
    }

    // -- Registration --

    #[test]
    fn overlapping_intent_listeners_rejected() {
        let reg = ListenerRegistry::new("A");
        reg.add_intent("ViewChart", ContextTypes::of(["fdc3.instrument"]), echo())
            .unwrap();
        let err = reg
            .add_intent(
                "ViewChart",
                ContextTypes::of(["fdc3.instrument", "fdc3.contact"]),
                echo(),
            )
            .unwrap_err();
        assert!(matches!(err, SubscribeError::Overlap { ref intent, .. } if intent == "ViewChart"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn wildcard_overlaps_everything() {
        let reg = ListenerRegistry::new("A");
        reg.add_intent("ViewChart", ContextTypes::Any, echo()).unwrap();
        assert!(
            reg.add_intent("ViewChart", ContextTypes::of(["fdc3.contact"]), echo())
                .is_err()
        );
    }

    #[test]
    fn disjoint_and_other_intents_allowed() {
        let reg = ListenerRegistry::new("A");
        reg.add_intent("ViewChart", ContextTypes::of(["fdc3.instrument"]), echo())
            .unwrap();
        reg.add_intent("ViewChart", ContextTypes::of(["fdc3.organization"]), echo())
            .unwrap();
        reg.add_intent("ViewNews", ContextTypes::Any, echo()).unwrap();
        assert_eq!(reg.intent_declarations().len(), 3);
    }

    #[test]
    fn empty_intent_name_rejected() {
        let reg = ListenerRegistry::new("A");
        assert_eq!(
            reg.add_intent("", ContextTypes::Any, echo()).unwrap_err(),
            SubscribeError::EmptyIntent
        );
    }

    #[test]
    fn remove_is_idempotent() {
        let reg = ListenerRegistry::new("A");
        let id = reg.add_context(context_handler(|_, _| Ok(())));
        assert!(reg.remove(id));
        assert!(!reg.remove(id));
        assert!(reg.is_empty());
    }

    // -- Context delivery --

    #[test]
    fn context_delivered_to_all_in_order() {
        let reg = ListenerRegistry::new("A");
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = Arc::clone(&order);
            reg.add_context(context_handler(move |_, _| {
                order.lock().unwrap().push(n);
                Ok(())
            }));
        }
        assert_eq!(reg.deliver_context(&instrument_ctx(), None), 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn failing_and_panicking_listeners_are_isolated() {
        let reg = ListenerRegistry::new("A");
        let counter = Arc::new(AtomicUsize::new(0));
        reg.add_context(counting(&counter));
        reg.add_context(context_handler(|_, _| Err(HandlerError::new("boom"))));
        reg.add_context(context_handler(|_, _| panic!("listener bug")));
        reg.add_context(counting(&counter));

        let delivered = reg.deliver_context(&instrument_ctx(), None);
        assert_eq!(delivered, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn removed_listener_receives_nothing() {
        let reg = ListenerRegistry::new("A");
        let counter = Arc::new(AtomicUsize::new(0));
        let id = reg.add_context(counting(&counter));
        reg.remove(id);
        reg.deliver_context(&instrument_ctx(), None);
        assert!(!reg.deliver_context_to(id, &instrument_ctx(), None));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    // -- Intent delivery --

    #[tokio::test]
    async fn intent_routed_by_context_type() {
        let reg = ListenerRegistry::new("A");
        reg.add_intent(
            "ViewChart",
            ContextTypes::of(["fdc3.instrument"]),
            intent_handler(|_| async { Ok(Some(instrument_ctx())) }),
        )
        .unwrap();
        reg.add_intent(
            "ViewChart",
            ContextTypes::of(["fdc3.organization"]),
            intent_handler(|_| async { Ok(Some(org_ctx())) }),
        )
        .unwrap();

        let out = reg
            .deliver_intent(invocation("ViewChart", org_ctx()))
            .await
            .unwrap();
        assert_eq!(out, Some(org_ctx()));
    }

    #[tokio::test]
    async fn intent_without_matching_listener() {
        let reg = ListenerRegistry::new("A");
        reg.add_intent("ViewChart", ContextTypes::of(["fdc3.instrument"]), echo())
            .unwrap();
        let err = reg
            .deliver_intent(invocation("ViewChart", org_ctx()))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::NoListener { .. }));
        assert!(!reg.accepts_intent("ViewChart", &org_ctx()));
        assert!(reg.accepts_intent("ViewChart", &instrument_ctx()));
    }

    #[tokio::test]
    async fn intent_handler_panic_is_contained() {
        let reg = ListenerRegistry::new("A");
        let id = reg
            .add_intent(
                "Crash",
                ContextTypes::Any,
                intent_handler(|_| async { panic!("handler bug") }),
            )
            .unwrap();
        let err = reg
            .deliver_intent_to(id, invocation("Crash", instrument_ctx()))
            .await
            .unwrap_err();
        assert_eq!(err, DeliveryError::Panicked);
    }

    #[tokio::test]
    async fn deliver_to_removed_intent_listener() {
        let reg = ListenerRegistry::new("A");
        let id = reg.add_intent("ViewChart", ContextTypes::Any, echo()).unwrap();
        reg.clear();
        let err = reg
            .deliver_intent_to(id, invocation("ViewChart", instrument_ctx()))
            .await
            .unwrap_err();
        assert_eq!(err, DeliveryError::Unsubscribed);
    }
}
