//! Resolution — concurrent fan-out of queries and candidate merging.
//!
//! Each online platform is queried concurrently under its own timeout.
//! Results merge in registration order, regardless of completion order.
//! Within one platform, duplicates (same intent, app and instance) are
//! suppressed; the same app reported by two platforms is kept twice.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio_util::sync::CancellationToken;

use crate::error::{PlatformFailure, ResolveError};
use crate::model::{Application, Context, IntentHandler, IntentList};
use crate::platform::{PlatformAdapter, PlatformError};

use super::Engine;

/// A resolution request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// Handlers for one intent, optionally filtered by context.
    Intent {
        intent: String,
        context: Option<Context>,
    },
    /// Every intent some handler can service with this context.
    Context(Context),
    /// Every intent some handler can service with any of these types.
    ContextTypes(Vec<String>),
}

impl Query {
    /// Reject malformed requests before any platform is contacted.
    pub fn validate(&self) -> Result<(), ResolveError> {
        match self {
            Query::Intent { intent, context } => {
                if intent.is_empty() {
                    return Err(ResolveError::InvalidInput("intent name is empty".to_string()));
                }
                if let Some(context) = context {
                    context.validate()?;
                }
            }
            Query::Context(context) => context.validate()?,
            Query::ContextTypes(types) => {
                if types.is_empty() || types.iter().any(String::is_empty) {
                    return Err(ResolveError::InvalidInput(
                        "context type list is empty".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        match self {
            Query::Intent { .. } => "intent",
            Query::Context(_) => "context",
            Query::ContextTypes(_) => "context_type",
        }
    }

    async fn run(&self, adapter: &dyn PlatformAdapter) -> Result<Vec<IntentList>, PlatformError> {
        match self {
            Query::Intent { intent, context } => {
                adapter.resolve_by_intent(intent, context.as_ref()).await
            }
            Query::Context(context) => adapter.resolve_by_context(context).await,
            Query::ContextTypes(types) => adapter.resolve_by_context_type(types).await,
        }
    }
}

/// Merged candidates plus the platforms that contributed nothing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Resolution {
    pub intents: Vec<IntentList>,
    pub failures: Vec<PlatformFailure>,
}

impl Resolution {
    /// The candidate list for one intent.
    pub fn for_intent(&self, intent: &str) -> Option<&IntentList> {
        self.intents.iter().find(|l| l.intent == intent)
    }

    pub fn candidates(&self) -> impl Iterator<Item = &IntentHandler> {
        self.intents.iter().flat_map(IntentList::candidates)
    }

    pub fn failed_platforms(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.platform.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.intents.iter().map(IntentList::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Append-only merge with per-platform duplicate suppression.
#[derive(Default)]
struct Merger {
    intents: Vec<IntentList>,
    seen: HashSet<(String, (String, String, Option<String>))>,
}

impl Merger {
    fn add(&mut self, lists: Vec<IntentList>) {
        for list in lists {
            let IntentList {
                intent,
                applications,
                instances,
            } = list;
            for handler in instances.into_iter().chain(applications) {
                if !self.seen.insert((intent.clone(), handler.dedup_key())) {
                    continue;
                }
                match self.intents.iter_mut().find(|l| l.intent == intent) {
                    Some(existing) => existing.push(handler),
                    None => self.intents.push(IntentList::new(intent.as_str()).with(handler)),
                }
            }
        }
    }
}

impl Engine {
    pub async fn resolve_by_intent(
        &self,
        intent: &str,
        context: Option<&Context>,
    ) -> Result<Resolution, ResolveError> {
        let query = Query::Intent {
            intent: intent.to_string(),
            context: context.cloned(),
        };
        self.resolve_with(query, &CancellationToken::new()).await
    }

    pub async fn resolve_by_context(&self, context: &Context) -> Result<Resolution, ResolveError> {
        self.resolve_with(Query::Context(context.clone()), &CancellationToken::new())
            .await
    }

    pub async fn resolve_by_context_type(
        &self,
        types: &[String],
    ) -> Result<Resolution, ResolveError> {
        self.resolve_with(Query::ContextTypes(types.to_vec()), &CancellationToken::new())
            .await
    }

    /// Fan a query out to every online platform.
    ///
    /// Cancelling `cancel` stops waiting for outstanding platforms and
    /// returns [`ResolveError::Cancelled`]; dropping the future has the
    /// same effect.
    pub async fn resolve_with(
        &self,
        query: Query,
        cancel: &CancellationToken,
    ) -> Result<Resolution, ResolveError> {
        query.validate()?;

        let snapshot = self.inner.registry.snapshot();
        let mut failures: Vec<PlatformFailure> = Vec::new();
        let mut online: Vec<Arc<dyn PlatformAdapter>> = Vec::new();
        for platform in snapshot {
            if platform.online {
                online.push(platform.adapter);
            } else {
                failures.push(PlatformFailure::offline(platform.adapter.name(), platform.status));
            }
        }
        if online.is_empty() {
            tracing::warn!(query = query.kind(), "no platform online to resolve against");
            return Err(ResolveError::ResolverUnavailable { failures });
        }

        let timeout = self.inner.config.query_timeout;
        let query = Arc::new(query);
        let mut pending: FuturesUnordered<_> = online
            .iter()
            .enumerate()
            .map(|(idx, adapter)| {
                let query = Arc::clone(&query);
                let adapter = Arc::clone(adapter);
                async move {
                    let outcome = tokio::time::timeout(timeout, query.run(adapter.as_ref())).await;
                    (idx, outcome)
                }
            })
            .collect();

        let mut replies: Vec<Option<Result<Vec<IntentList>, PlatformFailure>>> = vec![None; online.len()];
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(query = query.kind(), outstanding = pending.len(), "resolution cancelled");
                    return Err(ResolveError::Cancelled);
                }
                next = pending.next() => {
                    let Some((idx, outcome)) = next else { break };
                    let name = online[idx].name();
                    replies[idx] = Some(match outcome {
                        Ok(Ok(lists)) => Ok(owned_by(lists, name)),
                        Ok(Err(e)) => {
                            tracing::warn!(platform = name, error = %e, "platform query failed");
                            Err(PlatformFailure::error(name, e.to_string()))
                        }
                        Err(_) => {
                            tracing::warn!(platform = name, ?timeout, "platform query timed out");
                            Err(PlatformFailure::timeout(name))
                        }
                    });
                }
            }
        }

        let mut merger = Merger::default();
        let mut queried_failures = Vec::new();
        for reply in replies.into_iter().flatten() {
            match reply {
                Ok(lists) => merger.add(lists),
                Err(failure) => queried_failures.push(failure),
            }
        }

        let all_failed = queried_failures.len() == online.len();
        let all_timed_out = queried_failures.iter().all(PlatformFailure::is_timeout);
        failures.extend(queried_failures);
        if all_failed {
            return Err(if all_timed_out {
                ResolveError::ResolverTimeout { failures }
            } else {
                ResolveError::ResolverUnavailable { failures }
            });
        }

        let mut resolution = Resolution {
            intents: merger.intents,
            failures,
        };
        if resolution.is_empty() {
            return Err(ResolveError::NoAppsFound {
                failures: resolution.failures,
            });
        }
        self.enrich(&mut resolution).await;

        tracing::debug!(
            query = query.kind(),
            candidates = resolution.len(),
            failed = resolution.failures.len(),
            "resolution complete"
        );
        Ok(resolution)
    }

    /// Check an explicit target locally, without contacting any platform.
    pub fn resolve_target(
        &self,
        intent: &str,
        context: &Context,
        target: &IntentHandler,
    ) -> Result<(), ResolveError> {
        if intent.is_empty() {
            return Err(ResolveError::InvalidInput("intent name is empty".to_string()));
        }
        context.validate()?;
        if !target.context_types.accepts(context) {
            return Err(ResolveError::UnsupportedContext {
                target: target.to_string(),
                offered: context.types().into_iter().collect::<Vec<_>>().join(","),
                declared: target.context_types.clone(),
            });
        }
        Ok(())
    }

    /// Fill in application metadata from the directory, best-effort.
    async fn enrich(&self, resolution: &mut Resolution) {
        let registry = &self.inner.registry;
        let apps: Vec<(&mut Application, u64)> = resolution
            .intents
            .iter_mut()
            .flat_map(|list| list.instances.iter_mut().chain(list.applications.iter_mut()))
            .map(IntentHandler::application_mut)
            .filter_map(|app| {
                let generation = registry.generation(&app.platform_name)?;
                Some((app, generation))
            })
            .collect();
        self.inner.cache.enrich(apps, self.inner.config.query_timeout).await;
    }
}

/// Attribute every candidate to the platform that answered.
fn owned_by(mut lists: Vec<IntentList>, platform: &str) -> Vec<IntentList> {
    for handler in lists
        .iter_mut()
        .flat_map(|list| list.instances.iter_mut().chain(list.applications.iter_mut()))
    {
        handler.application_mut().platform_name = platform.to_string();
    }
    lists
}
