//! Dispatch — invoke exactly one handler per raised intent.
//!
//! A raise performs at most one side-effecting action: either delivery
//! to a running instance, or a launch followed by delivery to the new
//! instance. Launches run in a detached task so that a caller giving up
//! never leaves a half-started application behind; delivery to a
//! launched app only begins after its instance has registered.

use std::sync::Arc;

use crate::error::{DispatchError, OpenError, ResolveError};
use crate::model::{
    Application, ApplicationInstance, Context, HandlerTarget, IntentHandler, IntentList,
    IntentResult,
};
use crate::platform::{IntentRequest, PlatformAdapter};

use super::Engine;

/// What a raise produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaiseOutcome {
    /// Exactly one handler ran.
    Resolved(IntentResult),
    /// Several candidates qualify; the caller must pick one and raise
    /// again with it as the explicit target.
    SelectionRequired(IntentList),
}

impl Engine {
    /// Raise an intent on behalf of this engine's own identity.
    pub async fn raise_intent(
        &self,
        intent: &str,
        context: &Context,
        target: Option<&IntentHandler>,
    ) -> Result<RaiseOutcome, DispatchError> {
        self.raise_intent_from(None, intent, context, target).await
    }

    /// Raise an intent on behalf of `caller`.
    ///
    /// With an explicit `target` no platform is queried; the target's
    /// declared context types are checked locally and the intent is
    /// dispatched to it directly.
    pub async fn raise_intent_from(
        &self,
        caller: Option<&ApplicationInstance>,
        intent: &str,
        context: &Context,
        target: Option<&IntentHandler>,
    ) -> Result<RaiseOutcome, DispatchError> {
        let handler = match target {
            Some(target) => {
                self.resolve_target(intent, context, target)?;
                self.placed(target.clone())?
            }
            None => {
                let resolution = self.resolve_by_intent(intent, Some(context)).await?;
                let mut list = resolution
                    .intents
                    .into_iter()
                    .find(|l| l.intent == intent)
                    .unwrap_or_else(|| IntentList::new(intent));
                match list.len() {
                    0 => {
                        return Err(ResolveError::NoAppsFound {
                            failures: resolution.failures,
                        }
                        .into());
                    }
                    1 => match list.instances.pop() {
                        Some(handler) => handler,
                        None => list.applications.remove(0),
                    },
                    n => {
                        tracing::debug!(intent, candidates = n, "selection required");
                        return Ok(RaiseOutcome::SelectionRequired(list));
                    }
                }
            }
        };

        self.dispatch(intent, context, handler, caller)
            .await
            .map(RaiseOutcome::Resolved)
    }

    /// Invoke one handler, launching its application first if needed.
    async fn dispatch(
        &self,
        intent: &str,
        context: &Context,
        handler: IntentHandler,
        caller: Option<&ApplicationInstance>,
    ) -> Result<IntentResult, DispatchError> {
        let platform = handler.platform().to_string();
        let adapter = self.adapter_for(&platform)?;

        let IntentHandler {
            target,
            context_types,
            method,
        } = handler;
        let instance = match target {
            HandlerTarget::Instance { instance } => instance,
            HandlerTarget::Application { application } => {
                let instance = self
                    .launch(Arc::clone(&adapter), application, None, None)
                    .await?;
                tracing::debug!(intent, instance = %instance, "launched instance registered");
                instance
            }
        };

        let target_name = instance.to_string();
        let request = IntentRequest {
            intent: intent.to_string(),
            context: context.clone(),
            target: IntentHandler {
                target: HandlerTarget::Instance { instance },
                context_types,
                method,
            },
            caller: caller.cloned(),
        };
        let timeout = self.inner.config.delivery_timeout;
        match tokio::time::timeout(timeout, adapter.raise_intent(request)).await {
            Ok(Ok(result)) => {
                tracing::info!(intent, target = %target_name, "intent delivered");
                Ok(result)
            }
            Ok(Err(e)) => {
                tracing::warn!(intent, target = %target_name, error = %e, "intent delivery failed");
                Err(DispatchError::Platform {
                    platform,
                    detail: e.to_string(),
                })
            }
            Err(_) => {
                tracing::warn!(intent, target = %target_name, ?timeout, "intent delivery timed out");
                Err(DispatchError::Timeout {
                    target: target_name,
                    timeout,
                })
            }
        }
    }

    /// Launch through the owning adapter and wait for registration.
    ///
    /// The launch itself runs on its own task; timing out here stops the
    /// wait, not the launch.
    async fn launch(
        &self,
        adapter: Arc<dyn PlatformAdapter>,
        app: Application,
        context: Option<Context>,
        config: Option<String>,
    ) -> Result<ApplicationInstance, OpenError> {
        let key = app.key().to_string();
        let timeout = self.inner.config.launch_timeout;
        let task = tokio::spawn(async move {
            adapter
                .open(&app, context.as_ref(), config.as_deref())
                .await
        });
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(OpenError::ErrorOnLaunch {
                app: key,
                detail: join.to_string(),
            }),
            Err(_) => {
                tracing::warn!(app = %key, ?timeout, "launch did not register in time");
                Err(OpenError::AppTimeout { app: key, timeout })
            }
        }
    }

    /// Online adapter for `platform`.
    fn adapter_for(&self, platform: &str) -> Result<Arc<dyn PlatformAdapter>, DispatchError> {
        match self.inner.registry.get(platform) {
            None => Err(DispatchError::UnknownPlatform(platform.to_string())),
            Some((_, false)) => Err(DispatchError::PlatformNotConnected(platform.to_string())),
            Some((adapter, true)) => Ok(adapter),
        }
    }

    /// The platform an application call routes to.
    /// A target naming no platform is placed on the default platform.
    fn placed(&self, mut handler: IntentHandler) -> Result<IntentHandler, DispatchError> {
        let app = handler.application_mut();
        app.platform_name = self.platform_of(app)?;
        Ok(handler)
    }

    fn platform_of(&self, app: &Application) -> Result<String, DispatchError> {
        if !app.platform_name.is_empty() {
            return Ok(app.platform_name.clone());
        }
        self.inner
            .config
            .default_platform
            .clone()
            .ok_or_else(|| DispatchError::InvalidInput(format!("{} names no platform", app.key())))
    }

    // -- Pass-through --

    /// Launch an application on its owning platform.
    pub async fn open(
        &self,
        app: &Application,
        context: Option<&Context>,
        config: Option<&str>,
    ) -> Result<ApplicationInstance, DispatchError> {
        if app.key().is_empty() {
            return Err(DispatchError::InvalidInput(
                "application has neither id nor name".to_string(),
            ));
        }
        if let Some(context) = context {
            context.validate()?;
        }
        let platform = self.platform_of(app)?;
        let adapter = self
            .adapter_for(&platform)
            .map_err(|e| OpenError::ResolverUnavailable(e.to_string()))?;
        let mut app = app.clone();
        app.platform_name = platform;
        let instance = self
            .launch(adapter, app, context.cloned(), config.map(str::to_string))
            .await?;
        tracing::info!(instance = %instance, "application opened");
        Ok(instance)
    }

    pub async fn list_instances(
        &self,
        app: &Application,
    ) -> Result<Vec<ApplicationInstance>, DispatchError> {
        let platform = self.platform_of(app)?;
        let adapter = self.adapter_for(&platform)?;
        self.bounded(&platform, adapter.list_instances(app)).await
    }

    pub async fn activate_instance(&self, instance: &ApplicationInstance) -> Result<(), DispatchError> {
        let adapter = self.adapter_for(instance.platform())?;
        self.bounded(instance.platform(), adapter.activate_instance(instance))
            .await
    }

    async fn bounded<T, F>(&self, platform: &str, call: F) -> Result<T, DispatchError>
    where
        F: Future<Output = Result<T, crate::platform::PlatformError>>,
    {
        let timeout = self.inner.config.query_timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(DispatchError::Platform {
                platform: platform.to_string(),
                detail: e.to_string(),
            }),
            Err(_) => Err(DispatchError::Timeout {
                target: platform.to_string(),
                timeout,
            }),
        }
    }
}
