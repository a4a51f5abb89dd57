//! Platform adapter contract — the boundary to backing systems.
//!
//! A platform hosts applications and provides lookup, launch, intent and
//! broadcast primitives. Adapters are unreliable: any call may fail or
//! hang, and the engine wraps every call in its own timeout.

pub mod hosted;
pub mod launcher;
pub mod registry;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::OpenError;
use crate::listeners::{ContextCallback, IntentCallback};
use crate::model::{
    Application, ApplicationInstance, Context, ContextTypes, IntentHandler, IntentList,
    IntentResult,
};

pub use hosted::{AppDefinition, DeclaredIntent, HostedConfig, HostedPlatform};
pub use launcher::{
    FnLauncher, LaunchCommand, LaunchError, LaunchRequest, Launcher, NoLauncher, ProcessLauncher,
};
pub use registry::{PlatformRegistry, PlatformSnapshot};

/// Identifier of an adapter-side subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Health signal published by an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformHealth {
    Online,
    Offline { reason: String },
}

/// Static facts an adapter reports about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    pub version: String,
    pub config: Option<String>,
}

impl Default for PlatformInfo {
    fn default() -> Self {
        Self {
            version: "unknown".to_string(),
            config: None,
        }
    }
}

/// Adapter-side failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error("platform is offline: {0}")]
    Offline(String),
    #[error("unknown instance: {0}")]
    UnknownInstance(String),
    #[error("{0} is not running")]
    NotRunning(String),
    #[error("no handler for {intent}: {detail}")]
    NoHandler { intent: String, detail: String },
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// A raise routed to one specific candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentRequest {
    pub intent: String,
    pub context: Context,
    pub target: IntentHandler,
    pub caller: Option<ApplicationInstance>,
}

/// An intent subscription handed to an adapter.
#[derive(Clone)]
pub struct IntentRegistration {
    pub intent: String,
    pub context_types: ContextTypes,
    /// The instance that will service the intent.
    pub owner: ApplicationInstance,
    pub handler: IntentCallback,
}

/// A context subscription handed to an adapter.
#[derive(Clone)]
pub struct ContextRegistration {
    /// Owning instance. Broadcasts from the owner are not echoed back.
    pub owner: Option<ApplicationInstance>,
    pub handler: ContextCallback,
}

#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Unique platform name. Must be stable for the adapter's lifetime.
    fn name(&self) -> &str;

    fn describe(&self) -> PlatformInfo {
        PlatformInfo::default()
    }

    /// Launch `app`, returning once the new instance has registered.
    async fn open(
        &self,
        app: &Application,
        context: Option<&Context>,
        config: Option<&str>,
    ) -> Result<ApplicationInstance, OpenError>;

    async fn list_instances(
        &self,
        app: &Application,
    ) -> Result<Vec<ApplicationInstance>, PlatformError>;

    async fn activate_instance(&self, instance: &ApplicationInstance) -> Result<(), PlatformError>;

    async fn resolve_by_intent(
        &self,
        intent: &str,
        context: Option<&Context>,
    ) -> Result<Vec<IntentList>, PlatformError>;

    async fn resolve_by_context(&self, context: &Context) -> Result<Vec<IntentList>, PlatformError>;

    async fn resolve_by_context_type(
        &self,
        types: &[String],
    ) -> Result<Vec<IntentList>, PlatformError>;

    /// Deliver an intent to a running instance.
    async fn raise_intent(&self, request: IntentRequest) -> Result<IntentResult, PlatformError>;

    async fn register_intent_listener(
        &self,
        registration: IntentRegistration,
    ) -> Result<SubscriptionId, PlatformError>;

    async fn register_context_listener(
        &self,
        registration: ContextRegistration,
    ) -> Result<SubscriptionId, PlatformError>;

    async fn broadcast(
        &self,
        context: &Context,
        from: Option<&ApplicationInstance>,
    ) -> Result<(), PlatformError>;

    /// Drop a subscription. Unknown ids are not an error.
    async fn unregister(&self, id: SubscriptionId) -> Result<(), PlatformError>;

    /// Health stream, if the adapter publishes one.
    fn health(&self) -> Option<watch::Receiver<PlatformHealth>> {
        None
    }
}
