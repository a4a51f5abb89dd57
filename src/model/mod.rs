//! Canonical data model shared by the engine, adapters and the IPC layer.
//!
//! Applications and instances are owned by the platform that reports
//! them; the engine only holds copies.

pub mod context;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SendError;

pub use context::{
    Contact, Context, ContextData, ContextError, ContextItem, ContextTypes, Instrument,
    Organization,
};

/// Read-only descriptor of a connected platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub name: String,
    pub version: String,
    pub online: bool,
    /// Human-readable connection status; carries the reason when offline.
    pub connection_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
}

/// An application known to a platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Application {
    /// App Directory identity. `None` for apps started outside a directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub platform_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_type: Option<String>,
}

impl Application {
    pub fn new(app_id: impl Into<String>, platform_name: impl Into<String>) -> Self {
        Self {
            app_id: Some(app_id.into()),
            name: None,
            platform_name: platform_name.into(),
            app_type: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Stable per-platform key: the directory id, falling back to the name.
    pub fn key(&self) -> &str {
        self.app_id
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or_default()
    }

    /// Whether `name_or_id` refers to this application.
    pub fn matches(&self, name_or_id: &str) -> bool {
        self.app_id.as_deref() == Some(name_or_id) || self.name.as_deref() == Some(name_or_id)
    }
}

impl fmt::Display for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key(), self.platform_name)
    }
}

/// A running copy of an application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApplicationInstance {
    pub app: Application,
    /// Distinguishes multiple running copies. Empty for singleton apps.
    #[serde(default)]
    pub instance_id: String,
}

impl ApplicationInstance {
    pub fn new(app: Application, instance_id: impl Into<String>) -> Self {
        Self {
            app,
            instance_id: instance_id.into(),
        }
    }

    pub fn platform(&self) -> &str {
        &self.app.platform_name
    }
}

impl fmt::Display for ApplicationInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.instance_id.is_empty() {
            write!(f, "{}", self.app)
        } else {
            write!(f, "{}#{}", self.app, self.instance_id)
        }
    }
}

/// Identity an engine presents when it subscribes on a platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    pub name: String,
    pub instance_id: String,
}

impl AppIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            app_id: None,
            name: name.into(),
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// The instance this identity represents on `platform`.
    pub fn instance_on(&self, platform: &str) -> ApplicationInstance {
        ApplicationInstance {
            app: Application {
                app_id: self.app_id.clone(),
                name: Some(self.name.clone()),
                platform_name: platform.to_string(),
                app_type: None,
            },
            instance_id: self.instance_id.clone(),
        }
    }
}

impl Default for AppIdentity {
    fn default() -> Self {
        Self::new("interop-client")
    }
}

/// What a candidate handler points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandlerTarget {
    /// Launchable, not yet running.
    Application { application: Application },
    /// Already running.
    Instance { instance: ApplicationInstance },
}

/// A candidate able to service an intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentHandler {
    pub target: HandlerTarget,
    pub context_types: ContextTypes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

impl IntentHandler {
    pub fn for_app(application: Application, context_types: ContextTypes) -> Self {
        Self {
            target: HandlerTarget::Application { application },
            context_types,
            method: None,
        }
    }

    pub fn for_instance(instance: ApplicationInstance, context_types: ContextTypes) -> Self {
        Self {
            target: HandlerTarget::Instance { instance },
            context_types,
            method: None,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    /// Name of the platform owning the target.
    pub fn platform(&self) -> &str {
        match &self.target {
            HandlerTarget::Application { application } => &application.platform_name,
            HandlerTarget::Instance { instance } => instance.platform(),
        }
    }

    /// The application behind the target, running or not.
    pub fn application_mut(&mut self) -> &mut Application {
        match &mut self.target {
            HandlerTarget::Application { application } => application,
            HandlerTarget::Instance { instance } => &mut instance.app,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.target, HandlerTarget::Instance { .. })
    }

    /// Merge key within one platform: app key, plus instance id if running.
    pub fn dedup_key(&self) -> (String, String, Option<String>) {
        match &self.target {
            HandlerTarget::Application { application } => (
                application.platform_name.clone(),
                application.key().to_string(),
                None,
            ),
            HandlerTarget::Instance { instance } => (
                instance.platform().to_string(),
                instance.app.key().to_string(),
                Some(instance.instance_id.clone()),
            ),
        }
    }
}

impl fmt::Display for IntentHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            HandlerTarget::Application { application } => write!(f, "app {application}"),
            HandlerTarget::Instance { instance } => write!(f, "instance {instance}"),
        }
    }
}

/// Candidates for one intent: launchable apps and running instances.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IntentList {
    pub intent: String,
    #[serde(default)]
    pub applications: Vec<IntentHandler>,
    #[serde(default)]
    pub instances: Vec<IntentHandler>,
}

impl IntentList {
    pub fn new(intent: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            applications: Vec::new(),
            instances: Vec::new(),
        }
    }

    /// Append a candidate to the sequence matching its target kind.
    pub fn push(&mut self, handler: IntentHandler) {
        if handler.is_running() {
            self.instances.push(handler);
        } else {
            self.applications.push(handler);
        }
    }

    pub fn with(mut self, handler: IntentHandler) -> Self {
        self.push(handler);
        self
    }

    /// Running instances first, then launchable applications.
    pub fn candidates(&self) -> impl Iterator<Item = &IntentHandler> {
        self.instances.iter().chain(self.applications.iter())
    }

    pub fn len(&self) -> usize {
        self.applications.len() + self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of a successful raise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentResult {
    /// The instance that handled the intent.
    pub instance: ApplicationInstance,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Context>,
}

/// Outcome of a broadcast, independent of how many listeners received it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastResult {
    pub success: bool,
    pub error: SendError,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

impl BroadcastResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: SendError::SendOk,
            error_msg: None,
        }
    }

    pub fn failed(error: SendError, detail: impl Into<String>) -> Self {
        Self {
            success: false,
            error,
            error_msg: Some(detail.into()),
        }
    }
}
