//! Caller-facing error taxonomy.
//!
//! Input errors are rejected before any platform is contacted. Partial
//! platform failures never surface here on their own; they are carried
//! in [`crate::engine::Resolution::failures`] or inside the total-failure
//! variants below.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::{ContextError, ContextTypes};

/// Status code attached to a [`crate::model::BroadcastResult`] and to
/// failed platform sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SendError {
    #[serde(rename = "OK")]
    SendOk,
    #[serde(rename = "Invalid Platform")]
    UnknownPlatform,
    #[serde(rename = "Platform Not connected")]
    PlatformNotConnected,
    #[serde(rename = "Platform Error")]
    PlatformError,
}

impl SendError {
    pub fn as_str(self) -> &'static str {
        match self {
            SendError::SendOk => "OK",
            SendError::UnknownPlatform => "Invalid Platform",
            SendError::PlatformNotConnected => "Platform Not connected",
            SendError::PlatformError => "Platform Error",
        }
    }
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a single platform contributed nothing to a fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// Known but offline; not queried.
    Offline { reason: String },
    Timeout,
    Error { detail: String },
}

/// A platform that failed during a fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformFailure {
    pub platform: String,
    pub kind: FailureKind,
}

impl PlatformFailure {
    pub fn timeout(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            kind: FailureKind::Timeout,
        }
    }

    pub fn offline(platform: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            kind: FailureKind::Offline {
                reason: reason.into(),
            },
        }
    }

    pub fn error(platform: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            kind: FailureKind::Error {
                detail: detail.into(),
            },
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, FailureKind::Timeout)
    }
}

impl fmt::Display for PlatformFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FailureKind::Offline { reason } => write!(f, "{}: offline ({reason})", self.platform),
            FailureKind::Timeout => write!(f, "{}: timed out", self.platform),
            FailureKind::Error { detail } => write!(f, "{}: {detail}", self.platform),
        }
    }
}

/// Failures as one `; `-separated line.
pub(crate) fn join_failures(failures: &[PlatformFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Resolution errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("invalid request: {0}")]
    InvalidInput(String),
    #[error("invalid context: {0}")]
    InvalidContext(#[from] ContextError),
    /// Every queried platform answered, but nobody can handle the request.
    #[error("no apps found")]
    NoAppsFound { failures: Vec<PlatformFailure> },
    /// No platform could be queried, or every queried platform failed.
    #[error("resolver unavailable{}", fmt_failures(.failures))]
    ResolverUnavailable { failures: Vec<PlatformFailure> },
    /// Every queried platform timed out.
    #[error("resolver timed out{}", fmt_failures(.failures))]
    ResolverTimeout { failures: Vec<PlatformFailure> },
    #[error("{target} does not accept context types [{offered}] (declares [{declared}])")]
    UnsupportedContext {
        target: String,
        offered: String,
        declared: ContextTypes,
    },
    #[error("resolution cancelled")]
    Cancelled,
}

fn fmt_failures(failures: &[PlatformFailure]) -> String {
    if failures.is_empty() {
        String::new()
    } else {
        format!(": {}", join_failures(failures))
    }
}

impl ResolveError {
    /// The enumeration code reported to callers.
    pub fn code(&self) -> &'static str {
        match self {
            ResolveError::InvalidInput(_) | ResolveError::InvalidContext(_) => "InvalidInput",
            ResolveError::NoAppsFound { .. } => "NoAppsFound",
            ResolveError::ResolverUnavailable { .. } => "ResolverUnavailable",
            ResolveError::ResolverTimeout { .. } => "ResolverTimeout",
            ResolveError::UnsupportedContext { .. } => "UnsupportedContext",
            ResolveError::Cancelled => "Cancelled",
        }
    }

    /// Per-platform failures recorded before the error was decided.
    pub fn failures(&self) -> &[PlatformFailure] {
        match self {
            ResolveError::NoAppsFound { failures }
            | ResolveError::ResolverUnavailable { failures }
            | ResolveError::ResolverTimeout { failures } => failures,
            _ => &[],
        }
    }
}

/// Application launch errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OpenError {
    #[error("app not found: {0}")]
    AppNotFound(String),
    #[error("error on launch of {app}: {detail}")]
    ErrorOnLaunch { app: String, detail: String },
    #[error("{app} did not register within {timeout:?}")]
    AppTimeout { app: String, timeout: Duration },
    #[error("resolver unavailable: {0}")]
    ResolverUnavailable(String),
}

impl OpenError {
    pub fn code(&self) -> &'static str {
        match self {
            OpenError::AppNotFound(_) => "AppNotFound",
            OpenError::ErrorOnLaunch { .. } => "ErrorOnLaunch",
            OpenError::AppTimeout { .. } => "AppTimeout",
            OpenError::ResolverUnavailable(_) => "ResolverUnavailable",
        }
    }
}

/// Errors from calls routed to exactly one platform (raise, activate,
/// instance listing).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid request: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Open(#[from] OpenError),
    #[error("unknown platform: {0}")]
    UnknownPlatform(String),
    #[error("platform {0} is not connected")]
    PlatformNotConnected(String),
    #[error("platform {platform} error: {detail}")]
    Platform { platform: String, detail: String },
    #[error("delivery to {target} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },
}

impl DispatchError {
    /// Send code for failures that reached (or tried to reach) a platform.
    pub fn send_code(&self) -> Option<SendError> {
        match self {
            DispatchError::UnknownPlatform(_) => Some(SendError::UnknownPlatform),
            DispatchError::PlatformNotConnected(_) => Some(SendError::PlatformNotConnected),
            DispatchError::Platform { .. } | DispatchError::Timeout { .. } => {
                Some(SendError::PlatformError)
            }
            _ => None,
        }
    }

    /// The enumeration code reported to callers.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::InvalidInput(_) => "InvalidInput",
            DispatchError::Resolve(e) => e.code(),
            DispatchError::Open(e) => e.code(),
            DispatchError::Timeout { .. } => "Timeout",
            other => other.send_code().map(SendError::as_str).unwrap_or("PlatformError"),
        }
    }
}

impl From<ContextError> for DispatchError {
    fn from(e: ContextError) -> Self {
        DispatchError::Resolve(ResolveError::InvalidContext(e))
    }
}
