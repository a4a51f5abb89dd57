//! Launchers — how the hosted platform starts applications.
//!
//! A launcher only starts the application. Completion is signalled
//! separately, when the new instance attaches to the hosted platform
//! presenting the launch token it was given.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::model::Application;

use super::HostedPlatform;

/// Environment variable carrying the launch token to a spawned app.
pub const LAUNCH_TOKEN_ENV: &str = "INTEROP_LAUNCH_TOKEN";
/// Environment variable carrying the broker socket path.
pub const SOCKET_ENV: &str = "INTEROP_SOCKET";
/// Environment variable carrying the directory id of the spawned app.
pub const APP_ID_ENV: &str = "INTEROP_APP_ID";
/// Environment variable carrying the caller-supplied launch config.
pub const LAUNCH_CONFIG_ENV: &str = "INTEROP_LAUNCH_CONFIG";

/// One pending launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub app: Application,
    /// Presented by the new instance when it attaches.
    pub token: String,
    pub config: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("no launch command configured for {0}")]
    NoCommand(String),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Failed(String),
}

#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start the application. Returns once the start was initiated.
    async fn launch(&self, host: HostedPlatform, request: LaunchRequest) -> Result<(), LaunchError>;
}

type LaunchFn =
    dyn Fn(HostedPlatform, LaunchRequest) -> BoxFuture<'static, Result<(), LaunchError>> + Send + Sync;

/// Launcher backed by a closure. Used to host in-process applications.
#[derive(Clone)]
pub struct FnLauncher {
    f: Arc<LaunchFn>,
}

impl FnLauncher {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(HostedPlatform, LaunchRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), LaunchError>> + Send + 'static,
    {
        Self {
            f: Arc::new(move |host, request| f(host, request).boxed()),
        }
    }
}

#[async_trait]
impl Launcher for FnLauncher {
    async fn launch(&self, host: HostedPlatform, request: LaunchRequest) -> Result<(), LaunchError> {
        (self.f)(host, request).await
    }
}

/// Launcher that never starts anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLauncher;

#[async_trait]
impl Launcher for NoLauncher {
    async fn launch(&self, _host: HostedPlatform, request: LaunchRequest) -> Result<(), LaunchError> {
        Err(LaunchError::NoCommand(request.app.key().to_string()))
    }
}

/// Command line used to start a directory application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Launcher that spawns an OS process per launch.
///
/// The child learns how to reach the broker, and which token to present
/// in its `hello`, from environment variables.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    socket_path: PathBuf,
    commands: HashMap<String, LaunchCommand>,
}

impl ProcessLauncher {
    pub fn new(socket_path: impl Into<PathBuf>, commands: HashMap<String, LaunchCommand>) -> Self {
        Self {
            socket_path: socket_path.into(),
            commands,
        }
    }

    fn command_for(&self, app: &Application) -> Option<&LaunchCommand> {
        app.app_id
            .as_deref()
            .and_then(|id| self.commands.get(id))
            .or_else(|| app.name.as_deref().and_then(|n| self.commands.get(n)))
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, _host: HostedPlatform, request: LaunchRequest) -> Result<(), LaunchError> {
        use tokio::process::Command;

        let command = self
            .command_for(&request.app)
            .ok_or_else(|| LaunchError::NoCommand(request.app.key().to_string()))?;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .env(LAUNCH_TOKEN_ENV, &request.token)
            .env(SOCKET_ENV, &self.socket_path)
            .env(APP_ID_ENV, request.app.key())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::inherit());
        if let Some(config) = &request.config {
            cmd.env(LAUNCH_CONFIG_ENV, config);
        }

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            program: command.program.clone(),
            source,
        })?;
        let pid = child.id();
        tracing::info!(app = %request.app, ?pid, "application spawned");

        // Reap the child; its lifetime is tracked through its connection.
        let app = request.app.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::debug!(app, %status, "application exited"),
                Err(e) => tracing::warn!(app, error = %e, "failed to wait for application"),
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(app_id: &str) -> LaunchRequest {
        LaunchRequest {
            app: Application::new(app_id, "hosted"),
            token: "tok".into(),
            config: None,
        }
    }

    #[tokio::test]
    async fn process_launcher_without_command() {
        let launcher = ProcessLauncher::new("/tmp/none.sock", HashMap::new());
        let host = HostedPlatform::new("hosted", Arc::new(NoLauncher));
        let err = launcher.launch(host, request("chart")).await.unwrap_err();
        assert!(matches!(err, LaunchError::NoCommand(ref app) if app == "chart"));
    }

    #[tokio::test]
    async fn process_launcher_reports_spawn_failure() {
        let mut commands = HashMap::new();
        commands.insert(
            "chart".to_string(),
            LaunchCommand {
                program: "/nonexistent/interop-test-binary".into(),
                args: vec![],
            },
        );
        let launcher = ProcessLauncher::new("/tmp/none.sock", commands);
        let host = HostedPlatform::new("hosted", Arc::new(NoLauncher));
        let err = launcher.launch(host, request("chart")).await.unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }

    #[test]
    fn launch_command_args_default_to_empty() {
        let cmd: LaunchCommand = serde_json::from_str(r#"{"program":"/usr/bin/chart"}"#).unwrap();
        assert!(cmd.args.is_empty());
    }
}
