//! CLI client for broker operations.
//!
//! Provides one-shot commands that connect to the broker, perform a
//! single request, print the result, and exit. Contexts are given on the
//! command line as JSON: either a full context (`{"items": [...]}`) or a
//! single format (`{"format": "fdc3.instrument", "data": {...}}`).

mod broker_client;
mod format;

use std::path::PathBuf;

use crate::broker;
use crate::cli::{AppArg, ClientAction};
use crate::model::{Application, ApplicationInstance, Context, ContextData, ContextTypes, IntentHandler};
use broker_client::BrokerClient;

pub use broker_client::ResolveResult;

/// Client error type.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("broker: {0}")]
    Broker(String),
    #[error("{op} failed: {code}: {message}")]
    Failed {
        op: &'static str,
        code: String,
        message: String,
    },
    #[error("invalid context JSON: {0}")]
    InvalidContext(#[source] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// The broker's error code, for request failures.
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::Failed { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// Run the client command.
///
/// Connects to the broker, performs the requested action, prints the
/// result, and returns. Called from `main.rs` for `Command::Client`.
pub async fn run(socket: Option<PathBuf>, action: ClientAction) -> Result<(), ClientError> {
    let socket_path = match socket {
        Some(path) => path,
        None => broker::default_socket_path().map_err(|e| ClientError::Broker(e.to_string()))?,
    };
    let mut broker = BrokerClient::connect(&socket_path).await?;

    match action {
        ClientAction::Platforms => {
            let platforms = broker.list_platforms().await?;
            format::print_platforms(&platforms);
        }
        ClientAction::Resolve { intent, context } => {
            let context = context.as_deref().map(parse_context).transpose()?;
            let result = broker.resolve(&intent, context).await?;
            format::print_resolution(&result);
        }
        ClientAction::ResolveContext { context } => {
            let result = broker.resolve_by_context(parse_context(&context)?).await?;
            format::print_resolution(&result);
        }
        ClientAction::Raise {
            intent,
            context,
            app,
            platform,
            instance,
        } => {
            let target = app.map(|app| explicit_target(AppArg { app, platform }, instance));
            let outcome = broker.raise(&intent, parse_context(&context)?, target).await?;
            format::print_raise(&outcome);
        }
        ClientAction::Broadcast { context } => {
            let result = broker.broadcast(parse_context(&context)?).await?;
            format::print_broadcast(&result);
        }
        ClientAction::Open { target, context } => {
            let context = context.as_deref().map(parse_context).transpose()?;
            let instance = broker.open(application(target), context).await?;
            format::print_open(&instance);
        }
        ClientAction::Instances { target } => {
            let instances = broker.list_instances(application(target)).await?;
            format::print_instances(&instances);
        }
    }

    Ok(())
}

/// Parse a context argument.
///
/// Accepts a full context or a single `{format, data}` representation.
fn parse_context(json: &str) -> Result<Context, ClientError> {
    match serde_json::from_str::<Context>(json) {
        Ok(context) => Ok(context),
        Err(full) => serde_json::from_str::<ContextData>(json)
            .map(Context::single)
            .map_err(|_| ClientError::InvalidContext(full)),
    }
}

/// An application named on the command line. An empty platform lets the
/// broker apply its default.
fn application(arg: AppArg) -> Application {
    Application::new(arg.app, arg.platform.unwrap_or_default())
}

fn explicit_target(app: AppArg, instance: Option<String>) -> IntentHandler {
    let application = application(app);
    match instance {
        Some(id) => IntentHandler::for_instance(ApplicationInstance::new(application, id), ContextTypes::Any),
        None => IntentHandler::for_app(application, ContextTypes::Any),
    }
}
