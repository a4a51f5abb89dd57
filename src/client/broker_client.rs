//! Broker client for the CLI client.
//!
//! Connects to the broker daemon as `Role::Client`, performs the
//! handshake, and provides one method per request the CLI issues.

use std::path::Path;

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

use crate::engine::RaiseOutcome;
use crate::ipc::codec::LengthPrefixedCodec;
use crate::ipc::protocol::{Message, PROTOCOL_VERSION, Response, Role, Status};
use crate::model::{
    Application, ApplicationInstance, BroadcastResult, Context, IntentHandler, IntentList,
    Platform,
};

use super::ClientError;

/// Result of a resolve or resolve-by-context request.
#[derive(Debug, Default)]
pub struct ResolveResult {
    pub intents: Vec<IntentList>,
    /// Platforms that contributed nothing, as `name: reason`.
    pub failures: Vec<String>,
}

/// Broker client for one-shot CLI commands.
///
/// Each CLI invocation performs a single request-response cycle, so the
/// framed socket is used directly without a split sink/stream.
pub struct BrokerClient {
    framed: Framed<UnixStream, LengthPrefixedCodec>,
    next_id: u32,
}

impl BrokerClient {
    /// Connect to the broker and perform the handshake.
    pub async fn connect(socket_path: &Path) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|e| ClientError::Broker(format!("connect {}: {e}", socket_path.display())))?;
        let mut framed = Framed::new(stream, LengthPrefixedCodec::new());

        // Handshake: Hello → HelloAck.
        framed
            .send(Message::Hello {
                id: 0,
                version: PROTOCOL_VERSION,
                role: Role::Client,
                app_id: None,
                name: None,
                instance_id: None,
                launch_token: None,
            })
            .await
            .map_err(|e| ClientError::Broker(format!("send hello: {e}")))?;

        match framed.next().await {
            Some(Ok(Message::HelloAck {
                status: Status::Ok, ..
            })) => {}
            Some(Ok(Message::HelloAck {
                status: Status::Error,
                error,
                ..
            })) => {
                return Err(ClientError::Broker(format!(
                    "handshake rejected: {}",
                    error.unwrap_or_default()
                )));
            }
            other => {
                return Err(ClientError::Broker(format!(
                    "unexpected handshake response: {other:?}"
                )));
            }
        }

        Ok(Self {
            framed,
            next_id: 1, // 0 = Hello
        })
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Send one request and wait for its response.
    ///
    /// Error responses become [`ClientError::Failed`] carrying the code.
    async fn request(&mut self, op: &'static str, msg: Message) -> Result<Response, ClientError> {
        let id = msg.id();
        self.framed
            .send(msg)
            .await
            .map_err(|e| ClientError::Broker(format!("send {op}: {e}")))?;

        match self.framed.next().await {
            Some(Ok(Message::Response(response))) if response.id == id => {
                if response.is_ok() {
                    Ok(response)
                } else {
                    Err(ClientError::Failed {
                        op,
                        code: response.code.unwrap_or_default(),
                        message: response.error.unwrap_or_default(),
                    })
                }
            }
            Some(Err(e)) => Err(ClientError::Broker(format!("{op}: {e}"))),
            other => Err(ClientError::Broker(format!(
                "unexpected {op} response: {other:?}"
            ))),
        }
    }

    pub async fn list_platforms(&mut self) -> Result<Vec<Platform>, ClientError> {
        let id = self.next_id();
        let response = self
            .request("list_platforms", Message::ListPlatforms { id })
            .await?;
        Ok(response.platforms.unwrap_or_default())
    }

    pub async fn resolve(
        &mut self,
        intent: &str,
        context: Option<Context>,
    ) -> Result<ResolveResult, ClientError> {
        let id = self.next_id();
        let response = self
            .request(
                "resolve",
                Message::Resolve {
                    id,
                    intent: intent.to_string(),
                    context,
                },
            )
            .await?;
        Ok(resolve_result(response))
    }

    pub async fn resolve_by_context(&mut self, context: Context) -> Result<ResolveResult, ClientError> {
        let id = self.next_id();
        let response = self
            .request("resolve_by_context", Message::ResolveByContext { id, context })
            .await?;
        Ok(resolve_result(response))
    }

    pub async fn raise(
        &mut self,
        intent: &str,
        context: Context,
        target: Option<IntentHandler>,
    ) -> Result<RaiseOutcome, ClientError> {
        let id = self.next_id();
        let response = self
            .request(
                "raise",
                Message::Raise {
                    id,
                    intent: intent.to_string(),
                    context,
                    target,
                },
            )
            .await?;
        match (response.result, response.selection) {
            (Some(result), _) => Ok(RaiseOutcome::Resolved(result)),
            (None, Some(selection)) => Ok(RaiseOutcome::SelectionRequired(selection)),
            (None, None) => Err(ClientError::Broker("raise response carries no result".into())),
        }
    }

    pub async fn broadcast(&mut self, context: Context) -> Result<BroadcastResult, ClientError> {
        let id = self.next_id();
        let response = self
            .request("broadcast", Message::Broadcast { id, context })
            .await?;
        response
            .broadcast
            .ok_or_else(|| ClientError::Broker("broadcast response carries no result".into()))
    }

    pub async fn open(
        &mut self,
        app: Application,
        context: Option<Context>,
    ) -> Result<ApplicationInstance, ClientError> {
        let id = self.next_id();
        let response = self
            .request(
                "open",
                Message::Open {
                    id,
                    app,
                    context,
                    config: None,
                },
            )
            .await?;
        response
            .instance
            .ok_or_else(|| ClientError::Broker("open response carries no instance".into()))
    }

    pub async fn list_instances(
        &mut self,
        app: Application,
    ) -> Result<Vec<ApplicationInstance>, ClientError> {
        let id = self.next_id();
        let response = self
            .request("list_instances", Message::ListInstances { id, app })
            .await?;
        Ok(response.instances.unwrap_or_default())
    }
}

fn resolve_result(response: Response) -> ResolveResult {
    ResolveResult {
        intents: response.intents.unwrap_or_default(),
        failures: response.failures.unwrap_or_default(),
    }
}
