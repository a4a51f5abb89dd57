//! Request handling — bridges wire messages into the engine.
//!
//! App connections are instances on the broker's hosted platform: their
//! listeners register there directly, owned by the connection's
//! instance, and forward deliveries back over the socket.

use std::sync::{Arc, Weak};

use crate::engine::{Engine, RaiseOutcome, Resolution};
use crate::error::{DispatchError, ResolveError};
use crate::ipc::protocol::{Message, PROTOCOL_VERSION, Response, Role, Status, UNKNOWN_TYPE};
use crate::listeners::{
    ContextCallback, HandlerError, IntentCallback, IntentInvocation, context_handler,
    intent_handler,
};
use crate::model::{Application, ApplicationInstance, Context, ContextTypes, IntentHandler};
use crate::platform::{
    ContextRegistration, HostedPlatform, IntentRegistration, PlatformAdapter, SubscriptionId,
};

use super::connection::Session;

const INVALID_INPUT: &str = "InvalidInput";
const LISTENER_REJECTED: &str = "ListenerRejected";

#[derive(Clone)]
pub struct Handler {
    engine: Engine,
    hosted: HostedPlatform,
}

impl Handler {
    pub fn new(engine: Engine, hosted: HostedPlatform) -> Self {
        Self { engine, hosted }
    }

    /// Answer a `Hello`. Returns the ack and, on success, the role and
    /// the instance an `app` connection was attached as.
    pub fn handshake(
        &self,
        hello: Message,
    ) -> (Message, Option<(Role, Option<ApplicationInstance>)>) {
        let Message::Hello {
            id,
            version,
            role,
            app_id,
            name,
            instance_id,
            launch_token,
        } = hello
        else {
            return (hello_error("expected_hello"), None);
        };
        if id != 0 {
            return (hello_error("invalid_hello_id"), None);
        }
        if version != PROTOCOL_VERSION {
            return (hello_error("version_mismatch"), None);
        }

        let instance = match role {
            Role::Client => None,
            Role::App => {
                if app_id.is_none() && name.is_none() {
                    return (hello_error("missing_identity"), None);
                }
                let app = Application {
                    app_id,
                    name,
                    platform_name: self.hosted.name().to_string(),
                    app_type: None,
                };
                Some(self.hosted.attach(app, instance_id, launch_token.as_deref()))
            }
        };
        let ack = Message::HelloAck {
            id: 0,
            status: Status::Ok,
            error: None,
            instance: instance.clone(),
        };
        (ack, Some((role, instance)))
    }

    /// Handle one request. `None` for messages that take no response.
    pub async fn handle(&self, session: &Arc<Session>, request: Message) -> Option<Message> {
        let response = match request {
            Message::ListPlatforms { id } => Response {
                platforms: Some(self.engine.list_platforms()),
                ..Response::ok(id)
            },
            Message::Open {
                id,
                app,
                context,
                config,
            } => match self.engine.open(&app, context.as_ref(), config.as_deref()).await {
                Ok(instance) => Response {
                    instance: Some(instance),
                    ..Response::ok(id)
                },
                Err(e) => dispatch_error(id, e),
            },
            Message::ListInstances { id, app } => match self.engine.list_instances(&app).await {
                Ok(instances) => Response {
                    instances: Some(instances),
                    ..Response::ok(id)
                },
                Err(e) => dispatch_error(id, e),
            },
            Message::Activate { id, instance } => {
                match self.engine.activate_instance(&instance).await {
                    Ok(()) => Response::ok(id),
                    Err(e) => dispatch_error(id, e),
                }
            }

            // -- Resolution --
            Message::Resolve {
                id,
                intent,
                context,
            } => resolution(
                id,
                self.engine.resolve_by_intent(&intent, context.as_ref()).await,
            ),
            Message::ResolveByContext { id, context } => {
                resolution(id, self.engine.resolve_by_context(&context).await)
            }
            Message::ResolveByContextType { id, types } => {
                resolution(id, self.engine.resolve_by_context_type(&types).await)
            }

            // -- Dispatch and broadcast --
            Message::Raise {
                id,
                intent,
                context,
                target,
            } => self.raise(session, id, &intent, &context, target.as_ref()).await,
            Message::Broadcast { id, context } => {
                match self.engine.broadcast(&context, session.instance.as_ref()).await {
                    Ok(result) => Response {
                        broadcast: Some(result),
                        ..Response::ok(id)
                    },
                    Err(e) => Response::error(id, INVALID_INPUT, e.to_string()),
                }
            }

            // -- Listeners --
            Message::AddIntentListener {
                id,
                intent,
                context_types,
            } => self.add_intent_listener(session, id, intent, context_types).await,
            Message::AddContextListener { id } => self.add_context_listener(session, id).await,
            Message::Unsubscribe { id, subscription } => {
                if let Some(remote) = session.untrack(subscription) {
                    if let Err(e) = self.hosted.unregister(remote).await {
                        tracing::warn!(conn_id = ?session.id, %subscription, error = %e, "unregister failed");
                    }
                }
                Response::ok(id)
            }
            Message::IntentReply {
                id,
                status,
                error,
                context,
            } => {
                let reply = match status {
                    Status::Ok => Ok(context),
                    Status::Error => Err(HandlerError::new(
                        error.unwrap_or_else(|| "intent handler failed".to_string()),
                    )),
                };
                session.complete(id, reply);
                return None;
            }

            // A second hello, or broker-originated messages sent back.
            Message::Hello { id, .. } => Response::error(id, INVALID_INPUT, "already handshaken"),
            Message::HelloAck { id, .. }
            | Message::DeliverContext { id, .. }
            | Message::InvokeIntent { id, .. } => {
                Response::error(id, UNKNOWN_TYPE, "message is broker-originated")
            }
            Message::Response(response) => Response::error(
                response.id,
                UNKNOWN_TYPE,
                "message is broker-originated",
            ),
        };
        Some(response.into())
    }

    /// Drop everything a closed connection registered.
    pub async fn release(&self, session: &Session) {
        for remote in session.close() {
            if let Err(e) = self.hosted.unregister(remote).await {
                tracing::debug!(conn_id = ?session.id, error = %e, "unregister on close failed");
            }
        }
    }

    async fn raise(
        &self,
        session: &Session,
        id: u32,
        intent: &str,
        context: &Context,
        target: Option<&IntentHandler>,
    ) -> Response {
        let outcome = self
            .engine
            .raise_intent_from(session.instance.as_ref(), intent, context, target)
            .await;
        match outcome {
            Ok(RaiseOutcome::Resolved(result)) => Response {
                result: Some(result),
                ..Response::ok(id)
            },
            Ok(RaiseOutcome::SelectionRequired(list)) => Response {
                selection: Some(list),
                ..Response::ok(id)
            },
            Err(e) => dispatch_error(id, e),
        }
    }

    async fn add_intent_listener(
        &self,
        session: &Arc<Session>,
        id: u32,
        intent: String,
        context_types: ContextTypes,
    ) -> Response {
        let Some(owner) = session.instance.clone() else {
            return Response::error(id, INVALID_INPUT, "only app connections can listen");
        };
        if intent.is_empty() {
            return Response::error(id, INVALID_INPUT, "intent name is empty");
        }
        let local = session.next_subscription();
        let registration = IntentRegistration {
            intent,
            context_types,
            owner,
            handler: forward_intent(Arc::downgrade(session), local),
        };
        match self.hosted.register_intent_listener(registration).await {
            Ok(remote) => {
                session.track(local, remote);
                Response {
                    subscription: Some(local),
                    ..Response::ok(id)
                }
            }
            Err(e) => Response::error(id, LISTENER_REJECTED, e.to_string()),
        }
    }

    async fn add_context_listener(&self, session: &Arc<Session>, id: u32) -> Response {
        let Some(owner) = session.instance.clone() else {
            return Response::error(id, INVALID_INPUT, "only app connections can listen");
        };
        let local = session.next_subscription();
        let registration = ContextRegistration {
            owner: Some(owner),
            handler: forward_context(Arc::downgrade(session), local),
        };
        match self.hosted.register_context_listener(registration).await {
            Ok(remote) => {
                session.track(local, remote);
                Response {
                    subscription: Some(local),
                    ..Response::ok(id)
                }
            }
            Err(e) => Response::error(id, LISTENER_REJECTED, e.to_string()),
        }
    }
}

fn hello_error(reason: &str) -> Message {
    Message::HelloAck {
        id: 0,
        status: Status::Error,
        error: Some(reason.to_string()),
        instance: None,
    }
}

fn failure_strings(e: &ResolveError) -> Option<Vec<String>> {
    let failures = e.failures();
    (!failures.is_empty()).then(|| failures.iter().map(ToString::to_string).collect())
}

fn resolution(id: u32, result: Result<Resolution, ResolveError>) -> Response {
    match result {
        Ok(resolution) => Response {
            failures: (!resolution.failures.is_empty())
                .then(|| resolution.failures.iter().map(ToString::to_string).collect()),
            intents: Some(resolution.intents),
            ..Response::ok(id)
        },
        Err(e) => Response {
            failures: failure_strings(&e),
            ..Response::error(id, e.code(), e.to_string())
        },
    }
}

fn dispatch_error(id: u32, e: DispatchError) -> Response {
    let failures = match &e {
        DispatchError::Resolve(resolve) => failure_strings(resolve),
        _ => None,
    };
    Response {
        failures,
        ..Response::error(id, e.code(), e.to_string())
    }
}

fn forward_intent(session: Weak<Session>, subscription: SubscriptionId) -> IntentCallback {
    intent_handler(move |invocation: IntentInvocation| {
        let session = session.upgrade();
        async move {
            let session = session.ok_or_else(|| HandlerError::new("app disconnected"))?;
            session.invoke(subscription, invocation).await
        }
    })
}

fn forward_context(session: Weak<Session>, subscription: SubscriptionId) -> ContextCallback {
    context_handler(move |context, from| {
        let delivered = session.upgrade().is_some_and(|session| {
            session.send(Message::DeliverContext {
                id: 0,
                subscription,
                context: context.clone(),
                from: from.cloned(),
            })
        });
        if delivered {
            Ok(())
        } else {
            Err(HandlerError::new("app disconnected"))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::engine::tests::fast_config;
    use crate::platform::NoLauncher;

    fn handler() -> (Handler, HostedPlatform) {
        let hosted = HostedPlatform::new("hosted", Arc::new(NoLauncher));
        let engine = Engine::new(fast_config());
        engine.register_platform(Arc::new(hosted.clone()));
        (Handler::new(engine, hosted.clone()), hosted)
    }

    fn hello(id: u32, version: u32, role: Role, app_id: Option<&str>) -> Message {
        Message::Hello {
            id,
            version,
            role,
            app_id: app_id.map(str::to_string),
            name: None,
            instance_id: None,
            launch_token: None,
        }
    }

    fn ack_error(msg: &Message) -> Option<&str> {
        match msg {
            Message::HelloAck { error, .. } => error.as_deref(),
            other => panic!("expected HelloAck, got {other:?}"),
        }
    }

    // -- Hello --

    #[test]
    fn client_hello_accepted() {
        let (handler, hosted) = handler();
        let (ack, attached) = handler.handshake(hello(0, PROTOCOL_VERSION, Role::Client, None));
        assert_eq!(ack_error(&ack), None);
        assert_eq!(attached, Some((Role::Client, None)));
        assert!(hosted.instances().is_empty());
    }

    #[test]
    fn app_hello_attaches_instance() {
        let (handler, hosted) = handler();
        let (ack, attached) =
            handler.handshake(hello(0, PROTOCOL_VERSION, Role::App, Some("chart")));
        let Message::HelloAck {
            status: Status::Ok,
            instance: Some(instance),
            ..
        } = ack
        else {
            panic!("expected ok ack with instance, got {ack:?}");
        };
        assert_eq!(instance.platform(), "hosted");
        assert_eq!(attached, Some((Role::App, Some(instance.clone()))));
        assert_eq!(hosted.instances(), vec![instance]);
    }

    #[test]
    fn hello_rejections() {
        let (handler, _) = handler();
        let (ack, attached) = handler.handshake(hello(3, PROTOCOL_VERSION, Role::Client, None));
        assert_eq!(ack_error(&ack), Some("invalid_hello_id"));
        assert!(attached.is_none());

        let (ack, _) = handler.handshake(hello(0, 999, Role::Client, None));
        assert_eq!(ack_error(&ack), Some("version_mismatch"));

        let (ack, _) = handler.handshake(hello(0, PROTOCOL_VERSION, Role::App, None));
        assert_eq!(ack_error(&ack), Some("missing_identity"));
    }

    // -- Error mapping --

    #[test]
    fn resolve_errors_carry_code_and_failures() {
        let err = ResolveError::ResolverUnavailable {
            failures: vec![crate::error::PlatformFailure::timeout("A")],
        };
        let response = resolution(4, Err(err));
        assert_eq!(response.id, 4);
        assert_eq!(response.code.as_deref(), Some("ResolverUnavailable"));
        assert_eq!(response.failures, Some(vec!["A: timed out".to_string()]));
    }

    #[test]
    fn dispatch_errors_use_send_codes() {
        let response = dispatch_error(2, DispatchError::PlatformNotConnected("B".into()));
        assert_eq!(response.status, Status::Error);
        assert_eq!(response.code.as_deref(), Some("Platform Not connected"));
        assert!(response.failures.is_none());
    }
}
