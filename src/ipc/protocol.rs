//! Wire protocol message types for broker IPC.
//!
//! All messages are MessagePack-encoded maps with at minimum `type` and
//! `id` fields. Requests carry a caller-chosen `id` that the response
//! echoes. Unsolicited broker messages use their own id space:
//! `deliver_context` always carries `id: 0`, `invoke_intent` carries an
//! invocation id that the app echoes in its `intent_reply`.

use serde::{Deserialize, Serialize};

use crate::model::{
    Application, ApplicationInstance, BroadcastResult, Context, ContextTypes, IntentHandler,
    IntentList, IntentResult, Platform,
};
use crate::platform::SubscriptionId;

/// All wire protocol messages.
///
/// Serialized as a tagged union on the `type` field via MessagePack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Message {
    // -- Handshake --
    /// First message on every connection. `app` connections name the
    /// application they run as; a launched app also presents the token
    /// it was started with.
    #[serde(rename = "hello")]
    Hello {
        id: u32,
        version: u32,
        role: Role,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        app_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instance_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        launch_token: Option<String>,
    },

    #[serde(rename = "hello_ack")]
    HelloAck {
        id: u32,
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// The instance an `app` connection was attached as.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instance: Option<ApplicationInstance>,
    },

    // -- Applications --
    #[serde(rename = "open")]
    Open {
        id: u32,
        app: Application,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<Context>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config: Option<String>,
    },

    #[serde(rename = "list_instances")]
    ListInstances { id: u32, app: Application },

    #[serde(rename = "activate")]
    Activate {
        id: u32,
        instance: ApplicationInstance,
    },

    #[serde(rename = "list_platforms")]
    ListPlatforms { id: u32 },

    // -- Resolution --
    #[serde(rename = "resolve")]
    Resolve {
        id: u32,
        intent: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<Context>,
    },

    #[serde(rename = "resolve_by_context")]
    ResolveByContext { id: u32, context: Context },

    #[serde(rename = "resolve_by_context_type")]
    ResolveByContextType { id: u32, types: Vec<String> },

    // -- Dispatch and broadcast --
    #[serde(rename = "raise")]
    Raise {
        id: u32,
        intent: String,
        context: Context,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<IntentHandler>,
    },

    #[serde(rename = "broadcast")]
    Broadcast { id: u32, context: Context },

    // -- Listeners (app role only) --
    #[serde(rename = "add_intent_listener")]
    AddIntentListener {
        id: u32,
        intent: String,
        #[serde(default)]
        context_types: ContextTypes,
    },

    #[serde(rename = "add_context_listener")]
    AddContextListener { id: u32 },

    #[serde(rename = "unsubscribe")]
    Unsubscribe {
        id: u32,
        subscription: SubscriptionId,
    },

    /// An app's answer to an `invoke_intent`; `id` is the invocation id.
    #[serde(rename = "intent_reply")]
    IntentReply {
        id: u32,
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<Context>,
    },

    // -- Unsolicited (broker → app) --
    #[serde(rename = "deliver_context")]
    DeliverContext {
        id: u32,
        subscription: SubscriptionId,
        context: Context,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ApplicationInstance>,
    },

    #[serde(rename = "invoke_intent")]
    InvokeIntent {
        id: u32,
        subscription: SubscriptionId,
        intent: String,
        context: Context,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caller: Option<ApplicationInstance>,
    },

    // -- Generic response --
    #[serde(rename = "response")]
    Response(Response),
}

impl Message {
    /// Listener add and remove requests, which must apply in arrival order.
    pub fn is_subscription(&self) -> bool {
        matches!(
            self,
            Message::AddIntentListener { .. }
                | Message::AddContextListener { .. }
                | Message::Unsubscribe { .. }
        )
    }

    /// The `id` field of any message.
    pub fn id(&self) -> u32 {
        match self {
            Message::Hello { id, .. }
            | Message::HelloAck { id, .. }
            | Message::Open { id, .. }
            | Message::ListInstances { id, .. }
            | Message::Activate { id, .. }
            | Message::ListPlatforms { id }
            | Message::Resolve { id, .. }
            | Message::ResolveByContext { id, .. }
            | Message::ResolveByContextType { id, .. }
            | Message::Raise { id, .. }
            | Message::Broadcast { id, .. }
            | Message::AddIntentListener { id, .. }
            | Message::AddContextListener { id }
            | Message::Unsubscribe { id, .. }
            | Message::IntentReply { id, .. }
            | Message::DeliverContext { id, .. }
            | Message::InvokeIntent { id, .. } => *id,
            Message::Response(response) => response.id,
        }
    }
}

/// Reply to a request. Only the fields relevant to the request are set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Response {
    pub id: u32,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-readable error code (`NoAppsFound`, `AppTimeout`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platforms: Option<Vec<Platform>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<ApplicationInstance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instances: Option<Vec<ApplicationInstance>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intents: Option<Vec<IntentList>>,
    /// Per-platform failures behind a partial or failed resolution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failures: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<IntentResult>,
    /// Set instead of `result` when a raise needs the caller to choose.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection: Option<IntentList>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<BroadcastResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionId>,
}

impl Response {
    pub fn ok(id: u32) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn error(id: u32, code: &str, error: impl Into<String>) -> Self {
        Self {
            id,
            status: Status::Error,
            error: Some(error.into()),
            code: Some(code.to_string()),
            ..Default::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

/// Client role in the handshake.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A running application: may subscribe and receive deliveries.
    App,
    /// A one-shot controller such as the CLI.
    Client,
}

/// Response status.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Ok,
    Error,
}

/// Protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Error code for message types the broker does not accept.
pub const UNKNOWN_TYPE: &str = "unknown_type";

/// Minimal envelope for extracting `{type, id}` from unknown messages.
///
/// Used as a fallback when [`Message`] deserialization fails so the
/// error response can still echo the request `id`.
#[derive(Debug, Deserialize)]
pub struct RawEnvelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub id: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::model::{ContextData, Instrument};

    fn encode<T: Serialize>(value: &T) -> Vec<u8> {
        rmp_serde::to_vec_named(value).unwrap()
    }

    #[test]
    fn client_hello_omits_identity() {
        #[derive(Serialize)]
        struct BareHello {
            #[serde(rename = "type")]
            msg_type: &'static str,
            id: u32,
            version: u32,
            role: &'static str,
        }
        let decoded: Message = rmp_serde::from_slice(&encode(&BareHello {
            msg_type: "hello",
            id: 0,
            version: PROTOCOL_VERSION,
            role: "client",
        }))
        .unwrap();
        match decoded {
            Message::Hello {
                role,
                app_id,
                launch_token,
                ..
            } => {
                assert_eq!(role, Role::Client);
                assert!(app_id.is_none());
                assert!(launch_token.is_none());
            }
            other => panic!("expected Hello, got {other:?}"),
        }
    }

    #[test]
    fn response_only_carries_set_fields() {
        let response = Response::error(4, "NoAppsFound", "no handler for ViewChart");
        let value: BTreeMap<String, serde_json::Value> =
            rmp_serde::from_slice(&encode(&Message::from(response))).unwrap();
        let mut keys: Vec<&str> = value.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["code", "error", "id", "status", "type"]);
    }

    #[test]
    fn response_missing_fields_default() {
        #[derive(Serialize)]
        struct Minimal {
            #[serde(rename = "type")]
            msg_type: &'static str,
            id: u32,
        }
        let decoded: Message = rmp_serde::from_slice(&encode(&Minimal {
            msg_type: "response",
            id: 9,
        }))
        .unwrap();
        assert_eq!(decoded, Message::Response(Response::ok(9)));
    }

    #[test]
    fn invoke_intent_carries_context() {
        let context = Context::single(ContextData::Instrument(Instrument {
            ticker: Some("AAPL".into()),
            ..Default::default()
        }));
        let msg = Message::InvokeIntent {
            id: 3,
            subscription: SubscriptionId(11),
            intent: "ViewChart".into(),
            context: context.clone(),
            caller: None,
        };
        match rmp_serde::from_slice::<Message>(&encode(&msg)).unwrap() {
            Message::InvokeIntent {
                subscription,
                context: decoded,
                ..
            } => {
                assert_eq!(subscription, SubscriptionId(11));
                assert_eq!(decoded, context);
            }
            other => panic!("expected InvokeIntent, got {other:?}"),
        }
    }

    #[test]
    fn listener_types_default_to_any() {
        #[derive(Serialize)]
        struct NoTypes {
            #[serde(rename = "type")]
            msg_type: &'static str,
            id: u32,
            intent: &'static str,
        }
        let decoded: Message = rmp_serde::from_slice(&encode(&NoTypes {
            msg_type: "add_intent_listener",
            id: 2,
            intent: "ViewChart",
        }))
        .unwrap();
        assert!(matches!(
            decoded,
            Message::AddIntentListener {
                context_types: ContextTypes::Any,
                ..
            }
        ));
    }

    #[test]
    fn envelope_extracted_from_unknown_type() {
        #[derive(Serialize)]
        struct Unknown {
            #[serde(rename = "type")]
            msg_type: &'static str,
            id: u32,
        }
        let bytes = encode(&Unknown {
            msg_type: "frobnicate",
            id: 42,
        });
        assert!(rmp_serde::from_slice::<Message>(&bytes).is_err());
        let envelope: RawEnvelope = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(envelope.msg_type, "frobnicate");
        assert_eq!(envelope.id, 42);
    }

    #[test]
    fn id_accessor_covers_responses() {
        assert_eq!(Message::ListPlatforms { id: 5 }.id(), 5);
        assert_eq!(Message::from(Response::ok(8)).id(), 8);
    }
}
