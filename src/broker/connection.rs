//! Per-connection task — framed I/O, handshake, request fan-in.
//!
//! Each client connection spawns a tokio task that:
//! 1. Wraps the socket in a length-prefixed MessagePack codec.
//! 2. Reads the first message (must be `Hello`) and answers it.
//! 3. Enters a select loop: every request runs on its own task so that a
//!    slow raise never blocks the `intent_reply` it may be waiting for;
//!    responses and unsolicited deliveries share one outbound queue.
//! 4. On exit, releases the session's listeners and notifies the broker
//!    loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;

use crate::ipc::codec::{CodecError, DecodeResult, FrameCodec, decode_frame};
use crate::ipc::protocol::{Message, Response, Role, UNKNOWN_TYPE};
use crate::listeners::{HandlerError, IntentInvocation};
use crate::model::{ApplicationInstance, Context};
use crate::platform::SubscriptionId;

use super::handler::Handler;
use super::state::ConnectionId;

/// Connection lifecycle events for the broker loop, in order.
#[derive(Debug)]
pub enum ConnectionEvent {
    Attached {
        id: ConnectionId,
        role: Role,
        instance: Option<ApplicationInstance>,
    },
    Closed {
        id: ConnectionId,
    },
}

#[derive(Debug, thiserror::Error)]
enum ConnectionError {
    #[error("unexpected EOF during handshake")]
    HandshakeEof,
    #[error("first message must be Hello")]
    NotHello,
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] rmp_serde::decode::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

type Reply = Result<Option<Context>, HandlerError>;

/// Broker-side view of one handshaken connection.
pub struct Session {
    pub id: ConnectionId,
    /// Set for `app` connections.
    pub instance: Option<ApplicationInstance>,
    outbound: mpsc::UnboundedSender<Message>,
    invocations: Mutex<HashMap<u32, oneshot::Sender<Reply>>>,
    next_invocation: AtomicU32,
    /// App-visible subscription id → platform subscription id.
    subscriptions: Mutex<HashMap<SubscriptionId, SubscriptionId>>,
    next_subscription: AtomicU64,
}

impl Session {
    fn new(
        id: ConnectionId,
        instance: Option<ApplicationInstance>,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            id,
            instance,
            outbound,
            invocations: Mutex::new(HashMap::new()),
            next_invocation: AtomicU32::new(1),
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Queue a message for the client. `false` once the connection is gone.
    pub fn send(&self, msg: Message) -> bool {
        self.outbound.send(msg).is_ok()
    }

    fn invocations(&self) -> MutexGuard<'_, HashMap<u32, oneshot::Sender<Reply>>> {
        self.invocations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<SubscriptionId, SubscriptionId>> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send an `invoke_intent` to the app and wait for its `intent_reply`.
    pub async fn invoke(&self, subscription: SubscriptionId, invocation: IntentInvocation) -> Reply {
        let id = self.next_invocation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.invocations().insert(id, tx);
        let _pending = PendingInvocation { session: self, id };

        let sent = self.send(Message::InvokeIntent {
            id,
            subscription,
            intent: invocation.intent,
            context: invocation.context,
            caller: invocation.caller,
        });
        if !sent {
            return Err(HandlerError::new("app disconnected"));
        }
        rx.await
            .unwrap_or_else(|_| Err(HandlerError::new("app disconnected before replying")))
    }

    /// Route an `intent_reply` to the waiting invocation.
    pub fn complete(&self, id: u32, reply: Reply) -> bool {
        match self.invocations().remove(&id) {
            Some(tx) => tx.send(reply).is_ok(),
            None => {
                tracing::debug!(conn_id = ?self.id, invocation = id, "reply for unknown invocation");
                false
            }
        }
    }

    pub fn next_subscription(&self) -> SubscriptionId {
        SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed))
    }

    pub fn track(&self, local: SubscriptionId, remote: SubscriptionId) {
        self.subscriptions().insert(local, remote);
    }

    pub fn untrack(&self, local: SubscriptionId) -> Option<SubscriptionId> {
        self.subscriptions().remove(&local)
    }

    /// Take every platform subscription and fail pending invocations.
    pub fn close(&self) -> Vec<SubscriptionId> {
        self.invocations().clear();
        self.subscriptions().drain().map(|(_, remote)| remote).collect()
    }
}

/// Drops the reply slot if the invoking future is abandoned.
struct PendingInvocation<'a> {
    session: &'a Session,
    id: u32,
}

impl Drop for PendingInvocation<'_> {
    fn drop(&mut self) {
        self.session.invocations().remove(&self.id);
    }
}

/// Spawn a connection handler task.
///
/// The task runs until the client disconnects or a protocol error
/// occurs. On exit, [`ConnectionEvent::Closed`] is sent to the broker
/// loop.
pub fn spawn_connection(
    stream: UnixStream,
    conn_id: ConnectionId,
    handler: Handler,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    tokio::spawn(async move {
        if let Err(e) = handle_connection(stream, conn_id, handler, &events).await {
            tracing::debug!(?conn_id, error = %e, "connection closed");
        }
        let _ = events.send(ConnectionEvent::Closed { id: conn_id });
    });
}

async fn handle_connection(
    stream: UnixStream,
    conn_id: ConnectionId,
    handler: Handler,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
) -> Result<(), ConnectionError> {
    let mut framed = Framed::new(stream, FrameCodec::new());

    // -- Handshake: first message must be Hello --
    let first_frame = framed.next().await.ok_or(ConnectionError::HandshakeEof)??;
    let hello = match decode_frame(&first_frame) {
        DecodeResult::Ok(msg) if matches!(*msg, Message::Hello { .. }) => *msg,
        DecodeResult::Ok(_) | DecodeResult::UnknownType(_) => return Err(ConnectionError::NotHello),
        DecodeResult::Malformed(e) => return Err(ConnectionError::MalformedFrame(e)),
    };

    let (ack, attached) = handler.handshake(hello);
    framed.send(ack).await?;
    let Some((role, instance)) = attached else {
        // Rejected handshake — close.
        return Ok(());
    };

    let _ = events.send(ConnectionEvent::Attached {
        id: conn_id,
        role,
        instance: instance.clone(),
    });
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let session = Arc::new(Session::new(conn_id, instance, outbound_tx));

    let result = serve_session(&mut framed, &handler, &session, &mut outbound_rx).await;
    handler.release(&session).await;
    result
}

async fn serve_session(
    framed: &mut Framed<UnixStream, FrameCodec>,
    handler: &Handler,
    session: &Arc<Session>,
    outbound: &mut mpsc::UnboundedReceiver<Message>,
) -> Result<(), ConnectionError> {
    // Subscription requests run one at a time on their own task so that
    // registration order matches arrival order. Everything else is spawned.
    let (ordered_tx, mut ordered_rx) = mpsc::unbounded_channel::<Message>();
    let ordered = {
        let handler = handler.clone();
        let session = Arc::clone(session);
        tokio::spawn(async move {
            while let Some(msg) = ordered_rx.recv().await {
                if let Some(response) = handler.handle(&session, msg).await {
                    session.send(response);
                }
            }
        })
    };

    let result = read_requests(framed, handler, session, outbound, &ordered_tx).await;

    // Let queued registrations settle before the session is released.
    drop(ordered_tx);
    if let Err(e) = ordered.await {
        tracing::warn!(conn_id = ?session.id, error = %e, "subscription task failed");
    }
    result
}

async fn read_requests(
    framed: &mut Framed<UnixStream, FrameCodec>,
    handler: &Handler,
    session: &Arc<Session>,
    outbound: &mut mpsc::UnboundedReceiver<Message>,
    ordered: &mpsc::UnboundedSender<Message>,
) -> Result<(), ConnectionError> {
    loop {
        tokio::select! {
            frame = framed.next() => {
                let raw = match frame {
                    Some(Ok(raw)) => raw,
                    Some(Err(e)) => return Err(ConnectionError::Codec(e)),
                    None => return Ok(()), // Clean disconnect.
                };
                match decode_frame(&raw) {
                    DecodeResult::Ok(msg) if msg.is_subscription() => {
                        let _ = ordered.send(*msg);
                    }
                    DecodeResult::Ok(msg) => {
                        let handler = handler.clone();
                        let session = Arc::clone(session);
                        tokio::spawn(async move {
                            if let Some(response) = handler.handle(&session, *msg).await {
                                session.send(response);
                            }
                        });
                    }
                    DecodeResult::UnknownType(envelope) => {
                        // Answer with the echoed id and keep the connection.
                        let response = Response::error(
                            envelope.id,
                            UNKNOWN_TYPE,
                            format!("unknown message type: {}", envelope.msg_type),
                        );
                        framed.send(response.into()).await?;
                    }
                    DecodeResult::Malformed(e) => {
                        return Err(ConnectionError::MalformedFrame(e));
                    }
                }
            }
            Some(msg) = outbound.recv() => {
                framed.send(msg).await?;
            }
        }
    }
}
