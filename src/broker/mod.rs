//! Broker daemon — exposes the engine to local applications.
//!
//! The broker listens on a Unix domain socket. Every application
//! instance or CLI client holds one connection. Application connections
//! attach as instances of the broker's hosted platform, so their
//! listeners take part in resolution and broadcast like any other
//! platform's.
//!
//! Architecture: a single broker loop owns the connection table
//! ([`state::BrokerState`]). Per-connection tasks handle requests
//! against the shared engine and report attach/close events to the loop,
//! which detaches instances whose last connection closed.

mod connection;
mod handler;
pub mod state;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use connection::ConnectionEvent;
use handler::Handler;
use state::{BrokerState, ConnectionId};

use crate::directory::{DirectoryError, StaticDirectory};
use crate::engine::{Engine, EngineConfig};
use crate::platform::{HostedConfig, HostedPlatform, ProcessLauncher};

/// Name of the broker's own platform unless configured otherwise.
pub const DEFAULT_PLATFORM_NAME: &str = "local";

/// Broker startup/runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("$XDG_RUNTIME_DIR is not set")]
    NoRuntimeDir,
    #[error("broker already running at {0}")]
    AlreadyRunning(PathBuf),
    #[error("failed to create directory {path}: {source}")]
    MkdirFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to bind socket {path}: {source}")]
    BindFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Daemon settings.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub socket_path: PathBuf,
    /// Name the broker's hosted platform registers under.
    pub platform_name: String,
    /// App Directory JSON file.
    pub directory: Option<PathBuf>,
    pub engine: EngineConfig,
}

/// Run the broker daemon until SIGTERM or SIGINT.
///
/// The socket file is removed on shutdown. All state is in-memory.
pub async fn run(config: ServeConfig) -> Result<(), BrokerError> {
    let broker = Broker::from_config(&config).await?;
    let listener = bind_socket(&config.socket_path).await?;
    tracing::info!(
        path = %config.socket_path.display(),
        platform = %config.platform_name,
        "broker listening"
    );

    let shutdown = CancellationToken::new();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let signalled = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
        }
        signalled.cancel();
    });

    broker.serve(listener, shutdown).await;

    if let Err(e) = std::fs::remove_file(&config.socket_path) {
        tracing::warn!(error = %e, path = %config.socket_path.display(), "failed to remove socket");
    }
    tracing::info!("broker stopped");
    Ok(())
}

/// The engine, its hosted platform, and the request handler over both.
pub struct Broker {
    hosted: HostedPlatform,
    handler: Handler,
}

impl Broker {
    pub fn new(engine: Engine, hosted: HostedPlatform) -> Self {
        Self {
            handler: Handler::new(engine, hosted.clone()),
            hosted,
        }
    }

    /// Build the engine and hosted platform for a daemon.
    ///
    /// Directory entries without a platform become the hosted platform's
    /// catalog; their launch commands start processes that connect back
    /// to `config.socket_path`.
    pub async fn from_config(config: &ServeConfig) -> Result<Self, BrokerError> {
        let directory = match &config.directory {
            Some(path) => Some(Arc::new(StaticDirectory::load(path).await?)),
            None => None,
        };

        let commands = directory
            .as_ref()
            .map(|d| d.launch_commands())
            .unwrap_or_default();
        let launcher = ProcessLauncher::new(config.socket_path.clone(), commands);
        let hosted = HostedPlatform::with_config(
            config.platform_name.clone(),
            Arc::new(launcher),
            HostedConfig {
                launch_timeout: config.engine.launch_timeout,
                ..Default::default()
            },
        );
        if let Some(directory) = &directory {
            for definition in directory.hosted_definitions(&config.platform_name) {
                hosted.add_app(definition);
            }
        }

        let mut engine_config = config.engine.clone();
        engine_config
            .default_platform
            .get_or_insert_with(|| config.platform_name.clone());
        let engine = match directory {
            Some(directory) => Engine::with_directory(engine_config, directory),
            None => Engine::new(engine_config),
        };
        engine.register_platform(Arc::new(hosted.clone()));
        Ok(Self::new(engine, hosted))
    }

    /// Accept connections until `shutdown` is cancelled.
    pub async fn serve(&self, listener: UnixListener, shutdown: CancellationToken) {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ConnectionEvent>();
        let mut state = BrokerState::new();

        loop {
            tokio::select! {
                // -- New connection --
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let conn_id = ConnectionId::new();
                            connection::spawn_connection(
                                stream,
                                conn_id,
                                self.handler.clone(),
                                events_tx.clone(),
                            );
                            tracing::debug!(?conn_id, "accepted connection");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                        }
                    }
                }

                // -- Connection lifecycle --
                Some(event) = events_rx.recv() => self.apply(&mut state, event),

                () = shutdown.cancelled() => break,
            }
        }
        tracing::debug!(connections = state.len(), "broker loop exited");
    }

    fn apply(&self, state: &mut BrokerState, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Attached { id, role, instance } => {
                tracing::debug!(conn_id = ?id, ?role, "connection attached");
                state.add_connection(id, role, instance);
            }
            ConnectionEvent::Closed { id } => {
                if let Some(instance) = state.remove_connection(id) {
                    self.hosted.detach(&instance);
                }
                tracing::debug!(conn_id = ?id, "connection cleaned up");
            }
        }
    }
}

// -- Socket setup --

/// Default broker socket: `$XDG_RUNTIME_DIR/interop/broker.sock`.
pub fn default_socket_path() -> Result<PathBuf, BrokerError> {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR").map_err(|_| BrokerError::NoRuntimeDir)?;
    Ok(PathBuf::from(runtime_dir)
        .join("interop")
        .join("broker.sock"))
}

/// Create the socket directory and bind the Unix listener.
///
/// Handles stale socket detection: if the path is in use, try to connect
/// to it. A live peer means another broker is running; otherwise the
/// socket is stale and is replaced.
async fn bind_socket(path: &Path) -> Result<UnixListener, BrokerError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|source| BrokerError::MkdirFailed {
                path: parent.to_path_buf(),
                source,
            })?;
            // Only directories the broker creates are restricted to the owner.
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))
                    .map_err(|source| BrokerError::MkdirFailed {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
        }
    }

    let bind_failed = |source| BrokerError::BindFailed {
        path: path.to_path_buf(),
        source,
    };
    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            let attempt = tokio::time::timeout(Duration::from_secs(1), UnixStream::connect(path)).await;
            if matches!(attempt, Ok(Ok(_))) {
                return Err(BrokerError::AlreadyRunning(path.to_path_buf()));
            }
            tracing::info!(path = %path.display(), "removing stale socket");
            std::fs::remove_file(path).map_err(bind_failed)?;
            UnixListener::bind(path).map_err(bind_failed)
        }
        Err(e) => Err(bind_failed(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::Framed;

    use crate::engine::tests::{ctx, fast_config};
    use crate::ipc::codec::LengthPrefixedCodec;
    use crate::ipc::protocol::{Message, PROTOCOL_VERSION, Response, Role, Status, UNKNOWN_TYPE};
    use crate::model::{Application, ApplicationInstance, ContextTypes};
    use crate::platform::{AppDefinition, DeclaredIntent, FnLauncher, LaunchRequest, Launcher, NoLauncher};

    type Conn = Framed<UnixStream, LengthPrefixedCodec>;

    struct TestBroker {
        _dir: tempfile::TempDir,
        sock: PathBuf,
        hosted: HostedPlatform,
        shutdown: CancellationToken,
    }

    impl Drop for TestBroker {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    async fn start(launcher: Arc<dyn Launcher>) -> TestBroker {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("broker.sock");
        let hosted = HostedPlatform::new("hosted", launcher);
        let engine = Engine::new(fast_config());
        engine.register_platform(Arc::new(hosted.clone()));

        let listener = bind_socket(&sock).await.unwrap();
        let shutdown = CancellationToken::new();
        let broker = Broker::new(engine, hosted.clone());
        let token = shutdown.clone();
        tokio::spawn(async move { broker.serve(listener, token).await });

        TestBroker {
            _dir: dir,
            sock,
            hosted,
            shutdown,
        }
    }

    async fn connect(path: &Path) -> Conn {
        Framed::new(UnixStream::connect(path).await.unwrap(), LengthPrefixedCodec::new())
    }

    async fn recv(conn: &mut Conn) -> Message {
        tokio::time::timeout(Duration::from_secs(2), conn.next())
            .await
            .expect("no message within 2s")
            .unwrap()
            .unwrap()
    }

    async fn request(conn: &mut Conn, msg: Message) -> Response {
        conn.send(msg).await.unwrap();
        match recv(conn).await {
            Message::Response(response) => response,
            other => panic!("expected Response, got {other:?}"),
        }
    }

    fn hello(role: Role, app_id: Option<&str>, launch_token: Option<String>) -> Message {
        Message::Hello {
            id: 0,
            version: PROTOCOL_VERSION,
            role,
            app_id: app_id.map(str::to_string),
            name: None,
            instance_id: None,
            launch_token,
        }
    }

    async fn client(path: &Path) -> Conn {
        let mut conn = connect(path).await;
        conn.send(hello(Role::Client, None, None)).await.unwrap();
        assert!(matches!(
            recv(&mut conn).await,
            Message::HelloAck {
                status: Status::Ok,
                ..
            }
        ));
        conn
    }

    async fn app(path: &Path, app_id: &str) -> (Conn, ApplicationInstance) {
        let mut conn = connect(path).await;
        conn.send(hello(Role::App, Some(app_id), None)).await.unwrap();
        match recv(&mut conn).await {
            Message::HelloAck {
                status: Status::Ok,
                instance: Some(instance),
                ..
            } => (conn, instance),
            other => panic!("expected ok HelloAck, got {other:?}"),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // -- Handshake --

    #[tokio::test]
    async fn version_mismatch_closes_connection() {
        let broker = start(Arc::new(NoLauncher)).await;
        let mut conn = connect(&broker.sock).await;
        conn.send(Message::Hello {
            id: 0,
            version: 999,
            role: Role::Client,
            app_id: None,
            name: None,
            instance_id: None,
            launch_token: None,
        })
        .await
        .unwrap();
        match recv(&mut conn).await {
            Message::HelloAck { status, error, .. } => {
                assert_eq!(status, Status::Error);
                assert_eq!(error.as_deref(), Some("version_mismatch"));
            }
            other => panic!("expected HelloAck error, got {other:?}"),
        }
        assert!(conn.next().await.is_none(), "expected connection closed");
    }

    #[tokio::test]
    async fn non_hello_first_message_closes_connection() {
        let broker = start(Arc::new(NoLauncher)).await;
        let mut conn = connect(&broker.sock).await;
        conn.send(Message::ListPlatforms { id: 1 }).await.unwrap();
        assert!(conn.next().await.is_none());
    }

    #[tokio::test]
    async fn unknown_type_returns_error_keeps_connection() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        #[derive(serde::Serialize)]
        struct Unknown {
            #[serde(rename = "type")]
            msg_type: &'static str,
            id: u32,
        }

        let broker = start(Arc::new(NoLauncher)).await;
        let conn = client(&broker.sock).await;
        let (mut reader, mut writer) = conn.into_inner().into_split();

        async fn read_message(reader: &mut tokio::net::unix::OwnedReadHalf) -> Message {
            let mut len = [0u8; 4];
            reader.read_exact(&mut len).await.unwrap();
            let mut payload = vec![0u8; u32::from_be_bytes(len) as usize];
            reader.read_exact(&mut payload).await.unwrap();
            rmp_serde::from_slice(&payload).unwrap()
        }
        fn frame(payload: Vec<u8>) -> Vec<u8> {
            let mut out = (payload.len() as u32).to_be_bytes().to_vec();
            out.extend_from_slice(&payload);
            out
        }

        let unknown = rmp_serde::to_vec_named(&Unknown {
            msg_type: "frobnicate",
            id: 42,
        })
        .unwrap();
        writer.write_all(&frame(unknown)).await.unwrap();
        match read_message(&mut reader).await {
            Message::Response(response) => {
                assert_eq!(response.id, 42);
                assert_eq!(response.status, Status::Error);
                assert_eq!(response.code.as_deref(), Some(UNKNOWN_TYPE));
            }
            other => panic!("expected error Response, got {other:?}"),
        }

        let list = rmp_serde::to_vec_named(&Message::ListPlatforms { id: 7 }).unwrap();
        writer.write_all(&frame(list)).await.unwrap();
        match read_message(&mut reader).await {
            Message::Response(response) => {
                assert_eq!(response.id, 7);
                assert!(response.is_ok());
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    // -- Requests --

    #[tokio::test]
    async fn list_platforms_reports_hosted() {
        let broker = start(Arc::new(NoLauncher)).await;
        let mut conn = client(&broker.sock).await;
        let response = request(&mut conn, Message::ListPlatforms { id: 1 }).await;
        let platforms = response.platforms.unwrap();
        assert_eq!(platforms.len(), 1);
        assert_eq!(platforms[0].name, "hosted");
        assert!(platforms[0].online);
    }

    #[tokio::test]
    async fn raise_is_invoked_on_listening_app() {
        let broker = start(Arc::new(NoLauncher)).await;
        let (mut chart, instance) = app(&broker.sock, "chart").await;
        let response = request(
            &mut chart,
            Message::AddIntentListener {
                id: 1,
                intent: "ViewChart".into(),
                context_types: ContextTypes::of(["fdc3.instrument"]),
            },
        )
        .await;
        let subscription = response.subscription.unwrap();

        let mut cli = client(&broker.sock).await;
        cli.send(Message::Raise {
            id: 5,
            intent: "ViewChart".into(),
            context: ctx("AAPL"),
            target: None,
        })
        .await
        .unwrap();

        let invocation = match recv(&mut chart).await {
            Message::InvokeIntent {
                id,
                subscription: got,
                intent,
                context,
                ..
            } => {
                assert_eq!(got, subscription);
                assert_eq!(intent, "ViewChart");
                assert_eq!(context, ctx("AAPL"));
                id
            }
            other => panic!("expected InvokeIntent, got {other:?}"),
        };
        chart
            .send(Message::IntentReply {
                id: invocation,
                status: Status::Ok,
                error: None,
                context: Some(ctx("MSFT")),
            })
            .await
            .unwrap();

        match recv(&mut cli).await {
            Message::Response(response) => {
                assert_eq!(response.id, 5);
                let result = response.result.unwrap();
                assert_eq!(result.instance, instance);
                assert_eq!(result.data, Some(ctx("MSFT")));
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resolve_without_handlers_is_no_apps_found() {
        let broker = start(Arc::new(NoLauncher)).await;
        let mut cli = client(&broker.sock).await;
        let response = request(
            &mut cli,
            Message::Resolve {
                id: 2,
                intent: "ViewNews".into(),
                context: None,
            },
        )
        .await;
        assert_eq!(response.status, Status::Error);
        assert_eq!(response.code.as_deref(), Some("NoAppsFound"));
    }

    #[tokio::test]
    async fn broadcast_skips_sender() {
        let broker = start(Arc::new(NoLauncher)).await;
        let (mut a, a_instance) = app(&broker.sock, "blotter").await;
        let (mut b, _) = app(&broker.sock, "chart").await;
        for conn in [&mut a, &mut b] {
            let response = request(conn, Message::AddContextListener { id: 1 }).await;
            assert!(response.subscription.is_some());
        }

        // The sender's next message is its own response, not a delivery.
        let response = request(
            &mut a,
            Message::Broadcast {
                id: 2,
                context: ctx("AAPL"),
            },
        )
        .await;
        assert!(response.broadcast.unwrap().success);

        match recv(&mut b).await {
            Message::DeliverContext { context, from, .. } => {
                assert_eq!(context, ctx("AAPL"));
                assert_eq!(from, Some(a_instance));
            }
            other => panic!("expected DeliverContext, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pipelined_listeners_register_in_order() {
        let broker = start(Arc::new(NoLauncher)).await;
        let (mut app_conn, _) = app(&broker.sock, "chart").await;

        // Send every registration before reading any response.
        for id in 1..=8 {
            app_conn.send(Message::AddContextListener { id }).await.unwrap();
        }
        let mut by_request = Vec::new();
        for _ in 1..=8 {
            match recv(&mut app_conn).await {
                Message::Response(response) => {
                    by_request.push((response.id, response.subscription.unwrap()));
                }
                other => panic!("expected Response, got {other:?}"),
            }
        }
        by_request.sort_by_key(|(id, _)| *id);
        let expected: Vec<_> = by_request.into_iter().map(|(_, sub)| sub).collect();

        let mut cli = client(&broker.sock).await;
        let response = request(
            &mut cli,
            Message::Broadcast {
                id: 1,
                context: ctx("AAPL"),
            },
        )
        .await;
        assert!(response.broadcast.unwrap().success);

        let mut delivered = Vec::new();
        for _ in 1..=8 {
            match recv(&mut app_conn).await {
                Message::DeliverContext { subscription, .. } => delivered.push(subscription),
                other => panic!("expected DeliverContext, got {other:?}"),
            }
        }
        assert_eq!(delivered, expected);
    }

    #[tokio::test]
    async fn client_cannot_listen() {
        let broker = start(Arc::new(NoLauncher)).await;
        let mut cli = client(&broker.sock).await;
        let response = request(&mut cli, Message::AddContextListener { id: 3 }).await;
        assert_eq!(response.code.as_deref(), Some("InvalidInput"));
    }

    #[tokio::test]
    async fn disconnect_detaches_instance() {
        let broker = start(Arc::new(NoLauncher)).await;
        let (conn, instance) = app(&broker.sock, "chart").await;
        assert_eq!(broker.hosted.instances(), vec![instance]);

        drop(conn);
        settle().await;
        assert!(broker.hosted.instances().is_empty());
    }

    // -- Launch --

    #[tokio::test]
    async fn open_completes_when_launched_app_connects() {
        // Stands in for a spawned process: connect back with the token.
        let sock_slot: Arc<Mutex<Option<PathBuf>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&sock_slot);
        // Launched connections must outlive the launcher task.
        let keep: Arc<Mutex<Vec<Conn>>> = Arc::new(Mutex::new(Vec::new()));
        let held = Arc::clone(&keep);
        let launcher = FnLauncher::new(move |_host: HostedPlatform, request: LaunchRequest| {
            let path = slot.lock().unwrap().clone().unwrap();
            let keep = Arc::clone(&held);
            async move {
                tokio::spawn(async move {
                    let mut conn = connect(&path).await;
                    conn.send(hello(Role::App, request.app.app_id.as_deref(), Some(request.token)))
                        .await
                        .unwrap();
                    let _ack = recv(&mut conn).await;
                    keep.lock().unwrap().push(conn);
                });
                Ok(())
            }
        });

        let broker = start(Arc::new(launcher)).await;
        *sock_slot.lock().unwrap() = Some(broker.sock.clone());
        broker.hosted.add_app(AppDefinition {
            app: Application::new("chart", "hosted"),
            intents: vec![DeclaredIntent {
                name: "ViewChart".into(),
                context_types: ContextTypes::Any,
                method: None,
            }],
        });

        let mut cli = client(&broker.sock).await;
        let response = request(
            &mut cli,
            Message::Open {
                id: 1,
                app: Application::new("chart", "hosted"),
                context: None,
                config: None,
            },
        )
        .await;
        assert!(response.is_ok(), "open failed: {:?}", response.error);
        let instance = response.instance.unwrap();
        assert_eq!(broker.hosted.instances(), vec![instance]);
    }

    // -- Socket --

    #[tokio::test]
    async fn stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("nested").join("broker.sock");
        let first = bind_socket(&sock).await.unwrap();
        drop(first);
        // The file is left behind with no listener: stale.
        assert!(sock.exists());
        let _second = bind_socket(&sock).await.unwrap();
    }

    #[tokio::test]
    async fn live_socket_is_already_running() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("broker.sock");
        let _live = bind_socket(&sock).await.unwrap();
        let err = bind_socket(&sock).await.unwrap_err();
        assert!(matches!(err, BrokerError::AlreadyRunning(_)));
    }

    #[tokio::test]
    async fn from_config_loads_directory_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let apps = dir.path().join("apps.json");
        tokio::fs::write(
            &apps,
            r#"{"applications":[{"app_id":"chart","launch":{"program":"/bin/true"},
                "intents":[{"name":"ViewChart"}]}]}"#,
        )
        .await
        .unwrap();
        let config = ServeConfig {
            socket_path: dir.path().join("broker.sock"),
            platform_name: "desk".into(),
            directory: Some(apps),
            engine: EngineConfig::default(),
        };
        let broker = Broker::from_config(&config).await.unwrap();
        let catalog = broker.hosted.catalog();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].app.platform_name, "desk");
    }
}
