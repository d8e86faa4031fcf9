//! Connection handle.
//!
//! Each connection runs as its own task that exclusively owns the message id
//! counter, the pending-call table, the handshake state and the timers. The
//! [`Connection`] handle is a cheap clone that talks to that task over a
//! command channel; state changes are published on a watch channel and
//! notable occurrences on a broadcast channel of [`ConnectionEvent`]s.

use crate::application::Application;
use crate::driver::{Command, Driver};
use crate::error::Error;
use crate::proxy::RemoteProxy;
use crate::transport::{Transport, TransportKind};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use switchboard_core::{ConnectionState, InterfaceRef, RemoteError};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 256;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Which side of the handshake a connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates the handshake; outgoing ids count up from 0.
    Client,
    /// Answers handshakes; outgoing ids count down from 0.
    Server,
}

impl Role {
    pub(crate) fn id_step(self) -> i64 {
        match self {
            Role::Client => 1,
            Role::Server => -1,
        }
    }
}

/// Notifications published by a connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    HandshakeDone {
        session_id: String,
        username: Option<String>,
    },
    /// The peer sent an empty frame.
    Heartbeat,
    /// The peer emitted an event.
    Event {
        interface: String,
        event: String,
        args: Vec<Value>,
    },
    /// A message was refused. Fatal rejections close the connection.
    MessageRejected { message: Value, fatal: bool },
    /// A method handler panicked while serving a call. The connection
    /// closes and the panic resumes in [`Connection::join`].
    HandlerFault { interface: String, method: String },
    HandshakeTimeout,
    /// A transport or protocol fault, or a failure of a detached call.
    Error(Arc<Error>),
    Closed,
}

/// Snapshot of the session state.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub state: ConnectionState,
    pub username: Option<String>,
    pub session_id: Option<String>,
    /// The application serving incoming calls.
    pub application: Option<Arc<Application>>,
}

impl SessionInfo {
    pub(crate) fn new(application: Option<Arc<Application>>) -> Self {
        Self {
            state: ConnectionState::AwaitingHandshake,
            username: None,
            session_id: None,
            application,
        }
    }
}

/// Outcome of a successful session start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionGrant {
    pub username: Option<String>,
    pub session_id: String,
}

/// Server-side collaborator that answers handshakes and observes the
/// connection lifecycle.
///
/// The connection task waits on [`SessionHost::start_session`], so an
/// implementation must not await calls on the same connection from it.
#[async_trait]
pub trait SessionHost: Send + Sync + 'static {
    /// Time allowed for the peer to complete a handshake.
    fn handshake_timeout(&self) -> Option<Duration> {
        None
    }

    fn resolve_application(&self, name: &str, version: Option<&str>) -> Option<Arc<Application>>;

    /// Authenticate the peer for `application` using `strategy`.
    async fn start_session(
        &self,
        connection: &Connection,
        application: &Arc<Application>,
        strategy: &str,
        credentials: &Value,
    ) -> Result<SessionGrant, RemoteError>;

    fn handshake_requested(&self, _connection: &Connection, _application: &str, _strategy: &str) {}

    fn session_started(&self, _connection: &Connection) {}

    fn handshake_timed_out(&self, _connection: &Connection) {}

    fn connection_error(&self, _connection: &Connection, _error: &Error) {}

    fn connection_closed(&self, _connection: &Connection) {}
}

struct Inner {
    id: u64,
    role: Role,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ConnectionEvent>,
    session: watch::Receiver<SessionInfo>,
    peer_addr: Option<SocketAddr>,
    transport: TransportKind,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a live protocol connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Start a client-role connection. Incoming calls from the server are
    /// served by `application`.
    pub fn client(transport: Transport, application: Arc<Application>) -> Self {
        Self::spawn(transport, Role::Client, Some(application), None)
    }

    /// Start a server-role connection. The application is bound during the
    /// handshake through `host`.
    pub fn server(transport: Transport, host: Arc<dyn SessionHost>) -> Self {
        Self::spawn(transport, Role::Server, None, Some(host))
    }

    fn spawn(
        transport: Transport,
        role: Role,
        application: Option<Arc<Application>>,
        host: Option<Arc<dyn SessionHost>>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (session_tx, session) = watch::channel(SessionInfo::new(application.clone()));

        let connection = Self {
            inner: Arc::new(Inner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                role,
                commands,
                events,
                session,
                peer_addr: transport.peer_addr(),
                transport: transport.kind(),
                task: Mutex::new(None),
            }),
        };

        let (sink, stream) = transport.into_parts();
        let driver = Driver::new(connection.clone(), sink, session_tx, application, host);
        let task = tokio::spawn(driver.run(stream, command_rx));
        *connection.inner.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        connection
    }

    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.inner.transport
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.session.borrow().state
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    pub fn session(&self) -> SessionInfo {
        self.inner.session.borrow().clone()
    }

    pub fn username(&self) -> Option<String> {
        self.inner.session.borrow().username.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.session.borrow().session_id.clone()
    }

    pub fn application(&self) -> Option<Arc<Application>> {
        self.inner.session.borrow().application.clone()
    }

    /// Subscribe to connection events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn events(&self) -> &broadcast::Sender<ConnectionEvent> {
        &self.inner.events
    }

    pub(crate) fn command(&self, command: Command) -> Result<(), Error> {
        self.inner.commands.send(command).map_err(|_| Error::Closed)
    }

    /// Call a remote method and wait for its callback.
    ///
    /// Responses to concurrent calls may arrive in any order; each is
    /// matched to its call by message id. There is no call timeout.
    pub async fn call_method(&self, interface: &str, method: &str, args: Vec<Value>) -> Result<Vec<Value>, Error> {
        let (reply, response) = oneshot::channel();
        self.command(Command::Call {
            interface: interface.to_string(),
            method: method.to_string(),
            args,
            reply: Some(reply),
        })?;
        response.await.map_err(|_| Error::Closed)?
    }

    /// Call a remote method without waiting. An error response is published
    /// as [`ConnectionEvent::Error`].
    pub fn call_method_detached(&self, interface: &str, method: &str, args: Vec<Value>) -> Result<(), Error> {
        self.command(Command::Call {
            interface: interface.to_string(),
            method: method.to_string(),
            args,
            reply: None,
        })
    }

    /// Send an event to the peer. No response is expected.
    pub fn emit_remote_event(&self, interface: &str, event: &str, args: Vec<Value>) -> Result<(), Error> {
        self.command(Command::Event {
            interface: interface.to_string(),
            event: event.to_string(),
            args,
        })
    }

    /// Handshake with the peer's `app` (`name` or `name@range`), logging in
    /// when both `login` and `password` are given. Returns the session id.
    pub async fn handshake(&self, app: &str, login: Option<&str>, password: Option<&str>) -> Result<String, Error> {
        let credentials = match (login, password) {
            (Some(login), Some(password)) => Some((login.to_string(), password.to_string())),
            _ => None,
        };
        self.handshake_with(InterfaceRef::from(app), credentials).await
    }

    /// Handshake with an explicit application reference.
    ///
    /// A version that isn't a valid semver range fails before anything is sent.
    pub async fn handshake_with(
        &self,
        app: InterfaceRef,
        credentials: Option<(String, String)>,
    ) -> Result<String, Error> {
        app.version_range()?;
        let (reply, response) = oneshot::channel();
        self.command(Command::Handshake {
            app,
            credentials,
            reply,
        })?;
        response.await.map_err(|_| Error::Closed)?
    }

    /// Ask the peer which methods `interface` exposes and build a proxy for it.
    pub async fn inspect_interface(&self, interface: &str) -> Result<RemoteProxy, Error> {
        let (reply, response) = oneshot::channel();
        self.command(Command::Inspect {
            interface: interface.to_string(),
            reply,
        })?;
        response.await.map_err(|_| Error::Closed)?
    }

    /// Round-trip a ping.
    pub async fn ping(&self) -> Result<(), Error> {
        let (reply, response) = oneshot::channel();
        self.command(Command::Ping { reply })?;
        response.await.map_err(|_| Error::Closed)
    }

    /// Send a heartbeat every `interval`, replacing any running heartbeat.
    /// A zero interval stops it.
    pub fn start_heartbeat(&self, interval: Duration) -> Result<(), Error> {
        if interval.is_zero() {
            return self.stop_heartbeat();
        }
        self.command(Command::StartHeartbeat(interval))
    }

    pub fn stop_heartbeat(&self) -> Result<(), Error> {
        self.command(Command::StopHeartbeat)
    }

    /// Close the connection. Pending calls fail with [`Error::Closed`].
    pub fn close(&self) {
        // Already closed if the task is gone.
        let _ = self.command(Command::Close);
    }

    /// Wait until the connection has closed.
    pub async fn closed(&self) {
        let mut session = self.inner.session.clone();
        let _ = session
            .wait_for(|info| info.state == ConnectionState::Closed)
            .await;
    }

    /// Wait for the connection task to end.
    ///
    /// If a method handler panicked, the caller was answered with
    /// `internal-api-error`, the connection closed, and the panic resumes
    /// here. Only the first caller observes the panic; later callers just
    /// wait for the close.
    pub async fn join(&self) {
        let task = self.inner.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        match task {
            Some(task) => {
                if let Err(e) = task.await {
                    if e.is_panic() {
                        std::panic::resume_unwind(e.into_panic());
                    }
                }
            }
            None => self.closed().await,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .field("peer_addr", &self.inner.peer_addr)
            .finish()
    }
}
