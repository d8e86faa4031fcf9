//! The connection task: protocol state machine for one transport.

use crate::application::{Application, MethodResult};
use crate::connection::{Connection, ConnectionEvent, SessionHost, SessionInfo};
use crate::error::Error;
use crate::proxy::RemoteProxy;
use crate::transport::{FrameSink, FrameStream};
use futures_util::{FutureExt, SinkExt, StreamExt, future};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::message::{self, HEARTBEAT, STRATEGY_ANONYMOUS, VERB_ERROR, VERB_OK};
use switchboard_core::{ConnectionState, ErrorCode, Frame, InterfaceRef, Kind, Message, RemoteError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

pub(crate) type CallReply = oneshot::Sender<Result<Vec<Value>, Error>>;

pub(crate) enum Command {
    Call {
        interface: String,
        method: String,
        args: Vec<Value>,
        reply: Option<CallReply>,
    },
    Event {
        interface: String,
        event: String,
        args: Vec<Value>,
    },
    Handshake {
        app: InterfaceRef,
        credentials: Option<(String, String)>,
        reply: oneshot::Sender<Result<String, Error>>,
    },
    Inspect {
        interface: String,
        reply: oneshot::Sender<Result<RemoteProxy, Error>>,
    },
    Ping {
        reply: oneshot::Sender<()>,
    },
    /// Result of a locally served call, sent back as a callback.
    Respond {
        id: i64,
        result: MethodResult,
    },
    /// A locally served call panicked.
    Fault {
        id: i64,
        interface: String,
        method: String,
        panic: Box<dyn Any + Send>,
    },
    StartHeartbeat(Duration),
    StopHeartbeat,
    Close,
}

/// An outgoing request waiting for its response.
enum Pending {
    /// `None` for detached calls.
    Call(Option<CallReply>),
    Handshake {
        reply: oneshot::Sender<Result<String, Error>>,
        login: Option<String>,
    },
    Inspect {
        interface: String,
        reply: oneshot::Sender<Result<RemoteProxy, Error>>,
    },
    Ping(oneshot::Sender<()>),
}

/// Why the connection task stops.
enum Stop {
    Closed,
    Failed(Error),
    /// A handler panic, resumed once the connection has shut down.
    Panicked(Box<dyn Any + Send>),
}

type Step = Result<(), Stop>;

pub(crate) struct Driver {
    connection: Connection,
    sink: FrameSink,
    session: watch::Sender<SessionInfo>,
    state: ConnectionState,
    application: Option<Arc<Application>>,
    host: Option<Arc<dyn SessionHost>>,
    next_id: i64,
    id_step: i64,
    pending: HashMap<i64, Pending>,
    proxies: HashMap<String, RemoteProxy>,
    heartbeat: Option<Interval>,
    handshake_deadline: Option<Instant>,
}

impl Driver {
    pub(crate) fn new(
        connection: Connection,
        sink: FrameSink,
        session: watch::Sender<SessionInfo>,
        application: Option<Arc<Application>>,
        host: Option<Arc<dyn SessionHost>>,
    ) -> Self {
        let handshake_deadline = host
            .as_ref()
            .and_then(|host| host.handshake_timeout())
            .map(|timeout| Instant::now() + timeout);

        Self {
            id_step: connection.role().id_step(),
            connection,
            sink,
            session,
            state: ConnectionState::AwaitingHandshake,
            application,
            host,
            next_id: 0,
            pending: HashMap::new(),
            proxies: HashMap::new(),
            heartbeat: None,
            handshake_deadline,
        }
    }

    pub(crate) async fn run(mut self, mut stream: FrameStream, mut commands: mpsc::UnboundedReceiver<Command>) {
        debug!(
            "Connection {} opened ({:?}, peer {:?})",
            self.connection.id(),
            self.connection.role(),
            self.connection.peer_addr()
        );

        let stop = loop {
            let step = tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(text)) => self.on_frame(&text).await,
                    Some(Err(e)) => Err(Stop::Failed(e.into())),
                    None => Err(Stop::Closed),
                },
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => Err(Stop::Closed),
                },
                _ = tick(&mut self.heartbeat) => self.send_text(HEARTBEAT.to_string()).await,
                _ = expire(self.handshake_deadline) => self.on_handshake_timeout(),
            };
            if let Err(stop) = step {
                break stop;
            }
        };

        if let Some(panic) = self.finish(stop).await {
            std::panic::resume_unwind(panic);
        }
    }

    fn id(&self) -> u64 {
        self.connection.id()
    }

    fn allocate_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += self.id_step;
        id
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.connection.events().send(event);
    }

    async fn send_text(&mut self, text: String) -> Step {
        trace!("Connection {} >> {}", self.id(), text);
        self.sink.send(text).await.map_err(|e| Stop::Failed(e.into()))
    }

    async fn send(&mut self, message: &Message) -> Step {
        self.send_text(message.encode()).await
    }

    /// Reject a message. Before the handshake completes every rejection is fatal.
    fn reject(&self, message: Value, reason: &str) -> Step {
        self.reject_with(message, reason, self.state != ConnectionState::HandshakeDone)
    }

    fn reject_with(&self, message: Value, reason: &str, fatal: bool) -> Step {
        warn!(
            "Connection {} rejected message ({}{}): {}",
            self.id(),
            reason,
            if fatal { ", closing" } else { "" },
            message
        );
        self.emit(ConnectionEvent::MessageRejected { message, fatal });
        if fatal { Err(Stop::Closed) } else { Ok(()) }
    }

    // Incoming frames

    async fn on_frame(&mut self, text: &str) -> Step {
        trace!("Connection {} << {}", self.id(), text);

        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => return Err(Stop::Failed(Error::Protocol(e.into()))),
        };

        let message = match message::from_value(value.clone()) {
            Ok(Frame::Heartbeat) => {
                self.emit(ConnectionEvent::Heartbeat);
                return Ok(());
            }
            Ok(Frame::Unrecognized(value)) => return self.reject(value, "unknown message kind"),
            Ok(Frame::Message(message)) => message,
            Err(e) => return self.reject(value, &e.to_string()),
        };

        if self.state != ConnectionState::HandshakeDone && message.kind != Kind::Handshake {
            return self.reject(value, "handshake required");
        }

        match message.kind {
            Kind::Handshake if message.target.is_some() => self.on_handshake_request(message).await,
            Kind::Handshake => self.on_handshake_response(message),
            Kind::Call => self.on_call(message).await,
            Kind::Callback => self.on_callback(message),
            Kind::Event => self.on_event(message),
            Kind::Inspect => self.on_inspect(message).await,
            Kind::Ping => self.send(&Message::pong(message.id)).await,
            Kind::Pong => {
                self.on_pong(message.id);
                Ok(())
            }
        }
    }

    async fn on_handshake_request(&mut self, message: Message) -> Step {
        if self.state == ConnectionState::HandshakeDone {
            return self.reject_with(message.to_value(), "repeated handshake", true);
        }

        let Some(host) = self.host.clone() else {
            let err = RemoteError::new(ErrorCode::NotAServer);
            return self.refuse_handshake(message.id, &err).await;
        };
        let Some(target) = message.target.as_ref() else {
            return self.reject(message.to_value(), "handshake without application");
        };

        let Some(application) = host.resolve_application(target.name(), target.version()) else {
            debug!("Connection {}: no application matches {}", self.id(), target);
            let err = RemoteError::new(ErrorCode::AppNotFound);
            return self.refuse_handshake(message.id, &err).await;
        };

        let strategy = message.verb.as_deref().unwrap_or(STRATEGY_ANONYMOUS);
        host.handshake_requested(&self.connection, target.name(), strategy);

        let started = host.start_session(&self.connection, &application, strategy, &message.payload);
        let outcome = match self.handshake_deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, started).await {
                Ok(outcome) => outcome,
                Err(_) => return self.on_handshake_timeout(),
            },
            None => started.await,
        };

        let grant = match outcome {
            Ok(grant) => grant,
            Err(err) => {
                debug!("Connection {}: session refused: {}", self.id(), err);
                return self.refuse_handshake(message.id, &err).await;
            }
        };

        self.handshake_deadline = None;
        self.state = ConnectionState::HandshakeDone;
        self.application = Some(application.clone());
        self.session.send_modify(|info| {
            info.state = ConnectionState::HandshakeDone;
            info.username = grant.username.clone();
            info.session_id = Some(grant.session_id.clone());
            info.application = Some(application);
        });
        info!(
            "Connection {} handshake done: app {}, strategy {}, user {:?}",
            self.id(),
            target,
            strategy,
            grant.username
        );

        // Register the session before the peer can observe it.
        self.emit(ConnectionEvent::HandshakeDone {
            session_id: grant.session_id.clone(),
            username: grant.username,
        });
        host.session_started(&self.connection);
        self.send(&Message::handshake_ok(message.id, &grant.session_id)).await
    }

    /// Answer a handshake with an error and close.
    async fn refuse_handshake(&mut self, id: i64, err: &RemoteError) -> Step {
        self.send(&Message::handshake_error(id, err)).await?;
        Err(Stop::Closed)
    }

    fn on_handshake_response(&mut self, message: Message) -> Step {
        let (reply, login) = match self.pending.remove(&message.id) {
            Some(Pending::Handshake { reply, login }) => (reply, login),
            other => {
                self.restore(message.id, other);
                return self.reject(message.to_value(), "unexpected handshake response");
            }
        };

        if message.is_verb(VERB_ERROR) {
            let err = RemoteError::from_wire(&message.payload);
            debug!("Connection {} handshake refused: {}", self.id(), err);
            let _ = reply.send(Err(Error::Remote(err)));
            return Ok(());
        }

        let session_id = match (&message.payload, message.is_verb(VERB_OK)) {
            (Value::String(id), true) => id.clone(),
            _ => return self.reject(message.to_value(), "malformed handshake response"),
        };

        self.state = ConnectionState::HandshakeDone;
        self.session.send_modify(|info| {
            info.state = ConnectionState::HandshakeDone;
            info.username = login.clone();
            info.session_id = Some(session_id.clone());
        });
        info!("Connection {} handshake done: session {}", self.id(), session_id);

        self.emit(ConnectionEvent::HandshakeDone {
            session_id: session_id.clone(),
            username: login,
        });
        let _ = reply.send(Ok(session_id));
        Ok(())
    }

    async fn on_call(&mut self, message: Message) -> Step {
        let id = message.id;
        let interface = message.target_name().unwrap_or_default().to_string();

        let Some(method_name) = message.verb.clone() else {
            let err = RemoteError::new(ErrorCode::InvalidSignature);
            self.send(&Message::callback_error(id, &err)).await?;
            return self.reject(message.to_value(), "call without method");
        };
        let Value::Array(args) = message.payload else {
            let err = RemoteError::new(ErrorCode::InvalidSignature);
            return self.send(&Message::callback_error(id, &err)).await;
        };

        let resolved = match &self.application {
            Some(app) => app.resolve_method(&interface, &method_name, args.len()).cloned(),
            None => Err(RemoteError::new(ErrorCode::InterfaceNotFound)),
        };
        let method = match resolved {
            Ok(method) => method,
            Err(err) => return self.send(&Message::callback_error(id, &err)).await,
        };

        let connection = self.connection.clone();
        tokio::spawn(async move {
            let handle = connection.clone();
            let outcome = AssertUnwindSafe(async move { method.invoke(handle, args).await })
                .catch_unwind()
                .await;
            let command = match outcome {
                Ok(result) => Command::Respond { id, result },
                Err(panic) => Command::Fault {
                    id,
                    interface,
                    method: method_name,
                    panic,
                },
            };
            let _ = connection.command(command);
        });
        Ok(())
    }

    fn on_callback(&mut self, message: Message) -> Step {
        let result = if message.is_verb(VERB_OK) {
            Ok(message.args())
        } else if message.is_verb(VERB_ERROR) {
            Err(RemoteError::from_wire(&message.payload))
        } else {
            return self.reject(message.to_value(), "callback without result");
        };

        match self.pending.remove(&message.id) {
            Some(Pending::Call(Some(reply))) => {
                let _ = reply.send(result.map_err(Error::Remote));
            }
            Some(Pending::Call(None)) => {
                if let Err(err) = result {
                    warn!("Connection {}: detached call {} failed: {}", self.id(), message.id, err);
                    self.emit(ConnectionEvent::Error(Arc::new(Error::Remote(err))));
                }
            }
            Some(Pending::Inspect { interface, reply }) => {
                let response = result.map_err(Error::Remote).map(|names| {
                    let names = names
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect();
                    self.register_proxy(interface, names)
                });
                let _ = reply.send(response);
            }
            other => {
                // Late or unknown callbacks are dropped.
                self.restore(message.id, other);
                return self.reject(message.to_value(), "no pending call");
            }
        }
        Ok(())
    }

    fn register_proxy(&mut self, interface: String, methods: Vec<String>) -> RemoteProxy {
        let listeners = self.proxies.get(&interface).map(RemoteProxy::listeners);
        let proxy = RemoteProxy::new(self.connection.clone(), &interface, methods, listeners);
        self.proxies.insert(interface, proxy.clone());
        proxy
    }

    fn on_event(&mut self, message: Message) -> Step {
        let (Some(interface), Some(event)) = (message.target_name(), message.verb.as_deref()) else {
            return self.reject(message.to_value(), "event without name");
        };
        let args = message.args();

        if let Some(proxy) = self.proxies.get(interface) {
            proxy.emit_local(event, &args);
        }
        if let Some(app) = &self.application {
            app.handle_event(&self.connection, interface, event, args.clone());
        }
        self.emit(ConnectionEvent::Event {
            interface: interface.to_string(),
            event: event.to_string(),
            args,
        });
        Ok(())
    }

    async fn on_inspect(&mut self, message: Message) -> Step {
        let methods = match (&self.application, message.target_name()) {
            (Some(app), Some(interface)) => app.methods(interface),
            _ => None,
        };
        let response = match methods {
            Some(names) => Message::callback_ok(message.id, names.into_iter().map(Value::String).collect()),
            None => Message::callback_error(message.id, &RemoteError::new(ErrorCode::InterfaceNotFound)),
        };
        self.send(&response).await
    }

    fn on_pong(&mut self, id: i64) {
        match self.pending.remove(&id) {
            Some(Pending::Ping(reply)) => {
                let _ = reply.send(());
            }
            other => {
                trace!("Connection {}: unmatched pong {}", self.id(), id);
                self.restore(id, other);
            }
        }
    }

    fn restore(&mut self, id: i64, entry: Option<Pending>) {
        if let Some(entry) = entry {
            self.pending.insert(id, entry);
        }
    }

    fn on_handshake_timeout(&mut self) -> Step {
        self.handshake_deadline = None;
        warn!("Connection {} handshake timed out", self.id());
        self.emit(ConnectionEvent::HandshakeTimeout);
        if let Some(host) = &self.host {
            host.handshake_timed_out(&self.connection);
        }
        Err(Stop::Closed)
    }

    // Commands from handles

    async fn on_command(&mut self, command: Command) -> Step {
        match command {
            Command::Call {
                interface,
                method,
                args,
                reply,
            } => {
                let id = self.allocate_id();
                self.pending.insert(id, Pending::Call(reply));
                self.send(&Message::call(id, &interface, &method, args)).await
            }
            Command::Event { interface, event, args } => {
                let id = self.allocate_id();
                self.send(&Message::event(id, &interface, &event, args)).await
            }
            Command::Handshake {
                app,
                credentials,
                reply,
            } => {
                let id = self.allocate_id();
                let login = credentials.as_ref().map(|(login, _)| login.clone());
                let message = Message::handshake_request(
                    id,
                    &app,
                    credentials
                        .as_ref()
                        .map(|(login, password)| (login.as_str(), password.as_str())),
                );
                self.pending.insert(id, Pending::Handshake { reply, login });
                self.send(&message).await
            }
            Command::Inspect { interface, reply } => {
                let id = self.allocate_id();
                self.pending.insert(
                    id,
                    Pending::Inspect {
                        interface: interface.clone(),
                        reply,
                    },
                );
                self.send(&Message::inspect(id, &interface)).await
            }
            Command::Ping { reply } => {
                let id = self.allocate_id();
                self.pending.insert(id, Pending::Ping(reply));
                self.send(&Message::ping(id)).await
            }
            Command::Respond { id, result } => {
                let message = match result {
                    Ok(values) => Message::callback_ok(id, values),
                    Err(err) => Message::callback_error(id, &err),
                };
                self.send(&message).await
            }
            Command::Fault {
                id,
                interface,
                method,
                panic,
            } => {
                error!("Connection {}: handler {}.{} panicked", self.id(), interface, method);
                let err = RemoteError::new(ErrorCode::InternalApiError);
                // The panic escalates even if the answer can't be written.
                let _ = self.send(&Message::callback_error(id, &err)).await;
                self.emit(ConnectionEvent::HandlerFault { interface, method });
                Err(Stop::Panicked(panic))
            }
            Command::StartHeartbeat(period) => {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.heartbeat = Some(interval);
                Ok(())
            }
            Command::StopHeartbeat => {
                self.heartbeat = None;
                Ok(())
            }
            Command::Close => Err(Stop::Closed),
        }
    }

    async fn finish(mut self, stop: Stop) -> Option<Box<dyn Any + Send>> {
        let panic = match stop {
            Stop::Closed => None,
            Stop::Failed(err) => {
                warn!("Connection {} failed: {}", self.id(), err);
                let err = Arc::new(err);
                self.emit(ConnectionEvent::Error(err.clone()));
                if let Some(host) = &self.host {
                    host.connection_error(&self.connection, &err);
                }
                None
            }
            Stop::Panicked(panic) => Some(panic),
        };

        let _ = self.sink.close().await;
        self.heartbeat = None;
        self.handshake_deadline = None;
        // Waiting callers observe Error::Closed when their reply is dropped.
        let abandoned = self.pending.len();
        self.pending.clear();
        self.proxies.clear();

        self.state = ConnectionState::Closed;
        self.session.send_modify(|info| info.state = ConnectionState::Closed);
        debug!("Connection {} closed ({} pending dropped)", self.id(), abandoned);

        self.emit(ConnectionEvent::Closed);
        if let Some(host) = &self.host {
            host.connection_closed(&self.connection);
        }
        panic
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}
