//! Chat server: one room, served over TCP and WebSocket.

use crate::protocol::{APPLICATION, ChatMessage, ROOM};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};
use switchboard_connection::{Application, Connection, ErrorCode, RemoteError};
use switchboard_server::{Server, ServerConfig, ServerEvent};

const HISTORY: usize = 100;

#[derive(Default)]
struct Room {
    messages: VecDeque<ChatMessage>,
    users: HashMap<u64, String>,
}

impl Room {
    fn add_message(&mut self, from: &str, text: String) -> ChatMessage {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let message = ChatMessage {
            from: from.to_string(),
            text,
            timestamp,
        };
        self.messages.push_back(message.clone());
        if self.messages.len() > HISTORY {
            self.messages.pop_front();
        }
        message
    }
}

type SharedRoom = Arc<Mutex<Room>>;

fn lock(room: &SharedRoom) -> std::sync::MutexGuard<'_, Room> {
    room.lock().unwrap_or_else(|e| e.into_inner())
}

fn text_arg(args: &[Value]) -> Result<String, RemoteError> {
    args.first()
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RemoteError::with_message(ErrorCode::InvalidSignature, "expected a string"))
}

fn chat_application(room: SharedRoom, server: Arc<OnceLock<Server>>) -> anyhow::Result<Application> {
    let join_room = room.clone();
    let join_server = server.clone();
    let say_room = room.clone();
    let say_server = server;
    let app = Application::builder(APPLICATION)
        .method(ROOM, "join", 1, move |connection: Connection, args: Vec<Value>| {
            let room = join_room.clone();
            let server = join_server.clone();
            async move {
                let name = text_arg(&args)?;
                let history: Vec<Value> = {
                    let mut room = lock(&room);
                    room.users.insert(connection.id(), name.clone());
                    room.messages.iter().map(ChatMessage::to_value).collect()
                };
                tracing::info!("{} joined", name);
                if let Some(server) = server.get() {
                    server.broadcast(ROOM, "system", vec![json!(format!("{} joined", name))]);
                }
                Ok::<_, RemoteError>(vec![Value::Array(history)])
            }
        })
        .method(ROOM, "say", 1, move |connection: Connection, args: Vec<Value>| {
            let room = say_room.clone();
            let server = say_server.clone();
            async move {
                let text = text_arg(&args)?;
                let message = {
                    let mut room = lock(&room);
                    let Some(name) = room.users.get(&connection.id()).cloned() else {
                        return Err(RemoteError::with_message(ErrorCode::Generic, "join the room first"));
                    };
                    room.add_message(&name, text)
                };
                if let Some(server) = server.get() {
                    server.broadcast(ROOM, "message", vec![message.to_value()]);
                }
                Ok::<_, RemoteError>(vec![])
            }
        })
        .method(ROOM, "who", 0, move |_connection: Connection, _args: Vec<Value>| {
            let room = room.clone();
            async move {
                let mut users: Vec<String> = lock(&room).users.values().cloned().collect();
                users.sort();
                Ok::<_, RemoteError>(users.into_iter().map(Value::String).collect())
            }
        })
        .build()?;
    Ok(app)
}

pub async fn run(config: ServerConfig, tcp: SocketAddr, ws: Option<SocketAddr>) -> anyhow::Result<()> {
    let room = SharedRoom::default();
    let slot = Arc::new(OnceLock::new());
    let server = Server::builder()
        .application(chat_application(room.clone(), slot.clone())?)
        .config(config)
        .build()?;
    let _ = slot.set(server.clone());

    let mut events = server.subscribe();
    let watcher = server.clone();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ServerEvent::Connect(connection) => {
                    tracing::debug!("Client {} connected from {:?}", connection.id(), connection.peer_addr());
                }
                ServerEvent::Disconnect(connection) => {
                    let left = lock(&room).users.remove(&connection.id());
                    if let Some(name) = left {
                        tracing::info!("{} left", name);
                        watcher.broadcast(ROOM, "system", vec![json!(format!("{} left", name))]);
                    }
                }
                ServerEvent::HandshakeTimeout(connection) => {
                    tracing::warn!("Handshake timed out for {:?}", connection.peer_addr());
                }
                ServerEvent::ConnectionError { connection, error } => {
                    tracing::warn!("Connection error from {:?}: {}", connection.peer_addr(), error);
                }
                ServerEvent::HandshakeRequest { .. } => {}
            }
        }
    });

    match ws {
        Some(ws) => {
            let ws_server = server.clone();
            tokio::try_join!(server.listen_tcp(tcp), ws_server.listen_ws(ws))?;
        }
        None => server.listen_tcp(tcp).await?,
    }
    Ok(())
}
