//! Transports carry whole frames of text between two peers.
//!
//! A byte stream (TCP, a Unix socket, an in-memory duplex) is framed with
//! [`FrameCodec`]; a WebSocket already delimits messages, so each text
//! message is one frame.

use futures_util::{Sink, SinkExt, Stream, StreamExt, future};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use switchboard_core::FrameCodec;
use switchboard_core::framing::MAX_MESSAGE_SIZE;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::codec::Framed;

/// Outgoing half of a transport.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = io::Error> + Send>>;
/// Incoming half of a transport.
pub type FrameStream = Pin<Box<dyn Stream<Item = io::Result<String>> + Send>>;

/// How frames are carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Delimiter-framed byte stream.
    Stream,
    /// One WebSocket text message per frame.
    WebSocket,
    /// Caller-provided sink and stream.
    Custom,
}

/// A bidirectional frame channel handed to a connection.
pub struct Transport {
    sink: FrameSink,
    stream: FrameStream,
    peer_addr: Option<SocketAddr>,
    kind: TransportKind,
}

impl Transport {
    pub fn from_parts<Si, St>(sink: Si, stream: St) -> Self
    where
        Si: Sink<String, Error = io::Error> + Send + 'static,
        St: Stream<Item = io::Result<String>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
            peer_addr: None,
            kind: TransportKind::Custom,
        }
    }

    /// Frame a byte stream with the default message size limit.
    pub fn framed<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::framed_with_max_message_size(io, MAX_MESSAGE_SIZE)
    }

    /// Frame a byte stream; a frame longer than `max` ends the stream with an error.
    pub fn framed_with_max_message_size<T>(io: T, max: usize) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let framed = Framed::new(io, FrameCodec::with_max_message_size(max));
        let (sink, stream) = framed.split::<String>();
        Self {
            kind: TransportKind::Stream,
            ..Self::from_parts(sink, stream)
        }
    }

    pub fn tcp(stream: TcpStream) -> Self {
        let peer_addr = stream.peer_addr().ok();
        Self::framed(stream).with_peer_addr(peer_addr)
    }

    /// Wrap an established WebSocket. Binary messages are accepted if they
    /// hold UTF-8; control messages are skipped.
    pub fn websocket<S>(ws: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let sink = sink
            .sink_map_err(io::Error::other)
            .with(|text: String| future::ready(Ok::<_, io::Error>(WsMessage::text(text))));
        let stream = stream.filter_map(|message| {
            future::ready(match message {
                Ok(WsMessage::Text(text)) => Some(Ok(text.to_string())),
                Ok(WsMessage::Binary(data)) => Some(
                    String::from_utf8(data.to_vec())
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
                ),
                Ok(_) => None,
                Err(e) => Some(Err(io::Error::other(e))),
            })
        });
        Self {
            kind: TransportKind::WebSocket,
            ..Self::from_parts(sink, stream)
        }
    }

    /// Two connected in-memory transports.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Self::framed(a), Self::framed(b))
    }

    pub fn with_peer_addr(mut self, peer_addr: Option<SocketAddr>) -> Self {
        self.peer_addr = peer_addr;
        self
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub(crate) fn into_parts(self) -> (FrameSink, FrameStream) {
        (self.sink, self.stream)
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("kind", &self.kind)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}
