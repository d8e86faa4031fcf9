//! Delimiter framing for byte-stream transports.
//!
//! Frames are UTF-8 text terminated by a single `\0` byte.

use bytes::BytesMut;
use std::io;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, Encoder};

/// Byte that terminates every frame.
pub const DELIMITER: u8 = 0;

/// Largest frame accepted before the stream is considered broken (8 MiB).
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Codec splitting a byte stream into text frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    inner: AnyDelimiterCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_message_size(MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(max: usize) -> Self {
        Self {
            inner: AnyDelimiterCodec::new_with_max_length(vec![DELIMITER], vec![DELIMITER], max),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn into_io(err: AnyDelimiterCodecError) -> io::Error {
    match err {
        AnyDelimiterCodecError::Io(err) => err,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        let Some(chunk) = self.inner.decode(buf).map_err(into_io)? else {
            return Ok(None);
        };
        String::from_utf8(chunk.to_vec())
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        // An unterminated tail at EOF is not a frame.
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                buf.clear();
                Ok(None)
            }
        }
    }
}

impl<T: AsRef<str>> Encoder<T> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: T, buf: &mut BytesMut) -> Result<(), io::Error> {
        self.inner.encode(frame, buf).map_err(into_io)
    }
}
