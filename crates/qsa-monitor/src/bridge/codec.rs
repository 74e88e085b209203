//! Framed codec for admin/worker communication.
//!
//! Every frame is a 4-byte big-endian length followed by a JSON payload.
//! `JsonCodec` plugs into FramedRead/FramedWrite; `encode` and `decode_stream`
//! cover one-off writes and reads over any AsyncRead. Commands travel the
//! other way as text lines, decoded by `CommandCodec`.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::bridge::protocol::{Command, ParsedCommand, parse_line};

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Target of per-command wire events. The worker's log buffer skips it.
pub const WIRE_TARGET: &str = "qsa_monitor::wire";

/// Longest command line accepted before the connection is dropped.
pub const MAX_COMMAND_LINE: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Peer closed the connection before a full prefix or payload arrived.
    #[error("connection closed mid-frame ({received} of {expected} bytes)")]
    Closed { received: usize, expected: usize },

    #[error("invalid frame payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload of {0} bytes does not fit a 4-byte length prefix")]
    TooLarge(usize),

    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

/// Serialize `value` and prefix it with its length.
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, FrameError> {
    let json = serde_json::to_vec(value)?;
    let len = u32::try_from(json.len()).map_err(|_| FrameError::TooLarge(json.len()))?;

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + json.len());
    buf.put_u32(len);
    buf.extend_from_slice(&json);
    Ok(buf.freeze())
}

/// Read exactly one frame from `reader` and deserialize it.
///
/// Short reads are accumulated until the prefix and then the payload are
/// complete, so the transport may deliver the frame in arbitrarily small chunks.
pub async fn decode_stream<R, T>(reader: &mut R) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    read_full(reader, &mut prefix).await?;
    let len = u32::from_be_bytes(prefix) as usize;

    let mut payload = vec![0u8; len];
    read_full(reader, &mut payload).await?;

    Ok(serde_json::from_slice(&payload)?)
}

async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(FrameError::Closed {
                received: filled,
                expected: buf.len(),
            });
        }
        filled += n;
    }
    Ok(())
}

/// Codec that frames messages with a length prefix and serializes with JSON.
///
/// Wraps LengthDelimitedCodec and adds serde_json serialization.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(LENGTH_PREFIX_LEN)
                .max_frame_length(u32::MAX as usize)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let item = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let json_len = json.len();
        tracing::trace!(target: WIRE_TARGET, json_size_bytes = json_len, "Encoding frame");
        if json_len > 100_000 {
            tracing::debug!(
                target: WIRE_TARGET,
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(Bytes::from(json), dst)
    }
}

/// Decoder for the admin → worker command stream.
///
/// Lines end with `\n`; an unterminated tail is held until the rest arrives.
/// The exception is a bare token such as `stats` from a peer that has not
/// sent a newline yet, which is decoded as soon as it is complete.
#[derive(Debug, Default)]
pub struct CommandCodec {
    line_framed: bool,
}

impl CommandCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

fn is_bare_token(tail: &[u8]) -> bool {
    !tail
        .iter()
        .any(|b| b.is_ascii_digit() || b.is_ascii_whitespace())
        && Command::find_in(&String::from_utf8_lossy(tail)).is_some()
}

impl Decoder for CommandCodec {
    type Item = ParsedCommand;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(pos) = src.iter().position(|b| *b == b'\n') {
            self.line_framed = true;
            let line = src.split_to(pos + 1);
            let text = String::from_utf8_lossy(&line[..pos]);
            let text = text.trim();
            if !text.is_empty() {
                return Ok(Some(parse_line(text)));
            }
        }

        if src.len() > MAX_COMMAND_LINE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("command line exceeds {MAX_COMMAND_LINE} bytes"),
            ));
        }

        if !self.line_framed && is_bare_token(src) {
            let tail = src.split();
            return Ok(Some(parse_line(&String::from_utf8_lossy(&tail))));
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(command) = self.decode(src)? {
            return Ok(Some(command));
        }
        let tail = src.split();
        let text = String::from_utf8_lossy(&tail);
        let text = text.trim();
        Ok((!text.is_empty()).then(|| parse_line(text)))
    }
}
