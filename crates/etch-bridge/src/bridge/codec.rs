//! Line-delimited JSON codec for debuggee communication.
//!
//! Uses LinesCodec for framing + serde_json for serialization.
//! A line that fails to parse is surfaced as [`Decoded::Malformed`] instead of
//! an error, so one bad record never terminates the stream.

use std::io;

use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use super::protocol::{IncomingMessage, OutgoingRequest};

/// Upper bound on a single debuggee record.
pub const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// One decoded line from the debuggee's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(IncomingMessage),
    Malformed { line: String, error: String },
}

/// Codec that frames records with `\n` and serializes with JSON.
pub struct WireCodec {
    inner: LinesCodec,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl WireCodec {
    pub fn new() -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(MAX_LINE_BYTES),
        }
    }

    fn parse_line(line: String) -> Option<Decoded> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(match serde_json::from_str::<IncomingMessage>(trimmed) {
            Ok(msg) => Decoded::Message(msg),
            Err(e) => Decoded::Malformed {
                line: trimmed.to_string(),
                error: e.to_string(),
            },
        })
    }

    /// Map line-framing failures that leave the stream usable to `Malformed`.
    fn recover(err: LinesCodecError) -> Result<Decoded, io::Error> {
        match err {
            LinesCodecError::MaxLineLengthExceeded => Ok(Decoded::Malformed {
                line: String::new(),
                error: format!("line exceeds {MAX_LINE_BYTES} bytes"),
            }),
            // LinesCodec consumes the line before validating UTF-8.
            LinesCodecError::Io(e) if e.kind() == io::ErrorKind::InvalidData => {
                Ok(Decoded::Malformed {
                    line: String::new(),
                    error: e.to_string(),
                })
            }
            LinesCodecError::Io(e) => Err(e),
        }
    }
}

impl Decoder for WireCodec {
    type Item = Decoded;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.inner.decode(src) {
                Ok(Some(line)) => {
                    if let Some(decoded) = Self::parse_line(line) {
                        return Ok(Some(decoded));
                    }
                }
                Ok(None) => return Ok(None),
                Err(e) => return Self::recover(e).map(Some),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.inner.decode_eof(src) {
                Ok(Some(line)) => {
                    if let Some(decoded) = Self::parse_line(line) {
                        return Ok(Some(decoded));
                    }
                }
                Ok(None) => return Ok(None),
                Err(e) => return Self::recover(e).map(Some),
            }
        }
    }
}

impl Encoder<OutgoingRequest> for WireCodec {
    type Error = io::Error;

    fn encode(&mut self, item: OutgoingRequest, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(seq = item.seq, json_size_bytes = json.len(), "Encoding request");
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
