//! Content-Length framed JSON codec for the front-end channel.
//!
//! DAP messages are framed using an HTTP-like header section:
//!
//! ```text
//! Content-Length: 123\r\n
//! \r\n
//! { ...json... }
//! ```

use std::io;

use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::messages::{OutgoingMessage, Request};

pub const MAX_DAP_MESSAGE_BYTES: usize = 16 * 1024 * 1024;
pub const MAX_DAP_HEADER_BYTES: usize = 8 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// One decoded front-end frame.
///
/// A frame with a valid header but an unparseable body is reported as
/// `Malformed`; the codec has already consumed it and the stream continues.
#[derive(Debug, Clone)]
pub enum DecodedRequest {
    Request(Request),
    Malformed { body: String, error: String },
}

#[derive(Debug, Default)]
pub struct DapCodec {
    /// Body length of the message whose headers were already consumed.
    pending_body: Option<usize>,
}

impl DapCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_headers(headers: &[u8]) -> io::Result<usize> {
        let headers = std::str::from_utf8(headers).map_err(|_| invalid("DAP header is not UTF-8"))?;
        let mut content_length = None;
        for line in headers.split("\r\n") {
            if let Some((name, value)) = line.split_once(':')
                && name.trim().eq_ignore_ascii_case("Content-Length")
            {
                let value = value.trim();
                content_length = Some(value.parse::<usize>().map_err(|e| {
                    invalid(format!("invalid Content-Length {value:?}: {e}"))
                })?);
            }
        }
        let len = content_length.ok_or_else(|| invalid("DAP message missing Content-Length header"))?;
        if len > MAX_DAP_MESSAGE_BYTES {
            return Err(invalid(format!(
                "DAP message Content-Length {len} exceeds maximum allowed size {MAX_DAP_MESSAGE_BYTES}"
            )));
        }
        Ok(len)
    }
}

impl Decoder for DapCodec {
    type Item = DecodedRequest;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let len = match self.pending_body {
            Some(len) => len,
            None => {
                let Some(end) = src
                    .windows(HEADER_TERMINATOR.len())
                    .position(|w| w == HEADER_TERMINATOR)
                else {
                    if src.len() > MAX_DAP_HEADER_BYTES {
                        return Err(invalid(format!(
                            "DAP header exceeds maximum size ({MAX_DAP_HEADER_BYTES} bytes)"
                        )));
                    }
                    return Ok(None);
                };
                let len = Self::parse_headers(&src[..end])?;
                src.advance(end + HEADER_TERMINATOR.len());
                self.pending_body = Some(len);
                len
            }
        };

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        self.pending_body = None;
        let body = src.split_to(len);
        match serde_json::from_slice(&body) {
            Ok(request) => Ok(Some(DecodedRequest::Request(request))),
            Err(e) => Ok(Some(DecodedRequest::Malformed {
                body: String::from_utf8_lossy(&body).into_owned(),
                error: e.to_string(),
            })),
        }
    }
}

impl Encoder<OutgoingMessage> for DapCodec {
    type Error = io::Error;

    fn encode(&mut self, item: OutgoingMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item).map_err(|e| invalid(e.to_string()))?;
        let header = format!("Content-Length: {}\r\n\r\n", json.len());
        dst.reserve(header.len() + json.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(&json);
        Ok(())
    }
}
