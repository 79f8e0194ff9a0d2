//! Sequenced request writer for the debuggee's stdin.
//!
//! Sequence numbers are allocated while holding the writer lock, so the order
//! requests appear on the wire always matches their sequence order.

use std::io;

use futures::SinkExt;
use serde_json::Value;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;

use super::codec::WireCodec;
use super::protocol::OutgoingRequest;

type BoxedSink = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, WireCodec>;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("debuggee not started")]
    NotAttached,
    #[error("failed to write to debuggee: {0}")]
    Io(#[from] io::Error),
}

struct Inner {
    next_seq: u64,
    sink: Option<BoxedSink>,
}

/// Session-lifetime writer: one sequence counter, at most one attached stdin.
pub struct BackendWriter {
    inner: Mutex<Inner>,
}

impl Default for BackendWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendWriter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_seq: 1,
                sink: None,
            }),
        }
    }

    /// Attach the debuggee's stdin. Replaces any previous sink.
    pub async fn attach<W>(&self, writer: W)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let boxed: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        self.inner.lock().await.sink = Some(FramedWrite::new(boxed, WireCodec::new()));
    }

    /// Drop the sink, closing the debuggee's stdin.
    pub async fn detach(&self) {
        self.inner.lock().await.sink = None;
    }

    pub async fn is_attached(&self) -> bool {
        self.inner.lock().await.sink.is_some()
    }

    /// Stamp and write one request. Returns the sequence number used.
    pub async fn send(&self, command: &str, arguments: Value) -> Result<u64, SendError> {
        let mut inner = self.inner.lock().await;
        if inner.sink.is_none() {
            return Err(SendError::NotAttached);
        }
        // A failed write still consumes the number; sequence numbers are never reused.
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let request = OutgoingRequest::new(seq, command, arguments);
        tracing::debug!(target: "etch_bridge::backend", seq, %command, "Sending to debuggee");
        let sink = inner.sink.as_mut().ok_or(SendError::NotAttached)?;
        sink.send(request).await?;
        Ok(seq)
    }
}
