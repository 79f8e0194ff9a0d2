//! Front-end transport: runs a session over any DAP byte stream.

use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::info;

use crate::config::SessionConfig;
use crate::dap::{DapCodec, DecodedRequest, OutgoingMessage};
use crate::process::DebuggeeSpawner;
use crate::session::Session;
use crate::workspace::WorkspaceResolver;

/// Serve one debug session. Returns when the front end disconnects and the
/// debuggee has been shut down.
pub async fn serve<R, W>(
    config: SessionConfig,
    resolver: Arc<dyn WorkspaceResolver>,
    spawner: Arc<dyn DebuggeeSpawner>,
    reader: R,
    writer: W,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (frontend_tx, frontend_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_frontend(writer, frontend_rx));

    info!("Starting debug session");
    let session = Session::new(config, resolver, spawner, frontend_tx);
    let requests = FramedRead::new(reader, DapCodec::new()).filter_map(|frame| async move {
        match frame {
            Ok(DecodedRequest::Request(request)) => Some(Ok(request)),
            Ok(DecodedRequest::Malformed { body, error }) => {
                tracing::warn!(%body, %error, "Skipping unparseable front-end message");
                None
            }
            Err(e) => Some(Err(e)),
        }
    });
    session.run(std::pin::pin!(requests)).await;

    // Deferred responses hold sender clones; the writer ends once they finish.
    let result = writer_task
        .await
        .map_err(|e| io::Error::other(format!("front-end writer task failed: {e}")))?;
    info!("Debug session complete");
    result
}

/// Stamp outgoing sequence numbers and frame messages onto the front-end stream.
async fn write_frontend<W>(
    writer: W,
    mut messages: mpsc::UnboundedReceiver<OutgoingMessage>,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, DapCodec::new());
    let mut next_seq: u64 = 1;
    while let Some(mut message) = messages.recv().await {
        message.set_seq(next_seq);
        next_seq += 1;
        if let Err(e) = sink.send(message).await {
            tracing::error!(error = %e, "Failed to write to front end");
            return Err(e);
        }
    }
    Ok(())
}
