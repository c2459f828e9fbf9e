// src/transport/writer.rs
//! Queued frame writer
//!
//! Frames are pushed onto an unbounded queue and drained by one writer task
//! per connection, so at most one flush is ever in progress for a socket.
//! Each frame is written as its header followed by the payload in
//! fixed-size slices, which bounds per-call buffer sizes and lets the OS
//! apply backpressure.

use crate::transport::codec::encode_header;
use crate::utils::errors::{ControllerError, Result};
use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Handle used to enqueue frames for a connection
#[derive(Debug, Clone)]
pub struct FrameSender {
    queue: mpsc::UnboundedSender<Bytes>,
}

impl FrameSender {
    /// Queue one frame payload; fails once the writer has stopped
    pub fn send(&self, payload: Bytes) -> Result<()> {
        self.queue
            .send(payload)
            .map_err(|_| ControllerError::ConnectionLost("frame writer stopped".into()))
    }
}

/// Spawn the writer task for `io`
///
/// The task ends when every [`FrameSender`] clone is dropped (after
/// draining the queue) or when a write fails. The write half is shut down
/// on exit.
pub fn spawn_writer<W>(io: W, chunk_size: usize) -> (FrameSender, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(flush_loop(io, rx, chunk_size.max(1)));
    (FrameSender { queue: tx }, handle)
}

async fn flush_loop<W>(
    mut io: W,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
    chunk_size: usize,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(payload) = queue.recv().await {
        if let Err(e) = write_frame(&mut io, &payload, chunk_size).await {
            warn!(error = %e, "Frame write failed, closing writer");
            queue.close();
            return Err(e);
        }
    }

    debug!("Frame queue closed, shutting down write half");
    io.shutdown().await?;
    Ok(())
}

/// Write one frame: header, then payload in `chunk_size` slices
pub async fn write_frame<W>(io: &mut W, payload: &[u8], chunk_size: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = encode_header(payload.len())?;
    io.write_all(&header).await?;

    for chunk in payload.chunks(chunk_size.max(1)) {
        io.write_all(chunk).await?;
    }

    io.flush().await?;
    Ok(())
}
