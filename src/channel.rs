use bytes::Bytes;
use std::net::SocketAddr;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ChannelClosed;

/// Write side of one leg of a session.
///
/// Frames are queued on a bounded channel and written by a dedicated writer
/// task, so a full queue is the backpressure signal for the other leg.
/// Cloning the handle shares the same transport.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    peer: SocketAddr,
    tx: mpsc::Sender<Bytes>,
    closed: CancellationToken,
}

impl ChannelHandle {
    /// Spawn the writer task for `writer` on the current runtime.
    pub fn spawn<W>(writer: W, peer: SocketAddr, capacity: usize) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();
        tokio::spawn(write_loop(writer, rx, closed.clone(), peer));
        Self { peer, tx, closed }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue a frame, waiting for space if the queue is full.
    pub async fn write_and_flush(&self, frame: Bytes) -> Result<(), ChannelClosed> {
        if self.closed.is_cancelled() {
            return Err(ChannelClosed { peer: self.peer });
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| ChannelClosed { peer: self.peer })
    }

    /// Queue a frame without waiting. Fails if the transport is closed or
    /// the queue is full.
    pub fn try_write(&self, frame: Bytes) -> Result<(), ChannelClosed> {
        if self.closed.is_cancelled() {
            return Err(ChannelClosed { peer: self.peer });
        }
        self.tx
            .try_send(frame)
            .map_err(|_| ChannelClosed { peer: self.peer })
    }

    /// True while the transport is open and the write queue has room.
    pub fn is_writable(&self) -> bool {
        !self.closed.is_cancelled() && self.tx.capacity() > 0
    }

    /// Resolves once the write queue has room again.
    pub async fn writable(&self) -> Result<(), ChannelClosed> {
        if self.closed.is_cancelled() {
            return Err(ChannelClosed { peer: self.peer });
        }
        self.tx
            .reserve()
            .await
            .map(drop)
            .map_err(|_| ChannelClosed { peer: self.peer })
    }

    /// Close the transport. Frames queued before the call are still written.
    /// Safe to call any number of times.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the transport has been closed, locally or by a write
    /// failure.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Bytes>,
    closed: CancellationToken,
    peer: SocketAddr,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    warn!("Write to {} failed: {}", peer, e);
                    closed.cancel();
                    return;
                }
            }
        }
    }

    // Drain what was queued before the close
    while let Ok(frame) = rx.try_recv() {
        if write_frame(&mut writer, &frame).await.is_err() {
            break;
        }
    }
    closed.cancel();
    let _ = writer.shutdown().await;
    debug!("Channel to {} closed", peer);
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}
