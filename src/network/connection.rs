//! Framed connection halves
//!
//! The TCP stream is split into a reading and a writing half. The reader
//! cuts frames out of the stream and parses them, the writer sends complete
//! frames. Both update a shared set of counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::protocol::{parse_frame, Decoder, Message, ProtocolError};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection closed")]
    Closed,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// State of the connection to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Traffic counters shared by both halves
#[derive(Debug, Default)]
pub struct ConnectionStats {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// Point in time copy of [`ConnectionStats`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl ConnectionStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Reading half: yields one frame at a time
pub struct FrameReader<R> {
    inner: R,
    decoder: Decoder,
    read_buf: BytesMut,
    stats: Arc<ConnectionStats>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, stats: Arc<ConnectionStats>) -> Self {
        Self {
            inner,
            decoder: Decoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            stats,
        }
    }

    /// Receive the raw bytes of the next frame.
    /// Returns `None` when the peer closed the stream between frames.
    pub async fn recv_frame(&mut self) -> ConnectionResult<Option<BytesMut>> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.read_buf)? {
                self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Received frame of {} bytes", frame.len());
                return Ok(Some(frame));
            }

            let mut buf = [0u8; 1024];
            let n = self.inner.read(&mut buf).await?;

            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                } else {
                    return Err(ConnectionError::Closed);
                }
            }

            self.read_buf.extend_from_slice(&buf[..n]);
            self.stats.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    /// Receive and parse the next frame
    pub async fn recv(&mut self) -> ConnectionResult<Option<Message>> {
        match self.recv_frame().await? {
            Some(frame) => Ok(Some(parse_frame(&frame)?)),
            None => Ok(None),
        }
    }
}

/// Writing half: sends complete frames
pub struct FrameWriter<W> {
    inner: W,
    stats: Arc<ConnectionStats>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, stats: Arc<ConnectionStats>) -> Self {
        Self { inner, stats }
    }

    /// Write one complete frame
    pub async fn send(&mut self, frame: &[u8]) -> ConnectionResult<()> {
        self.inner.write_all(frame).await?;
        self.inner.flush().await?;

        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_sent
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        tracing::trace!("Sent frame of {} bytes", frame.len());
        Ok(())
    }

    /// Close the writing direction
    pub async fn shutdown(&mut self) -> ConnectionResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Split a connected stream into framed halves sharing one set of counters
pub fn frame_halves(
    stream: TcpStream,
) -> (
    FrameReader<OwnedReadHalf>,
    FrameWriter<OwnedWriteHalf>,
    Arc<ConnectionStats>,
) {
    let stats = Arc::new(ConnectionStats::default());
    let (read_half, write_half) = stream.into_split();
    (
        FrameReader::new(read_half, stats.clone()),
        FrameWriter::new(write_half, stats.clone()),
        stats,
    )
}
