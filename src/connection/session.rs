//! Connection Session
//!
//! Per-peer state attached to one accepted or dialed connection, and the task
//! body that pumps bytes between the socket, the receive buffer and the
//! caller's handler.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use super::handler::ConnectionHandler;
use crate::metrics::Metrics;

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed its side (read returned EOF)
    PeerClosed,
    /// Closure was requested locally (disconnect or cancellation)
    LocalClose,
    /// The socket failed
    Error(std::io::ErrorKind),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => f.write_str("closed by peer"),
            CloseReason::LocalClose => f.write_str("closed locally"),
            CloseReason::Error(kind) => write!(f, "transport error: {}", kind),
        }
    }
}

/// Handle on a live transport: queue bytes for writing or request closure.
///
/// The socket itself is owned by the task driving the session; this handle
/// only talks to that task.
#[derive(Debug, Clone)]
pub struct Transport {
    outbound: mpsc::UnboundedSender<Bytes>,
    close: CancellationToken,
}

/// The task-side half of a [`Transport`]
#[derive(Debug)]
pub struct TransportDriver {
    outbound: mpsc::UnboundedReceiver<Bytes>,
    close: CancellationToken,
}

impl Transport {
    /// Create a transport whose closure is also triggered by `close`'s parent
    pub fn channel(close: CancellationToken) -> (Transport, TransportDriver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Transport {
                outbound: tx,
                close: close.clone(),
            },
            TransportDriver {
                outbound: rx,
                close,
            },
        )
    }

    /// Queue bytes for the peer. Returns false once the transport is gone.
    pub fn write(&self, data: Bytes) -> bool {
        !self.close.is_cancelled() && self.outbound.send(data).is_ok()
    }

    /// Ask the driving task to close the socket. Does not wait.
    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn is_closing(&self) -> bool {
        self.close.is_cancelled()
    }
}

/// Live state of one TCP connection
pub struct ConnectionSession {
    id: Uuid,
    remote: SocketAddr,
    local: SocketAddr,
    started: Instant,
    transport: Transport,
    receive_buffer: Mutex<BytesMut>,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

impl ConnectionSession {
    pub fn new(remote: SocketAddr, local: SocketAddr, transport: Transport) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote,
            local,
            started: Instant::now(),
            transport,
            receive_buffer: Mutex::new(BytesMut::new()),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Registry key: `ip:port` of the remote side
    pub fn key(&self) -> String {
        peer_key(&self.remote)
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Queue bytes for the peer
    pub fn send(&self, data: impl Into<Bytes>) -> bool {
        self.transport.write(data.into())
    }

    /// Request closure of the underlying transport
    pub fn close(&self) {
        self.transport.close();
    }

    pub fn duration(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Bytes received but not yet consumed by the handler
    pub fn buffered(&self) -> usize {
        self.buffer().len()
    }

    /// Lock the receive-side accumulation buffer
    pub fn buffer(&self) -> MutexGuard<'_, BytesMut> {
        self.receive_buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Display for ConnectionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] up {:?}, rx {} B, tx {} B",
            self.key(),
            self.id,
            self.duration(),
            self.bytes_received(),
            self.bytes_sent()
        )
    }
}

impl fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("local", &self.local)
            .field("bytes_received", &self.bytes_received())
            .field("bytes_sent", &self.bytes_sent())
            .finish()
    }
}

/// Upper bound on writing out queued bytes once a session is closing
pub const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Composite `ip:port` key used by the registry
pub fn peer_key(addr: &SocketAddr) -> String {
    format!("{}:{}", addr.ip(), addr.port())
}

/// Pump one session until the peer leaves, the socket fails or closure is requested.
///
/// Bytes from the peer are appended to the session buffer and handed to the
/// handler in arrival order. The socket is shut down before returning.
pub async fn drive(
    stream: TcpStream,
    session: Arc<ConnectionSession>,
    mut driver: TransportDriver,
    handler: Arc<dyn ConnectionHandler>,
    metrics: Arc<Metrics>,
    read_buffer_size: usize,
) -> CloseReason {
    let (mut reader, mut writer) = stream.into_split();
    let mut chunk = BytesMut::with_capacity(read_buffer_size);

    let reason = loop {
        tokio::select! {
            _ = driver.close.cancelled() => break CloseReason::LocalClose,
            Some(data) = driver.outbound.recv() => {
                // A peer that stops reading must not pin the pump past a close request
                let written = tokio::select! {
                    biased;
                    _ = driver.close.cancelled() => break CloseReason::LocalClose,
                    written = writer.write_all(&data) => written,
                };
                if let Err(e) = written {
                    break CloseReason::Error(e.kind());
                }
                session.bytes_sent.fetch_add(data.len() as u64, Ordering::Relaxed);
                metrics.record_bytes_sent(data.len());
            }
            read = reader.read_buf(&mut chunk) => match read {
                Ok(0) => break CloseReason::PeerClosed,
                Ok(n) => {
                    session.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                    metrics.record_bytes_received(n);
                    trace!("{}: {} bytes: {:02x?}", session.key(), n, &chunk[..n.min(32)]);
                    {
                        let mut buffer = session.buffer();
                        buffer.extend_from_slice(&chunk);
                        handler.on_data(&session, &mut buffer);
                    }
                    chunk.clear();
                }
                Err(e) => break CloseReason::Error(e.kind()),
            }
        }
    };

    // Flush anything the handler queued before the close, within a bounded time
    let flush = async {
        while let Ok(data) = driver.outbound.try_recv() {
            writer.write_all(&data).await?;
            session.bytes_sent.fetch_add(data.len() as u64, Ordering::Relaxed);
            metrics.record_bytes_sent(data.len());
        }
        writer.shutdown().await
    };
    match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, flush).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("{}: flush after close failed: {}", session.key(), e),
        Err(_) => debug!(
            "{}: peer not reading, dropping unsent data after {:?}",
            session.key(),
            CLOSE_FLUSH_TIMEOUT
        ),
    }
    driver.close.cancel();

    reason
}
