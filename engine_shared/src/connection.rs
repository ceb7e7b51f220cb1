//! One established, framed stream connection.
//!
//! A [`Connection`] is a cheap handle; clones refer to the same socket.
//! Each live connection runs two tasks on the owning peer's runtime:
//! - a receive loop feeding a [`FrameDecoder`] and queueing `Data` events,
//! - a writer draining this connection's send queue, so concurrent
//!   `send` calls never interleave bytes on the wire.
//!
//! `disconnect` stops both at once: frames still queued are discarded and
//! the socket is shut down without waiting for the remote to read.
//!
//! The owning peer is the only party that removes a connection from its live
//! set; `disconnect` asks it to.

use std::{
    fmt, io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, Notify},
};
use tracing::{debug, warn};

use crate::{
    event::PeerEvent,
    frame::{encode_frame, FrameDecoder},
    peer::PeerShared,
};

const READ_CHUNK: usize = 16 * 1024;

/// Frames a connection may have queued for its writer. A remote that
/// falls this far behind is disconnected.
pub const SEND_QUEUE_FRAMES: usize = 1024;

/// Upper bound on the final shutdown of the write side (TLS close_notify).
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque, process-unique connection id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn new_unique() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle to a live (or formerly live) connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: ConnectionId,
    remote_addr: SocketAddr,
    idle_timeout: Option<Duration>,
    connected: AtomicBool,
    timed_out: AtomicBool,
    /// Taken on disconnect.
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    /// Wakes the receive loop on disconnect.
    closed: Notify,
    /// Wakes the writer on disconnect.
    write_closed: Notify,
    peer: Weak<PeerShared>,
}

/// Stream and queue handed to the I/O tasks once the connection is
/// registered.
pub(crate) struct ConnectionIo<S> {
    stream: S,
    outbound_rx: mpsc::Receiver<Bytes>,
}

impl Connection {
    pub(crate) fn open<S>(
        stream: S,
        remote_addr: SocketAddr,
        idle_timeout: Option<Duration>,
        peer: &Arc<PeerShared>,
    ) -> (Connection, ConnectionIo<S>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(SEND_QUEUE_FRAMES);
        let connection = Connection {
            inner: Arc::new(Inner {
                id: ConnectionId::new_unique(),
                remote_addr,
                idle_timeout,
                connected: AtomicBool::new(true),
                timed_out: AtomicBool::new(false),
                outbound: Mutex::new(Some(outbound_tx)),
                closed: Notify::new(),
                write_closed: Notify::new(),
                peer: Arc::downgrade(peer),
            }),
        };
        (
            connection,
            ConnectionIo {
                stream,
                outbound_rx,
            },
        )
    }

    /// Starts the receive and writer tasks. Must run inside the runtime.
    pub(crate) fn spawn_io<S>(&self, io: ConnectionIo<S>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io.stream);
        tokio::spawn(write_loop(self.clone(), writer, io.outbound_rx));
        tokio::spawn(receive_loop(self.clone(), reader));
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.inner.idle_timeout
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// True once the receive loop gave up after the idle timeout.
    pub fn is_timed_out(&self) -> bool {
        self.inner.timed_out.load(Ordering::Acquire)
    }

    /// Frames `payload` and queues it for the writer.
    ///
    /// Failures are not reported: oversized payloads are logged and dropped,
    /// and sends on a closed connection are ignored. A broken socket, or a
    /// send queue that reached [`SEND_QUEUE_FRAMES`], shows up as a
    /// `Disconnect` event.
    pub fn send(&self, payload: &[u8]) {
        let frame = match encode_frame(payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(connection = %self.id(), error = %e, "dropping unsendable payload");
                return;
            }
        };
        let overflowed = {
            let outbound = self
                .inner
                .outbound
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            matches!(
                outbound.as_ref().map(|tx| tx.try_send(frame)),
                Some(Err(mpsc::error::TrySendError::Full(_)))
            )
        };
        if overflowed {
            warn!(connection = %self.id(), queued = SEND_QUEUE_FRAMES, "send queue full, disconnecting");
            self.disconnect();
        }
    }

    /// Closes the connection. Safe to call any number of times from any
    /// thread; only the first call has an effect.
    pub fn disconnect(&self) {
        if !self.inner.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner
            .outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.inner.closed.notify_one();
        self.inner.write_closed.notify_one();
        debug!(connection = %self.id(), timed_out = self.is_timed_out(), "disconnected");
        if let Some(peer) = self.inner.peer.upgrade() {
            peer.remove(self);
        }
    }

    /// Queues a `Data` event unless the connection already left the live
    /// set, so no data follows its `Disconnect`.
    fn emit_data(&self, payload: Bytes, at: Instant) {
        if let Some(peer) = self.inner.peer.upgrade() {
            peer.push_if_live(PeerEvent::Data {
                connection: self.clone(),
                payload,
                at,
            });
        }
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Connection {}

impl std::hash::Hash for Connection {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Receive-side state; dropping it tears the connection down, whatever
/// ended the loop.
struct Receiver {
    connection: Connection,
    decoder: FrameDecoder,
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.decoder.reset();
        self.connection.disconnect();
    }
}

async fn read_some<R>(reader: &mut R, buf: &mut [u8], idle: Option<Duration>) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match idle {
        Some(limit) => tokio::time::timeout(limit, reader.read(buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "idle timeout"))?,
        None => reader.read(buf).await,
    }
}

async fn receive_loop<R>(connection: Connection, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut rx = Receiver {
        connection,
        decoder: FrameDecoder::new(),
    };
    let id = rx.connection.id();
    let idle = rx.connection.idle_timeout();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut frames = Vec::new();

    loop {
        let read = tokio::select! {
            _ = rx.connection.inner.closed.notified() => break,
            read = read_some(&mut reader, &mut buf, idle) => read,
        };

        match read {
            Ok(0) => {
                debug!(connection = %id, "remote closed the stream");
                break;
            }
            Ok(n) => {
                rx.decoder.feed(&buf[..n], &mut frames);
                let at = Instant::now();
                for payload in frames.drain(..) {
                    rx.connection.emit_data(payload, at);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                rx.connection.inner.timed_out.store(true, Ordering::Release);
                debug!(connection = %id, "idle timeout");
                break;
            }
            Err(e) => {
                debug!(connection = %id, error = %e, "receive failed");
                break;
            }
        }
    }
}

async fn write_loop<W>(connection: Connection, mut writer: W, mut outbound: mpsc::Receiver<Bytes>)
where
    W: AsyncWrite + Unpin,
{
    let closed = &connection.inner.write_closed;
    loop {
        let frame = tokio::select! {
            biased;
            _ = closed.notified() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        // A remote that stopped reading must not hold up a disconnect.
        let written = tokio::select! {
            biased;
            _ = closed.notified() => break,
            written = writer.write_all(&frame) => written,
        };
        if let Err(e) = written {
            debug!(connection = %connection.id(), error = %e, "send failed");
            connection.disconnect();
            break;
        }
    }
    // Whatever is still queued is discarded.
    drop(outbound);
    if tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await.is_err() {
        debug!(connection = %connection.id(), "write shutdown timed out");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn addr() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<PeerEvent>) -> PeerEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event queue closed")
    }

    #[tokio::test]
    async fn frames_become_data_events() {
        let (shared, mut events) = PeerShared::new();
        let (local, mut remote) = duplex(1024);
        let (conn, io) = Connection::open(local, addr(), None, &shared);
        assert!(shared.register(&conn));
        conn.spawn_io(io);
        assert!(matches!(next_event(&mut events).await, PeerEvent::Connect { .. }));

        remote.write_all(&encode_frame(b"hello").unwrap()).await.unwrap();
        remote.write_all(&encode_frame(b"").unwrap()).await.unwrap();

        match next_event(&mut events).await {
            PeerEvent::Data { payload, connection, .. } => {
                assert_eq!(payload.as_ref(), b"hello");
                assert_eq!(connection, conn);
            }
            other => panic!("unexpected {other:?}"),
        }
        match next_event(&mut events).await {
            PeerEvent::Data { payload, .. } => assert!(payload.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_writes_length_prefixed_frame() {
        let (shared, _events) = PeerShared::new();
        let (local, mut remote) = duplex(1024);
        let (conn, io) = Connection::open(local, addr(), None, &shared);
        shared.register(&conn);
        conn.spawn_io(io);

        conn.send(b"abc");
        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, &[0, 3, b'a', b'b', b'c']);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (shared, mut events) = PeerShared::new();
        let (local, mut remote) = duplex(1024);
        let (conn, io) = Connection::open(local, addr(), None, &shared);
        shared.register(&conn);
        conn.spawn_io(io);
        next_event(&mut events).await;

        conn.disconnect();
        conn.disconnect();
        assert!(!conn.is_connected());
        assert!(matches!(next_event(&mut events).await, PeerEvent::Disconnect { .. }));

        // The remote side sees the stream close.
        let mut buf = [0u8; 1];
        assert_eq!(remote.read(&mut buf).await.unwrap(), 0);
        assert!(events.try_recv().is_err());
        assert_eq!(shared.connection_count(), 0);
    }

    #[tokio::test]
    async fn remote_close_disconnects() {
        let (shared, mut events) = PeerShared::new();
        let (local, remote) = duplex(1024);
        let (conn, io) = Connection::open(local, addr(), None, &shared);
        shared.register(&conn);
        conn.spawn_io(io);
        next_event(&mut events).await;

        drop(remote);
        assert!(matches!(next_event(&mut events).await, PeerEvent::Disconnect { .. }));
        assert!(!conn.is_connected());
        assert!(!conn.is_timed_out());
    }

    #[tokio::test]
    async fn silence_past_idle_timeout_times_out() {
        let (shared, mut events) = PeerShared::new();
        let (local, _remote) = duplex(1024);
        let (conn, io) = Connection::open(local, addr(), Some(Duration::from_millis(50)), &shared);
        shared.register(&conn);
        conn.spawn_io(io);
        next_event(&mut events).await;

        assert!(matches!(next_event(&mut events).await, PeerEvent::Disconnect { .. }));
        assert!(conn.is_timed_out());
    }

    #[tokio::test]
    async fn oversized_send_is_dropped() {
        let (shared, _events) = PeerShared::new();
        let (local, mut remote) = duplex(1 << 17);
        let (conn, io) = Connection::open(local, addr(), None, &shared);
        shared.register(&conn);
        conn.spawn_io(io);

        conn.send(&vec![0u8; 70_000]);
        conn.send(b"x");
        let mut buf = [0u8; 3];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, &[0, 1, b'x']);
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn disconnect_discards_queued_frames() {
        let (shared, _events) = PeerShared::new();
        let (local, mut remote) = duplex(64);
        let (conn, io) = Connection::open(local, addr(), None, &shared);
        shared.register(&conn);
        conn.spawn_io(io);

        for _ in 0..100 {
            conn.send(&[7u8; 30]);
        }
        conn.disconnect();

        let mut delivered = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), remote.read_to_end(&mut delivered))
            .await
            .expect("stream never closed")
            .unwrap();
        assert!(delivered.len() < 100 * 32, "{} bytes written after disconnect", delivered.len());
    }

    #[tokio::test]
    async fn full_send_queue_disconnects() {
        let (shared, mut events) = PeerShared::new();
        let (local, _remote) = duplex(64);
        let (conn, io) = Connection::open(local, addr(), None, &shared);
        shared.register(&conn);
        conn.spawn_io(io);
        next_event(&mut events).await;

        for _ in 0..SEND_QUEUE_FRAMES + 16 {
            conn.send(b"backlog");
        }
        assert!(!conn.is_connected());
        assert!(matches!(next_event(&mut events).await, PeerEvent::Disconnect { .. }));
        assert_eq!(shared.connection_count(), 0);
    }

    #[tokio::test]
    async fn no_data_after_local_disconnect() {
        let (shared, mut events) = PeerShared::new();
        let (local, mut remote) = duplex(1024);
        let (conn, io) = Connection::open(local, addr(), None, &shared);
        shared.register(&conn);
        next_event(&mut events).await;

        // Frames already buffered by the remote but not yet read.
        for _ in 0..8 {
            remote.write_all(&encode_frame(b"late").unwrap()).await.unwrap();
        }
        conn.disconnect();
        conn.spawn_io(io);

        assert!(matches!(next_event(&mut events).await, PeerEvent::Disconnect { .. }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events.try_recv().is_err());
    }
}
