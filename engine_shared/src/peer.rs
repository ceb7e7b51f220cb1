//! Peer: session owner, either hosting or connecting.
//!
//! Lifecycle: `idle -> running -> idle`. `start` on a running peer stops it
//! first. The peer owns a tokio runtime for its I/O; the application drives
//! it from its own (non-async) thread:
//!
//! ```ignore
//! let mut peer = Peer::new(PeerConfig::default())?;
//! peer.set_on_data(|conn, payload, _at| conn.send(&payload));
//! peer.start("127.0.0.1", 8080, Role::Host)?;
//! loop {
//!     peer.update(100);
//!     // ... rest of the frame ...
//! }
//! ```
//!
//! Callbacks only ever run inside `update`, in queue order.

use std::{
    collections::BTreeMap,
    net::{SocketAddr, ToSocketAddrs},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::Context;
use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpSocket, TcpStream},
    runtime::Runtime,
    sync::mpsc,
    task::{JoinHandle, JoinSet},
};
use tokio_rustls::{rustls::pki_types::ServerName, TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

use crate::{
    config::{AddressFamily, PeerConfig},
    connection::{Connection, ConnectionId},
    event::{dispatch, PeerCallbacks, PeerEvent, PeerHandler},
    tls,
};

/// Which side of a session a peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Client,
}

/// Live-connection set; only touched under [`PeerShared::live`].
#[derive(Default)]
struct LiveSet {
    running: bool,
    connections: BTreeMap<ConnectionId, Connection>,
}

/// State shared between the peer and its I/O tasks.
pub(crate) struct PeerShared {
    live: Mutex<LiveSet>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerShared {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Self {
            live: Mutex::new(LiveSet {
                running: true,
                connections: BTreeMap::new(),
            }),
            events,
        });
        (shared, rx)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LiveSet> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn push(&self, event: PeerEvent) {
        // Receiver gone means the peer was dropped; nothing left to notify.
        let _ = self.events.send(event);
    }

    /// Queues an event for a connection still in the live set. Holding the
    /// lock orders it before any `Disconnect` queued by [`Self::remove`].
    pub(crate) fn push_if_live(&self, event: PeerEvent) {
        let live = self.lock();
        if live.connections.contains_key(&event.connection().id()) {
            self.push(event);
        }
    }

    /// Adds a new connection and queues its `Connect` event. Refused once
    /// the peer stopped running.
    pub(crate) fn register(&self, connection: &Connection) -> bool {
        let mut live = self.lock();
        if !live.running {
            return false;
        }
        live.connections.insert(connection.id(), connection.clone());
        self.push(PeerEvent::Connect {
            connection: connection.clone(),
            at: Instant::now(),
        });
        true
    }

    /// Drops a connection from the live set, queueing `Disconnect` only if
    /// it was present.
    pub(crate) fn remove(&self, connection: &Connection) {
        let mut live = self.lock();
        if live.connections.remove(&connection.id()).is_some() {
            self.push(PeerEvent::Disconnect {
                connection: connection.clone(),
                at: Instant::now(),
            });
        }
    }

    fn set_running(&self, running: bool) {
        self.lock().running = running;
    }

    fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Clears the running flag and returns the connections to close.
    fn begin_shutdown(&self) -> (bool, Vec<Connection>) {
        let mut live = self.lock();
        let was_running = std::mem::replace(&mut live.running, false);
        (was_running, live.connections.values().cloned().collect())
    }

    fn connections(&self) -> Vec<Connection> {
        self.lock().connections.values().cloned().collect()
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }
}

/// Network session endpoint.
pub struct Peer {
    config: PeerConfig,
    runtime: Option<Runtime>,
    shared: Arc<PeerShared>,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    callbacks: PeerCallbacks,
    worker: Option<JoinHandle<()>>,
    role: Option<Role>,
    local_addr: Option<SocketAddr>,
}

impl Peer {
    /// Creates an idle peer and its I/O runtime.
    pub fn new(config: PeerConfig) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.io_threads.max(1))
            .thread_name("peer-io")
            .enable_all()
            .build()
            .context("build peer runtime")?;
        let (shared, events) = PeerShared::new();
        shared.set_running(false);
        Ok(Self {
            config,
            runtime: Some(runtime),
            shared,
            events,
            callbacks: PeerCallbacks::default(),
            worker: None,
            role: None,
            local_addr: None,
        })
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn set_on_connect(&mut self, f: impl FnMut(&Connection, Instant) + 'static) {
        self.callbacks.set_on_connect(f);
    }

    pub fn set_on_disconnect(&mut self, f: impl FnMut(&Connection, Instant) + 'static) {
        self.callbacks.set_on_disconnect(f);
    }

    pub fn set_on_raw_data(&mut self, f: impl FnMut(&Connection, Bytes, Instant) -> Bytes + 'static) {
        self.callbacks.set_on_raw_data(f);
    }

    pub fn set_on_data(&mut self, f: impl FnMut(&Connection, Bytes, Instant) + 'static) {
        self.callbacks.set_on_data(f);
    }

    /// Starts hosting on, or connecting to, `host:port`.
    ///
    /// Hosting binds synchronously, so address and TLS errors surface here.
    /// Connecting happens in the background; if it fails the peer logs a
    /// warning and stops running.
    pub fn start(&mut self, host: &str, port: u16, role: Role) -> anyhow::Result<()> {
        if self.is_running() {
            self.stop();
        }
        let runtime = self.runtime.as_ref().context("peer runtime already shut down")?;
        let _enter = runtime.enter();

        let addr = resolve(host, port, self.config.address_family)?;
        let idle = self.config.idle_timeout();
        let handshake = self.config.handshake_timeout();

        match role {
            Role::Host => {
                let acceptor = match &self.config.tls {
                    Some(cfg) => Some(tls::server_acceptor(cfg)?),
                    None => None,
                };
                let listener = bind_listener(addr, self.config.backlog)?;
                let local = listener.local_addr().context("listener local_addr")?;
                info!(addr = %local, tls = acceptor.is_some(), "hosting");

                self.shared.set_running(true);
                self.local_addr = Some(local);
                self.worker = Some(tokio::spawn(accept_loop(
                    listener,
                    acceptor,
                    Arc::clone(&self.shared),
                    idle,
                    handshake,
                )));
            }
            Role::Client => {
                let connector = match &self.config.tls {
                    Some(cfg) => Some((tls::client_connector(cfg)?, tls::server_name(cfg, host)?)),
                    None => None,
                };
                info!(server = %addr, tls = connector.is_some(), "connecting");

                self.shared.set_running(true);
                self.local_addr = None;
                self.worker = Some(tokio::spawn(connect_once(
                    addr,
                    connector,
                    Arc::clone(&self.shared),
                    idle,
                    handshake,
                )));
            }
        }
        self.role = Some(role);
        Ok(())
    }

    /// Disconnects everything, closes the listener, joins the accept/connect
    /// task (cancelling pending TLS handshakes) and drops queued events.
    /// Connection tasks are not joined; they exit on their own once their
    /// connection is closed.
    pub fn stop(&mut self) {
        let (was_running, connections) = self.shared.begin_shutdown();
        for connection in connections {
            connection.disconnect();
        }
        if let Some(worker) = self.worker.take() {
            worker.abort();
            if let Some(runtime) = &self.runtime {
                let _ = runtime.block_on(worker);
            }
        }
        while self.events.try_recv().is_ok() {}
        self.local_addr = None;
        if was_running {
            info!("peer stopped");
        }
    }

    /// Handles up to `max_events` queued events with the registered
    /// callbacks. Never blocks. Returns the number handled.
    pub fn update(&mut self, max_events: usize) -> usize {
        let Self {
            events, callbacks, ..
        } = self;
        drain(events, max_events, callbacks)
    }

    /// Like [`Peer::update`] with an explicit handler in place of the
    /// registered callbacks.
    pub fn update_with<H: PeerHandler + ?Sized>(&mut self, max_events: usize, handler: &mut H) -> usize {
        drain(&mut self.events, max_events, handler)
    }

    /// Pops up to `max_events` raw events without dispatching them.
    pub fn poll_events(&mut self, max_events: usize) -> Vec<PeerEvent> {
        let mut out = Vec::new();
        while out.len() < max_events {
            match self.events.try_recv() {
                Ok(event) => out.push(event),
                Err(_) => break,
            }
        }
        out
    }

    pub fn send(&self, connection: &Connection, data: &[u8]) {
        connection.send(data);
    }

    pub fn disconnect(&self, connection: &Connection) {
        connection.disconnect();
    }

    pub fn disconnect_all(&self) {
        for connection in self.shared.connections() {
            connection.disconnect();
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn is_hosting(&self) -> bool {
        self.role == Some(Role::Host) && self.is_running()
    }

    /// Role of the last `start`, if any.
    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.shared.connections()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connection_count()
    }

    /// Bound listen address while hosting.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.stop();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

fn drain<H: PeerHandler + ?Sized>(
    events: &mut mpsc::UnboundedReceiver<PeerEvent>,
    max_events: usize,
    handler: &mut H,
) -> usize {
    let mut handled = 0;
    while handled < max_events {
        match events.try_recv() {
            Ok(event) => {
                dispatch(handler, event);
                handled += 1;
            }
            Err(_) => break,
        }
    }
    handled
}

fn resolve(host: &str, port: u16, family: AddressFamily) -> anyhow::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolve {host}:{port}"))?
        .find(|addr| match family {
            AddressFamily::Ipv4 => addr.is_ipv4(),
            AddressFamily::Ipv6 => addr.is_ipv6(),
        })
        .with_context(|| format!("no {family:?} address for {host}:{port}"))
}

fn bind_listener(addr: SocketAddr, backlog: u32) -> anyhow::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .context("create listen socket")?;
    socket.set_reuseaddr(true).context("set SO_REUSEADDR")?;
    socket.bind(addr).with_context(|| format!("bind {addr}"))?;
    socket.listen(backlog).with_context(|| format!("listen on {addr}"))
}

/// Registers a fresh connection and starts its I/O.
fn attach<S>(stream: S, remote: SocketAddr, shared: &Arc<PeerShared>, idle: Option<Duration>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (connection, io) = Connection::open(stream, remote, idle, shared);
    if !shared.register(&connection) {
        debug!(addr = %remote, "peer stopped before the connection was registered");
        connection.disconnect();
        return;
    }
    info!(connection = %connection.id(), addr = %remote, "connection established");
    connection.spawn_io(io);
}

/// Accepts until aborted. TLS handshakes run in a set owned by this task,
/// so aborting it also drops every half-open connection.
async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    shared: Arc<PeerShared>,
    idle: Option<Duration>,
    handshake: Duration,
) {
    let mut handshakes = JoinSet::new();
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            Some(_) = handshakes.join_next() => continue,
        };
        let (stream, remote) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };
        let _ = stream.set_nodelay(true);

        match &acceptor {
            None => attach(stream, remote, &shared, idle),
            Some(acceptor) => {
                let accept = acceptor.accept(stream);
                let shared = Arc::clone(&shared);
                handshakes.spawn(async move {
                    match tokio::time::timeout(handshake, accept).await {
                        Ok(Ok(tls_stream)) => attach(tls_stream, remote, &shared, idle),
                        Ok(Err(e)) => debug!(addr = %remote, error = %e, "tls handshake failed"),
                        Err(_) => debug!(addr = %remote, "tls handshake timed out"),
                    }
                });
            }
        }
    }
}

async fn connect_once(
    addr: SocketAddr,
    connector: Option<(TlsConnector, ServerName<'static>)>,
    shared: Arc<PeerShared>,
    idle: Option<Duration>,
    handshake: Duration,
) {
    let stream = match TcpStream::connect(addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(server = %addr, error = %e, "connect failed");
            shared.set_running(false);
            return;
        }
    };
    let _ = stream.set_nodelay(true);

    match connector {
        None => attach(stream, addr, &shared, idle),
        Some((connector, name)) => {
            match tokio::time::timeout(handshake, connector.connect(name, stream)).await {
                Ok(Ok(tls_stream)) => attach(tls_stream, addr, &shared, idle),
                Ok(Err(e)) => {
                    warn!(server = %addr, error = %e, "tls handshake failed");
                    shared.set_running(false);
                }
                Err(_) => {
                    warn!(server = %addr, "tls handshake timed out");
                    shared.set_running(false);
                }
            }
        }
    }
}
