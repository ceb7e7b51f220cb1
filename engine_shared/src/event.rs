//! Peer events and their dispatch.
//!
//! I/O tasks only ever produce [`PeerEvent`]s; the application consumes
//! them on its own thread through `Peer::update`, so every callback runs
//! single-threaded from the caller's point of view.

use std::time::Instant;

use bytes::Bytes;

use crate::connection::Connection;

/// Something that happened on a connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Connect {
        connection: Connection,
        at: Instant,
    },
    Disconnect {
        connection: Connection,
        at: Instant,
    },
    Data {
        connection: Connection,
        payload: Bytes,
        at: Instant,
    },
}

impl PeerEvent {
    pub fn connection(&self) -> &Connection {
        match self {
            PeerEvent::Connect { connection, .. }
            | PeerEvent::Disconnect { connection, .. }
            | PeerEvent::Data { connection, .. } => connection,
        }
    }

    pub fn at(&self) -> Instant {
        match self {
            PeerEvent::Connect { at, .. }
            | PeerEvent::Disconnect { at, .. }
            | PeerEvent::Data { at, .. } => *at,
        }
    }
}

/// Receives dispatched peer events. Every method defaults to a no-op.
pub trait PeerHandler {
    fn on_connect(&mut self, _connection: &Connection, _at: Instant) {}

    fn on_disconnect(&mut self, _connection: &Connection, _at: Instant) {}

    /// Sees every payload before `on_data` and may replace it.
    fn on_raw_data(&mut self, _connection: &Connection, payload: Bytes, _at: Instant) -> Bytes {
        payload
    }

    fn on_data(&mut self, _connection: &Connection, _payload: Bytes, _at: Instant) {}
}

/// Routes one event to the matching handler method.
pub fn dispatch<H: PeerHandler + ?Sized>(handler: &mut H, event: PeerEvent) {
    match event {
        PeerEvent::Connect { connection, at } => handler.on_connect(&connection, at),
        PeerEvent::Disconnect { connection, at } => handler.on_disconnect(&connection, at),
        PeerEvent::Data {
            connection,
            payload,
            at,
        } => {
            let payload = handler.on_raw_data(&connection, payload, at);
            handler.on_data(&connection, payload, at);
        }
    }
}

type ConnectionFn = Box<dyn FnMut(&Connection, Instant)>;
type RawDataFn = Box<dyn FnMut(&Connection, Bytes, Instant) -> Bytes>;
type DataFn = Box<dyn FnMut(&Connection, Bytes, Instant)>;

/// Closure-based handler; each slot holds at most one callback.
#[derive(Default)]
pub struct PeerCallbacks {
    pub(crate) on_connect: Option<ConnectionFn>,
    pub(crate) on_disconnect: Option<ConnectionFn>,
    pub(crate) on_raw_data: Option<RawDataFn>,
    pub(crate) on_data: Option<DataFn>,
}

impl PeerCallbacks {
    pub fn set_on_connect(&mut self, f: impl FnMut(&Connection, Instant) + 'static) {
        self.on_connect = Some(Box::new(f));
    }

    pub fn set_on_disconnect(&mut self, f: impl FnMut(&Connection, Instant) + 'static) {
        self.on_disconnect = Some(Box::new(f));
    }

    pub fn set_on_raw_data(&mut self, f: impl FnMut(&Connection, Bytes, Instant) -> Bytes + 'static) {
        self.on_raw_data = Some(Box::new(f));
    }

    pub fn set_on_data(&mut self, f: impl FnMut(&Connection, Bytes, Instant) + 'static) {
        self.on_data = Some(Box::new(f));
    }
}

impl PeerHandler for PeerCallbacks {
    fn on_connect(&mut self, connection: &Connection, at: Instant) {
        if let Some(f) = self.on_connect.as_mut() {
            f(connection, at);
        }
    }

    fn on_disconnect(&mut self, connection: &Connection, at: Instant) {
        if let Some(f) = self.on_disconnect.as_mut() {
            f(connection, at);
        }
    }

    fn on_raw_data(&mut self, connection: &Connection, payload: Bytes, at: Instant) -> Bytes {
        match self.on_raw_data.as_mut() {
            Some(f) => f(connection, payload, at),
            None => payload,
        }
    }

    fn on_data(&mut self, connection: &Connection, payload: Bytes, at: Instant) {
        if let Some(f) = self.on_data.as_mut() {
            f(connection, payload, at);
        }
    }
}
