//! Name-hashed remote procedure calls on top of [`Peer`].
//!
//! A procedure is declared once by name and argument types. Its id on the
//! wire is [`procedure_hash`] of the name, so two independently built peers
//! agree on ids without exchanging a schema. A call payload is the id as a
//! big-endian `i32` followed by each argument in declared order.
//!
//! Inbound calls are decoded strictly: an unknown id, a malformed argument,
//! a list over the configured bound or leftover bytes gets the sender
//! disconnected. Handlers only run inside [`RpcPeer::update`].

use std::{collections::HashMap, fmt, marker::PhantomData, time::Instant};

use bitflags::bitflags;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    codec::{CodecError, Datagram, DatagramReader, DatagramWriter, TypeTag},
    config::PeerConfig,
    connection::Connection,
    event::PeerHandler,
    peer::{Peer, Role},
};

/// Stable 31-bit id of a procedure name: the first four bytes of the
/// SHA-256 digest of the UTF-8 name, big-endian, shifted right by one.
pub fn procedure_hash(name: &str) -> u32 {
    let digest = Sha256::digest(name.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) >> 1
}

bitflags! {
    /// Which side of a session runs a handler.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RunsOn: u8 {
        const HOST = 1 << 0;
        const CLIENT = 1 << 1;
    }
}

impl RunsOn {
    /// Runs on both sides.
    pub const ANY: Self = Self::all();

    pub fn allows(self, hosting: bool) -> bool {
        if hosting {
            self.contains(Self::HOST)
        } else {
            self.contains(Self::CLIENT)
        }
    }
}

/// Registration-time failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("procedure {name:?} collides with {existing:?} on hash {hash:#010x}")]
    HashCollision {
        name: String,
        existing: String,
        hash: u32,
    },
    #[error("procedure {0:?} is already registered")]
    Duplicate(String),
    #[error("{0:?} is reserved; use on_connect/on_disconnect")]
    Reserved(String),
    #[error("procedure name is empty")]
    EmptyName,
    #[error("procedures cannot be registered while the peer is running")]
    Running,
}

/// Outbound call failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("no procedure named {0:?}")]
    Unknown(String),
    #[error("procedure {name:?} takes ({expected}), called with ({given})")]
    Signature {
        name: String,
        expected: String,
        given: String,
    },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Argument list of a procedure: a tuple of datagram values.
pub trait RpcArgs: Sized {
    fn arg_types() -> Vec<TypeTag>;

    fn write_args(&self, w: &mut DatagramWriter) -> Result<(), CodecError>;

    fn read_args(r: &mut DatagramReader<'_>) -> Result<Self, CodecError>;
}

macro_rules! impl_rpc_args {
    ($($name:ident),*) => {
        impl<$($name: Datagram),*> RpcArgs for ($($name,)*) {
            fn arg_types() -> Vec<TypeTag> {
                vec![$($name::type_tag()),*]
            }

            #[allow(non_snake_case, unused_variables)]
            fn write_args(&self, w: &mut DatagramWriter) -> Result<(), CodecError> {
                let ($($name,)*) = self;
                $($name.write_to(w)?;)*
                Ok(())
            }

            #[allow(unused_variables)]
            fn read_args(r: &mut DatagramReader<'_>) -> Result<Self, CodecError> {
                Ok(($($name::read_from(r)?,)*))
            }
        }
    };
}

impl_rpc_args!();
impl_rpc_args!(A);
impl_rpc_args!(A, B);
impl_rpc_args!(A, B, C);
impl_rpc_args!(A, B, C, D);
impl_rpc_args!(A, B, C, D, E);
impl_rpc_args!(A, B, C, D, E, F);

fn describe(types: &[TypeTag]) -> String {
    types
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Typed stub for one procedure. Cheap to clone; usable on its own to send
/// calls to any peer that registered the same name and argument types.
pub struct Procedure<A> {
    name: String,
    hash: u32,
    _args: PhantomData<fn(A)>,
}

impl<A> Clone for Procedure<A> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            hash: self.hash,
            _args: PhantomData,
        }
    }
}

impl<A> fmt::Debug for Procedure<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Procedure")
            .field("name", &self.name)
            .field("hash", &self.hash)
            .finish()
    }
}

impl<A: RpcArgs> Procedure<A> {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let hash = procedure_hash(&name);
        Self {
            name,
            hash,
            _args: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// Builds the call payload.
    pub fn encode(&self, args: &A) -> Result<Bytes, CodecError> {
        encode_call(self.hash, args)
    }

    /// Sends a call to `connection`.
    pub fn call(&self, connection: &Connection, args: A) -> Result<(), CodecError> {
        connection.send(&self.encode(&args)?);
        Ok(())
    }
}

fn encode_call<A: RpcArgs>(hash: u32, args: &A) -> Result<Bytes, CodecError> {
    let mut w = DatagramWriter::with_capacity(64);
    // Hashes are 31-bit, so the cast never changes the value.
    w.put_i32(hash as i32);
    args.write_args(&mut w)?;
    Ok(w.finish())
}

type Invoker = Box<dyn FnMut(&Connection, Instant, &mut DatagramReader<'_>, bool) -> Result<(), CodecError>>;
type ConnectionHook = Box<dyn FnMut(&Connection, Instant)>;
type RawDataHook = Box<dyn FnMut(&Connection, Bytes, Instant) -> Bytes>;

struct Entry {
    name: String,
    arg_types: Vec<TypeTag>,
    runs_on: RunsOn,
    invoke: Invoker,
}

/// Read-only view of a registered procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureInfo {
    pub name: String,
    pub hash: u32,
    pub arg_types: Vec<TypeTag>,
    pub runs_on: RunsOn,
}

/// Procedure table plus connection hooks; the handler side of an RpcPeer.
#[derive(Default)]
struct Registry {
    procedures: HashMap<u32, Entry>,
    by_name: HashMap<String, u32>,
    on_connect: Vec<(RunsOn, ConnectionHook)>,
    on_disconnect: Vec<(RunsOn, ConnectionHook)>,
    on_raw_data: Option<RawDataHook>,
    hosting: bool,
    max_list_length: usize,
}

impl Registry {
    fn insert(&mut self, hash: u32, entry: Entry) -> Result<(), RegistryError> {
        if self.by_name.contains_key(&entry.name) {
            return Err(RegistryError::Duplicate(entry.name));
        }
        if let Some(existing) = self.procedures.remove(&hash) {
            // Neither side of a collision stays callable.
            self.by_name.remove(&existing.name);
            return Err(RegistryError::HashCollision {
                name: entry.name,
                existing: existing.name,
                hash,
            });
        }
        self.by_name.insert(entry.name.clone(), hash);
        self.procedures.insert(hash, entry);
        Ok(())
    }

    fn dispatch_call(&mut self, connection: &Connection, payload: &[u8], at: Instant) {
        let mut reader = DatagramReader::new(payload, self.max_list_length);
        let hash = match reader.get_i32() {
            Ok(hash) => hash as u32,
            Err(e) => {
                warn!(connection = %connection.id(), error = %e, "malformed call header, disconnecting");
                connection.disconnect();
                return;
            }
        };
        let Some(entry) = self.procedures.get_mut(&hash) else {
            warn!(connection = %connection.id(), hash, "unknown procedure, disconnecting");
            connection.disconnect();
            return;
        };

        let allowed = entry.runs_on.allows(self.hosting);
        match (entry.invoke)(connection, at, &mut reader, allowed) {
            Ok(()) if !allowed => {
                debug!(connection = %connection.id(), procedure = %entry.name, "ignoring call not meant for this side");
            }
            Ok(()) => {}
            Err(e) => {
                warn!(
                    connection = %connection.id(),
                    procedure = %entry.name,
                    error = %e,
                    "malformed call, disconnecting"
                );
                connection.disconnect();
            }
        }
    }
}

fn run_hooks(hooks: &mut [(RunsOn, ConnectionHook)], hosting: bool, connection: &Connection, at: Instant) {
    // Most recently registered first.
    for (runs_on, hook) in hooks.iter_mut().rev() {
        if runs_on.allows(hosting) {
            hook(connection, at);
        }
    }
}

impl PeerHandler for Registry {
    fn on_connect(&mut self, connection: &Connection, at: Instant) {
        run_hooks(&mut self.on_connect, self.hosting, connection, at);
    }

    fn on_disconnect(&mut self, connection: &Connection, at: Instant) {
        run_hooks(&mut self.on_disconnect, self.hosting, connection, at);
    }

    fn on_raw_data(&mut self, connection: &Connection, payload: Bytes, at: Instant) -> Bytes {
        match self.on_raw_data.as_mut() {
            Some(hook) => hook(connection, payload, at),
            None => payload,
        }
    }

    fn on_data(&mut self, connection: &Connection, payload: Bytes, at: Instant) {
        // Calls queued before a local disconnect are dropped.
        if connection.is_connected() {
            self.dispatch_call(connection, &payload, at);
        }
    }
}

/// A [`Peer`] that speaks named procedure calls.
pub struct RpcPeer {
    peer: Peer,
    registry: Registry,
}

impl RpcPeer {
    pub fn new(config: PeerConfig) -> anyhow::Result<Self> {
        let registry = Registry {
            max_list_length: config.max_list_length,
            ..Default::default()
        };
        Ok(Self {
            peer: Peer::new(config)?,
            registry,
        })
    }

    /// Registers `handler` under `name`. The handler receives the calling
    /// connection, the receive time and the decoded arguments.
    pub fn register<A, H>(&mut self, name: &str, runs_on: RunsOn, mut handler: H) -> Result<Procedure<A>, RegistryError>
    where
        A: RpcArgs + 'static,
        H: FnMut(&Connection, Instant, A) + 'static,
    {
        self.check_registration()?;
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if name == "on_connect" || name == "on_disconnect" {
            return Err(RegistryError::Reserved(name.to_string()));
        }

        let procedure = Procedure::<A>::new(name);
        let invoke: Invoker = Box::new(
            move |connection: &Connection, at: Instant, reader: &mut DatagramReader<'_>, allowed: bool| {
                let args = A::read_args(reader)?;
                reader.finish()?;
                if allowed {
                    handler(connection, at, args);
                }
                Ok(())
            },
        );
        self.registry.insert(
            procedure.hash(),
            Entry {
                name: name.to_string(),
                arg_types: A::arg_types(),
                runs_on,
                invoke,
            },
        )?;
        Ok(procedure)
    }

    /// Adds a connect subscriber. Subscribers run newest first.
    pub fn on_connect(&mut self, runs_on: RunsOn, hook: impl FnMut(&Connection, Instant) + 'static) -> Result<(), RegistryError> {
        self.check_registration()?;
        self.registry.on_connect.push((runs_on, Box::new(hook)));
        Ok(())
    }

    /// Adds a disconnect subscriber. Subscribers run newest first.
    pub fn on_disconnect(&mut self, runs_on: RunsOn, hook: impl FnMut(&Connection, Instant) + 'static) -> Result<(), RegistryError> {
        self.check_registration()?;
        self.registry.on_disconnect.push((runs_on, Box::new(hook)));
        Ok(())
    }

    /// Installs a payload transform that runs before call decoding.
    pub fn on_raw_data(&mut self, hook: impl FnMut(&Connection, Bytes, Instant) -> Bytes + 'static) -> Result<(), RegistryError> {
        self.check_registration()?;
        self.registry.on_raw_data = Some(Box::new(hook));
        Ok(())
    }

    fn check_registration(&self) -> Result<(), RegistryError> {
        if self.peer.is_running() {
            return Err(RegistryError::Running);
        }
        Ok(())
    }

    /// Typed stub for a registered procedure, checked against its declared
    /// argument types.
    pub fn procedure<A: RpcArgs>(&self, name: &str) -> Result<Procedure<A>, RpcError> {
        let hash = *self
            .registry
            .by_name
            .get(name)
            .ok_or_else(|| RpcError::Unknown(name.to_string()))?;
        let expected = &self.registry.procedures[&hash].arg_types;
        let given = A::arg_types();
        if *expected != given {
            return Err(RpcError::Signature {
                name: name.to_string(),
                expected: describe(expected),
                given: describe(&given),
            });
        }
        Ok(Procedure::new(name))
    }

    /// Calls the registered procedure `name` on `connection`.
    pub fn call<A: RpcArgs>(&self, connection: &Connection, name: &str, args: A) -> Result<(), RpcError> {
        self.procedure::<A>(name)?.call(connection, args)?;
        Ok(())
    }

    /// The descriptor table, sorted by name.
    pub fn procedures(&self) -> Vec<ProcedureInfo> {
        let mut out: Vec<_> = self
            .registry
            .procedures
            .iter()
            .map(|(hash, entry)| ProcedureInfo {
                name: entry.name.clone(),
                hash: *hash,
                arg_types: entry.arg_types.clone(),
                runs_on: entry.runs_on,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn start(&mut self, host: &str, port: u16, role: Role) -> anyhow::Result<()> {
        self.peer.start(host, port, role)
    }

    pub fn stop(&mut self) {
        self.peer.stop();
    }

    /// Handles up to `max_events` queued events: connection hooks and
    /// inbound calls. Never blocks.
    pub fn update(&mut self, max_events: usize) -> usize {
        self.registry.hosting = self.peer.is_hosting();
        self.peer.update_with(max_events, &mut self.registry)
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn is_running(&self) -> bool {
        self.peer.is_running()
    }

    pub fn is_hosting(&self) -> bool {
        self.peer.is_hosting()
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.peer.connections()
    }

    pub fn connection_count(&self) -> usize {
        self.peer.connection_count()
    }

    pub fn disconnect_all(&self) {
        self.peer.disconnect_all();
    }
}
