//! `engine_shared`
//!
//! Networking shared by client and server:
//! - `codec`: binary datagram encoding of primitive and structured values.
//! - `frame`: `u16` length-prefixed framing and its decode state machine.
//! - `connection` / `peer`: framed TCP (optionally TLS) sessions whose I/O
//!   runs on background tasks and whose events are handled on the caller's
//!   thread in `update`.
//! - `rpc`: name-hashed procedure calls with typed arguments.
//!
//! Design goals:
//! - Bit-exact wire format; two builds agree without exchanging a schema.
//! - Hostile input costs the sender its connection, never the process.
//! - No `unsafe`.

pub mod codec;
pub mod config;
pub mod connection;
pub mod event;
pub mod frame;
pub mod math;
pub mod peer;
pub mod protocol;
pub mod rpc;
pub mod shutdown;
pub mod tls;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::codec::{Datagram, DatagramReader, DatagramWriter, TypeTag};
    pub use crate::config::*;
    pub use crate::connection::{Connection, ConnectionId};
    pub use crate::event::{PeerEvent, PeerHandler};
    pub use crate::math::*;
    pub use crate::peer::{Peer, Role};
    pub use crate::rpc::{procedure_hash, Procedure, RpcPeer, RunsOn};
    pub use crate::shutdown::ShutdownSignal;
}
