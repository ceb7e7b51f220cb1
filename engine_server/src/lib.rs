//! `engine_server`
//!
//! Server-side systems:
//! - Fixed timestep loop driving an RPC host
//! - One entity per connected player
//! - Queued `input_state` calls, applied each tick, with a flood limit
//! - Chat relay
//! - `set_states` broadcast after every tick

pub mod server;

pub use server::GameHost;
