//! `engine_client`
//!
//! Client-side systems:
//! - RPC connection to the host
//! - Input capture and sequenced `input_state` generation
//! - Interpolation for remote entity states
//! - Chat

pub mod client;
pub mod input;
pub mod interp;

pub use client::GameClient;
