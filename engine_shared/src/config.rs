//! Configuration system.
//!
//! Loads peer and engine configuration from JSON strings/files. Every field
//! has a default so partial documents are accepted.

use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Socket address family used when resolving `start` hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    #[default]
    Ipv4,
    Ipv6,
}

/// Optional TLS material.
///
/// Hosts need `cert_chain` and `private_key`. Clients verify against
/// `ca_bundle` when given, otherwise against the bundled web PKI roots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    pub cert_chain: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    pub ca_bundle: Option<PathBuf>,
    /// Name the client expects in the host certificate. Defaults to the
    /// host passed to `start`.
    pub server_name: Option<String>,
}

/// Per-peer networking options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Disconnect connections that stay silent this long.
    pub idle_timeout_ms: Option<u64>,
    /// Listen backlog in host mode.
    pub backlog: u32,
    /// Upper bound on the element count of any received list.
    pub max_list_length: usize,
    /// Default cap on events handled by one `update` call.
    pub max_events_per_update: usize,
    pub address_family: AddressFamily,
    /// Worker threads of the I/O runtime.
    pub io_threads: usize,
    pub tls: Option<TlsConfig>,
    /// Accepted TLS connections that do not finish the handshake in this
    /// long are dropped. Also bounds the client handshake.
    pub handshake_timeout_ms: u64,
}

pub const DEFAULT_BACKLOG: u32 = 100;
pub const DEFAULT_MAX_LIST_LENGTH: usize = 1024;
pub const DEFAULT_MAX_EVENTS_PER_UPDATE: usize = 100;
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: None,
            backlog: DEFAULT_BACKLOG,
            max_list_length: DEFAULT_MAX_LIST_LENGTH,
            max_events_per_update: DEFAULT_MAX_EVENTS_PER_UPDATE,
            address_family: AddressFamily::Ipv4,
            io_threads: 2,
            tls: None,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
        }
    }
}

impl PeerConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_max_list_length(mut self, max: usize) -> Self {
        self.max_list_length = max;
        self
    }

    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

/// Root configuration shared by client/server binaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Server address, e.g. `127.0.0.1:8080`.
    pub server_addr: String,
    /// Fixed game loop rate.
    pub tick_hz: u32,
    /// Player name (client only).
    pub player_name: String,
    pub net: PeerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:8080".to_string(),
            tick_hz: 60,
            player_name: "Player".to_string(),
            net: PeerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    pub fn from_json_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    /// Splits `server_addr` into host and port.
    pub fn host_port(&self) -> anyhow::Result<(String, u16)> {
        let (host, port) = self
            .server_addr
            .rsplit_once(':')
            .with_context(|| format!("server_addr {:?} has no port", self.server_addr))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = port
            .parse()
            .with_context(|| format!("parse port of {:?}", self.server_addr))?;
        Ok((host.to_string(), port))
    }
}
