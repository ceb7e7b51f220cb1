//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p engine_server -- [--addr 127.0.0.1:8080] [--tick-hz 60] [--config host.json]
//!
//! The server listens for client connections, runs a fixed timestep loop,
//! and broadcasts entity states to connected clients. Ctrl-C stops it.

use std::env;
use std::path::PathBuf;

use anyhow::Context;
use engine_server::GameHost;
use engine_shared::{config::EngineConfig, shutdown::ShutdownSignal};
use tracing::info;

fn parse_args() -> anyhow::Result<EngineConfig> {
    let args: Vec<String> = env::args().collect();

    // The config file, if any, is the base the other flags override.
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => EngineConfig::from_json_file(&PathBuf::from(&args[i + 1]))?,
        _ => EngineConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().context("parse --tick-hz")?;
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(addr = %cfg.server_addr, tick_hz = cfg.tick_hz, "Starting server");

    let shutdown = ShutdownSignal::install();
    let mut host = GameHost::new(cfg).context("create server")?;
    host.start().context("start server")?;
    host.run(&shutdown);
    Ok(())
}
