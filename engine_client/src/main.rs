//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p engine_client -- [--addr 127.0.0.1:8080] [--name Player] [--config client.json]
//!
//! The client connects to the server, sends input every tick, and logs the
//! entity states it receives.
//!
//! Console commands:
//!   status         - Show client status
//!   say <message>  - Send chat message
//!   quit           - Exit client

use std::env;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use engine_client::client::{ClientState, GameClient};
use engine_client::input::InputSample;
use engine_shared::{config::EngineConfig, shutdown::ShutdownSignal};
use tokio::sync::mpsc;
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
            "--name" if i + 1 < args.len() => {
                cfg.player_name = args[i + 1].clone();
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

/// Handles one console line. Returns false to quit.
fn exec_console(client: &GameClient, line: &str) -> anyhow::Result<bool> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.first().copied() {
        Some("status") => {
            println!("State: {:?}", client.state());
            println!("Input sequence: {}", client.sequence());
            println!("State updates: {}", client.state_updates());
            for state in client.states() {
                println!("  #{} {} at {:?}", state.id, state.name, state.position);
            }
        }
        Some("say") => client.say(&tokens[1..].join(" "))?,
        Some("quit" | "exit") => return Ok(false),
        Some(other) => println!("Unknown command: {other}"),
        None => {}
    }
    Ok(true)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(server = %cfg.server_addr, name = %cfg.player_name, "Starting client");

    let shutdown = ShutdownSignal::install();
    let tick_interval = Duration::from_secs_f64(1.0 / f64::from(cfg.tick_hz.max(1)));
    let mut client = GameClient::new(cfg).context("create client")?;
    client.connect().context("connect")?;

    // Set up console input channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

    // Spawn stdin reader thread.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            if stdin.lock().read_line(&mut line).is_err() {
                break;
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Type 'status' for info, 'say <message>' to chat, 'quit' to exit.");
    println!();

    let mut was_connected = false;
    let mut last_report = Instant::now();
    'game: while !shutdown.is_triggered() {
        while let Ok(line) = console_rx.try_recv() {
            match exec_console(&client, &line) {
                Ok(true) => {}
                Ok(false) => break 'game,
                Err(e) => println!("Error: {e}"),
            }
        }

        // Fake input for now - in a real client this would come from keyboard/mouse.
        if let Err(e) = client.tick(InputSample::default()) {
            println!("Tick error: {e}");
        }

        match client.state() {
            ClientState::Connected => was_connected = true,
            ClientState::Disconnected => {
                if was_connected {
                    println!("Disconnected from server.");
                } else {
                    println!("Could not connect to server.");
                }
                break;
            }
            ClientState::Connecting => {}
        }

        if last_report.elapsed() >= Duration::from_secs(5) {
            info!(entities = client.states().len(), updates = client.state_updates(), "States");
            last_report = Instant::now();
        }

        std::thread::sleep(tick_interval);
    }

    client.stop();
    Ok(())
}
