//! Helpers shared by the integration tests.
//!
//! Peers are synchronous, so tests are plain `#[test]` functions that poll
//! `update()` until a condition holds or a deadline passes.

use std::time::{Duration, Instant};

use engine_shared::peer::{Peer, Role};

/// How long any single wait may take before the test fails.
pub const DEADLINE: Duration = Duration::from_secs(5);

/// Installs a test-friendly subscriber once. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Calls `poll` every few milliseconds until it returns true.
pub fn wait_until(what: &str, mut poll: impl FnMut() -> bool) -> anyhow::Result<()> {
    let deadline = Instant::now() + DEADLINE;
    while !poll() {
        anyhow::ensure!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
    Ok(())
}

/// Keeps calling `poll` for `window` and fails if it ever returns true.
pub fn never_within(what: &str, window: Duration, mut poll: impl FnMut() -> bool) -> anyhow::Result<()> {
    let end = Instant::now() + window;
    while Instant::now() < end {
        anyhow::ensure!(!poll(), "unexpected {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
    Ok(())
}

/// Starts `host` on an ephemeral loopback port and returns the port.
pub fn host_ephemeral(host: &mut Peer) -> anyhow::Result<u16> {
    host.start("127.0.0.1", 0, Role::Host)?;
    let addr = host
        .local_addr()
        .ok_or_else(|| anyhow::anyhow!("host has no local address"))?;
    Ok(addr.port())
}
