//! Process-wide shutdown signal.
//!
//! Ctrl-C is hooked once per process. The hook only raises a flag; the
//! application loop polls it and stops its peers on its own thread.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, OnceLock,
};

use tracing::{info, warn};

static INSTALLED: OnceLock<ShutdownSignal> = OnceLock::new();

/// Shared "please shut down" flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// A flag not tied to any OS signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-wide signal, hooking Ctrl-C on first use.
    pub fn install() -> Self {
        INSTALLED
            .get_or_init(|| {
                let signal = Self::new();
                watch_ctrl_c(signal.clone());
                signal
            })
            .clone()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

fn watch_ctrl_c(signal: ShutdownSignal) {
    let spawned = std::thread::Builder::new()
        .name("ctrl-c".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    warn!(error = %e, "cannot watch for ctrl-c");
                    return;
                }
            };
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("interrupt received, shutting down");
                        signal.trigger();
                    }
                    Err(e) => warn!(error = %e, "cannot watch for ctrl-c"),
                }
            });
        });
    if let Err(e) = spawned {
        warn!(error = %e, "cannot spawn ctrl-c watcher");
    }
}
