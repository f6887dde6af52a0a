// ============================================================
// Layer 6 — Stop Signal
// ============================================================
// A shared flag the trainer polls between steps. Ctrl-C flips
// it; the current step finishes, a checkpoint of that step is
// written, and the run ends as Stopped.
//
// The Ctrl-C listener runs on its own thread with a small
// current-thread tokio runtime, so the rest of the program
// stays synchronous.

use anyhow::{Context, Result};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Trip this signal on the first Ctrl-C.
    pub fn install_ctrl_c(&self) -> Result<()> {
        let signal = self.clone();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to build signal runtime")?;

        std::thread::Builder::new()
            .name("ctrl-c".to_string())
            .spawn(move || {
                runtime.block_on(async {
                    match tokio::signal::ctrl_c().await {
                        Ok(()) => {
                            tracing::warn!("Ctrl-C received, stopping after the current step");
                            signal.stop();
                        }
                        Err(e) => tracing::error!("Cannot listen for Ctrl-C: {e}"),
                    }
                });
            })
            .context("Failed to spawn Ctrl-C listener")?;
        Ok(())
    }
}
