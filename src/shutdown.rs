//! Ctrl+C handling for the watch loop
//!
//! The first Ctrl+C asks the loop to stop after the current tick. A second
//! one exits immediately.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::Result;

/// Exit status used when a second Ctrl+C aborts the process
const ABORT_EXIT_CODE: i32 = 130;

pub struct ShutdownSignal {
    shutdown_flag: Arc<AtomicBool>,
    interrupt_count: Arc<AtomicUsize>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            interrupt_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Install the process-wide Ctrl+C handler
    pub fn install(&self) -> Result<()> {
        let shutdown_flag = self.shutdown_flag.clone();
        let interrupt_count = self.interrupt_count.clone();

        ctrlc::set_handler(move || {
            if interrupt_count.fetch_add(1, Ordering::SeqCst) == 0 {
                info!("Interrupt received, stopping after the current tick (Ctrl+C again to abort)");
                shutdown_flag.store(true, Ordering::SeqCst);
            } else {
                warn!("Second interrupt, aborting");
                std::process::exit(ABORT_EXIT_CODE);
            }
        })
        .map_err(|e| crate::Error::Config(format!("Failed to set signal handler: {}", e)))?;

        Ok(())
    }

    pub fn flag(&self) -> Arc<AtomicBool> {
        self.shutdown_flag.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_is_shared() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutdown());

        signal.flag().store(true, Ordering::SeqCst);
        assert!(signal.is_shutdown());
    }
}
