//! Operator interrupt (Ctrl+C) as a shared flag.
//!
//! The control loop polls the flag between session checks; nothing else
//! happens in signal context.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Listen for Ctrl+C on a background thread and raise `flag` on each one.
pub fn install_ctrl_c(flag: InterruptFlag) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;
    thread::Builder::new()
        .name("planloop-signal".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                loop {
                    if let Err(err) = tokio::signal::ctrl_c().await {
                        warn!(err = %err, "ctrl-c listener failed");
                        return;
                    }
                    if flag.is_raised() {
                        warn!("interrupt already in progress, waiting for safe abort");
                    } else {
                        info!("interrupt received, aborting current task");
                    }
                    flag.raise();
                }
            });
        })
        .context("spawn signal thread")?;
    debug!("ctrl-c handler installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let flag = InterruptFlag::new();
        let other = flag.clone();
        assert!(!other.is_raised());
        flag.raise();
        assert!(other.is_raised());
    }
}
