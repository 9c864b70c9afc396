/// Signal handling for cancellation.
///
/// SIGINT (Ctrl-C) and SIGTERM set a shared flag. The scanner checks it at
/// the same point it checks the budget, so a cancelled run still goes
/// through the normal termination path.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};

#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Create a flag that SIGINT or SIGTERM will set.
    pub fn install() -> std::io::Result<Self> {
        let flag = Self::new();
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let handle = flag.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => tracing::warn!("SIGINT received, cancelling scan"),
                _ = sigterm.recv() => tracing::warn!("SIGTERM received, cancelling scan"),
            }
            handle.cancel();
        });
        Ok(flag)
    }
}
