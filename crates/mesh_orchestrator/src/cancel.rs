use std::time::Duration;
use tokio::sync::watch;

/// Cooperative cancellation shared by every long-running step of a build.
///
/// Clones observe the same flag. Loops wait on [`Cancellation::sleep`] or
/// [`Cancellation::cancelled`] inside `tokio::select!` so a cancel request
/// is noticed within one polling period.
#[derive(Clone)]
pub struct Cancellation {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellation {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any clone of self, so this only
        // errors if the flag can never change.
        let _ = rx.wait_for(|c| *c).await;
    }

    /// Sleeps for `period`, returning `false` early if cancelled.
    pub async fn sleep(&self, period: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(period) => !self.is_cancelled(),
            _ = self.cancelled() => false,
        }
    }
}
