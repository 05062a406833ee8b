//! Cooperative cancellation over a `watch` channel
//!
//! A [`CancelSignal`] is handed to every loop that waits (registry polling,
//! warm-up, the echo accept loop). Sending `true` on the paired sender wakes
//! all of them. A signal whose sender was dropped without firing never fires.

use std::time::Duration;

use tokio::sync::watch;

/// Sender half used to request cancellation
pub type CancelHandle = watch::Sender<bool>;

/// Receiver half observed by cancellable loops
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Create a linked handle/signal pair
    pub fn new() -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// A signal that can never fire
    pub fn never() -> Self {
        let (_tx, signal) = Self::new();
        signal
    }

    /// Whether cancellation was already requested
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested; pends forever otherwise
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Sender gone without firing
                std::future::pending::<()>().await;
            }
        }
    }

    /// Sleep for `duration`; returns `true` if cancelled first
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}

/// Fire the handle when Ctrl+C is received
pub fn cancel_on_ctrl_c(handle: CancelHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, cancelling");
            let _ = handle.send(true);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_sleep_completes_without_cancel() {
        let (_handle, mut signal) = CancelSignal::new();
        assert!(!signal.sleep(Duration::from_millis(10)).await);
        assert!(!signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_sleep_interrupted_by_cancel() {
        let (handle, mut signal) = CancelSignal::new();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = handle.send(true);
        });

        let start = Instant::now();
        assert!(signal.sleep(Duration::from_secs(10)).await);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_already_cancelled_returns_immediately() {
        let (handle, mut signal) = CancelSignal::new();
        handle.send(true).unwrap();
        assert!(signal.sleep(Duration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn test_never_does_not_fire() {
        let mut signal = CancelSignal::never();
        assert!(!signal.sleep(Duration::from_millis(10)).await);
    }
}
