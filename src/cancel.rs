use std::time::Duration;

use tokio::sync::watch;

use crate::error::{Result, ReviewError};

/// Cooperative cancellation handle passed through every suspendable call.
/// Cloning is cheap; all clones observe the same signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

pub fn cancel_pair() -> (CancelSource, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelSource { tx }, CancelToken { rx })
}

impl CancelSource {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    /// Token that never fires, for contexts without an interrupt source.
    pub fn inert() -> Self {
        cancel_pair().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when the signal fires. Never resolves on an inert token.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        // Sender dropped without firing means cancellation can no longer
        // happen; park forever rather than spuriously resolving.
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        std::future::pending::<()>().await;
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ReviewError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep that aborts early with `Cancelled` when the token fires.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancelled() => Err(ReviewError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
