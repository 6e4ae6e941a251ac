//! Caller-side cancellation of waits.
//!
//! A [`Cancellation`] aborts the *wait* for a dispatched operation or a
//! rehydration. Work an owner has already accepted keeps running.

use tokio::sync::watch;

/// Triggers the [`Cancellation`] tokens it hands out.
#[derive(Debug)]
pub struct CancellationSource {
    tx: watch::Sender<bool>,
}

impl CancellationSource {
    /// Create a source that is not cancelled yet.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Returns a token observing this source.
    pub fn token(&self) -> Cancellation {
        Cancellation {
            rx: Some(self.tx.subscribe()),
        }
    }

    /// Cancel every token handed out by this source.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Returns `true` once [`cancel`](CancellationSource::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellation signal passed along with a wait.
///
/// Dropping the [`CancellationSource`] without cancelling leaves the
/// token uncancelled forever.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    rx: Option<watch::Receiver<bool>>,
}

impl Cancellation {
    /// A token that is never cancelled.
    pub fn none() -> Self {
        Self { rx: None }
    }

    /// Returns `true` if the source has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Completes once the source is cancelled; pends forever otherwise.
    pub async fn cancelled(&self) {
        let Some(rx) = &self.rx else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}
