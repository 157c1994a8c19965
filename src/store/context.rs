//! Per-call transaction context
//!
//! Carries what a caller wants to attach to one `exec_tx` call: a label for
//! log correlation, an optional timeout and an optional cancellation signal.
//! Nothing here is global; the context is passed explicitly.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::Span;

use super::error::TxError;

/// Sender side of a cancellation signal
///
/// Cancelling is sticky: every context created from this handle, before or
/// after the call, observes the cancellation.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    /// Request cancellation of every transaction watching this handle
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Context for a single transaction
#[derive(Debug, Clone, Default)]
pub struct TxContext {
    label: Option<String>,
    timeout: Option<Duration>,
    cancel: Option<watch::Receiver<bool>>,
}

impl TxContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name recorded on the transaction's tracing span
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Upper bound for begin plus the unit of work; commit is not bounded
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, handle: &CancelHandle) -> Self {
        self.cancel = Some(handle.subscribe());
        self
    }

    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or("tx")
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Span every log line of the transaction is recorded under
    pub(crate) fn span(&self) -> Span {
        tracing::debug_span!("tx", tx = %self.label())
    }

    /// Instant the timeout runs out, counted from now
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|d| Instant::now() + d)
    }

    /// Drive `work` until it finishes, `deadline` passes or the context is
    /// cancelled, whichever comes first. On timeout or cancellation `work` is
    /// dropped before returning.
    pub(crate) async fn guard<T, F>(&self, deadline: Option<Instant>, work: F) -> Result<T, TxError>
    where
        F: Future<Output = Result<T, TxError>>,
    {
        let expired = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        let cancelled = async {
            match self.cancel.clone() {
                Some(mut rx) => {
                    // Sender gone without cancelling means it never will
                    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            result = work => result,
            _ = expired => Err(TxError::TimedOut(self.timeout.unwrap_or_default())),
            _ = cancelled => Err(TxError::Cancelled),
        }
    }
}
