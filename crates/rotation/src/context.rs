//! Per-operation deadline and cancellation

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{RotationError, RotationResult};

/// Carried through one issue/rotate/revoke/reconcile call
///
/// Every external call goes through [`bounded`](Self::bounded). Steps before
/// the apply step go through [`cancellable`](Self::cancellable) or
/// [`checkpoint`](Self::checkpoint); once apply has started the operation runs
/// to completion so its outcome is recorded.
#[derive(Debug, Clone)]
pub struct OperationContext {
    operation: &'static str,
    call_timeout: Duration,
    cancel: CancellationToken,
}

impl OperationContext {
    pub fn new(operation: &'static str, call_timeout: Duration) -> Self {
        Self {
            operation,
            call_timeout,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Same deadline, but no longer reacting to cancellation
    ///
    /// Used once apply has started.
    #[must_use]
    pub fn without_cancellation(&self) -> Self {
        Self {
            operation: self.operation,
            call_timeout: self.call_timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run one external call under the per-call timeout
    pub async fn bounded<T, F>(&self, step: &str, call: F) -> RotationResult<T>
    where
        F: Future<Output = RotationResult<T>>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    operation = self.operation,
                    step,
                    timeout_ms = self.call_timeout.as_millis() as u64,
                    "external call timed out"
                );
                Err(RotationError::Timeout {
                    operation: format!("{} ({step})", self.operation),
                    timeout_ms: self.call_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Like [`bounded`](Self::bounded), but abandons the call on cancellation
    pub async fn cancellable<T, F>(&self, step: &str, call: F) -> RotationResult<T>
    where
        F: Future<Output = RotationResult<T>>,
    {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(self.cancelled(step)),
            result = self.bounded(step, call) => result,
        }
    }

    /// Fail with [`RotationError::Cancelled`] if cancellation was requested
    pub fn checkpoint(&self, step: &str) -> RotationResult<()> {
        if self.cancel.is_cancelled() {
            return Err(self.cancelled(step));
        }
        Ok(())
    }

    fn cancelled(&self, step: &str) -> RotationError {
        RotationError::Cancelled {
            operation: format!("{} ({step})", self.operation),
        }
    }
}
