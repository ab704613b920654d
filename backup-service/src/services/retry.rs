//! Bounded retry with a fixed delay between attempts.

use crate::utils::errors::Result;
use futures_util::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Operation = dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync;

/// Runs one retry chain at a time. Starting a new chain replaces any
/// pending retry of the previous one.
///
/// Cancelling only stops a chain while it sleeps between attempts. An
/// attempt that has already started always runs to completion, so it can
/// release whatever it acquired.
pub struct RetryService {
    label: String,
    chain: Mutex<Option<CancellationToken>>,
}

impl RetryService {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            chain: Mutex::new(None),
        })
    }

    /// Run `f` now. On failure, schedule up to `max_retries` further attempts
    /// `delay` apart without blocking the caller. Returns the first attempt's result.
    pub async fn retry<F, Fut>(self: &Arc<Self>, f: F, delay: Duration, max_retries: u32) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let token = self.replace_chain();
        let op: Arc<Operation> = Arc::new(move || f().boxed());
        self.attempt(op, token, delay, max_retries).await
    }

    fn attempt(
        self: &Arc<Self>,
        op: Arc<Operation>,
        token: CancellationToken,
        delay: Duration,
        retries_left: u32,
    ) -> BoxFuture<'static, Result<()>> {
        let this = self.clone();
        async move {
            let e = match op().await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if retries_left == 0 {
                warn!(label = %this.label, error = %e, "Giving up after final attempt");
                return Err(e);
            }
            if token.is_cancelled() {
                debug!(label = %this.label, "Retry chain cancelled");
                return Err(e);
            }

            info!(
                label = %this.label,
                error = %e,
                retries_left,
                delay_ms = delay.as_millis() as u64,
                "Attempt failed, retrying"
            );
            let next = this.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => {
                        debug!(label = %next.label, "Pending retry cancelled");
                        return;
                    }
                }
                let _ = next.attempt(op, token, delay, retries_left - 1).await;
            });
            Err(e)
        }
        .boxed()
    }

    /// Cancel the current chain and install a fresh token for a new one.
    fn replace_chain(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let mut chain = self.chain.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = chain.replace(token.clone()) {
            previous.cancel();
        }
        token
    }

    /// Stop any scheduled retry. A running attempt is left to finish.
    pub fn cancel(&self) {
        let mut chain = self.chain.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = chain.take() {
            token.cancel();
        }
    }
}

impl Drop for RetryService {
    fn drop(&mut self) {
        self.cancel();
    }
}
