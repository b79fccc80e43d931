//! Poll-with-timeout carrying a cancellation signal.
//!
//! Every gateway call made by the orchestrator goes through
//! [`bounded_call`], so no call can wait forever and a shutdown interrupts
//! whatever is outstanding.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use crate::gateway::{GatewayError, GatewayFuture};

/// How a bounded wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready(T),
    TimedOut,
    Cancelled,
}

/// Drive `fut` until it finishes, `timeout` elapses, or `cancel` flips to
/// `true`.
pub async fn poll_with_timeout<F>(
    fut: F,
    timeout: Duration,
    cancel: &mut watch::Receiver<bool>,
) -> PollOutcome<F::Output>
where
    F: Future,
{
    if *cancel.borrow() {
        return PollOutcome::Cancelled;
    }
    tokio::select! {
        out = tokio::time::timeout(timeout, fut) => match out {
            Ok(value) => PollOutcome::Ready(value),
            Err(_) => PollOutcome::TimedOut,
        },
        _ = cancelled(cancel) => PollOutcome::Cancelled,
    }
}

/// Resolves once the signal reads `true`. Never resolves if the sender is
/// dropped without signalling.
pub async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// A gateway call bounded by `timeout` and `cancel`, flattened into one
/// `Result`.
pub async fn bounded_call<T>(
    fut: GatewayFuture<'_, T>,
    timeout: Duration,
    cancel: &mut watch::Receiver<bool>,
) -> Result<T, GatewayError> {
    match poll_with_timeout(fut, timeout, cancel).await {
        PollOutcome::Ready(result) => result,
        PollOutcome::TimedOut => {
            debug!(?timeout, "gateway call timed out");
            Err(GatewayError::Timeout(timeout))
        }
        PollOutcome::Cancelled => Err(GatewayError::Cancelled),
    }
}
