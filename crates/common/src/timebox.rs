//! Hard wall-clock deadlines for asynchronous operations
//!
//! The operation runs as its own task. When the deadline passes first the
//! task is abandoned, not cancelled: side effects already in flight may still
//! complete after the caller has been told it timed out.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Deadline applied to steps and assertions unless configured otherwise.
pub const DEFAULT_DEADLINE: Duration = Duration::from_millis(2000);

/// Failure of a timeboxed operation
#[derive(Error, Debug)]
pub enum TimeboxError<E> {
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("{0}")]
    Failed(E),

    #[error("operation panicked: {0}")]
    Panicked(String),
}

impl<E> TimeboxError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TimeboxError::Timeout(_))
    }
}

/// Run `operation` with a deadline of `limit`.
///
/// An operation still running when the deadline is reached is reported as
/// [`TimeboxError::Timeout`], including one that would finish at exactly
/// that instant.
pub async fn timebox<F, T, E>(limit: Duration, operation: F) -> Result<T, TimeboxError<E>>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let deadline = Instant::now() + limit;
    let task = tokio::spawn(operation);
    let timer = tokio::time::sleep_until(deadline);

    // The timer is dropped on every path out of this select.
    tokio::select! {
        biased;
        _ = timer => Err(TimeboxError::Timeout(limit)),
        joined = task => match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(TimeboxError::Failed(e)),
            Err(join_error) => Err(TimeboxError::Panicked(panic_message(join_error))),
        },
    }
}

fn panic_message(error: tokio::task::JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload = error.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
