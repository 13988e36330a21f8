//! Try, log, continue
//!
//! Side-channel work (daily log appends, pre-write config copies, per-item
//! backup copies, signalling tree members) must never fail the primary
//! operation. These helpers swallow the error after logging it as a warning.

use std::fmt::Display;
use std::future::Future;

/// Log and discard the error of a side-channel action
pub fn soft<T, E: Display>(worker_id: &str, action: &str, result: Result<T, E>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(worker_id = %worker_id, action = %action, error = %e, "Ignoring background failure");
            None
        }
    }
}

/// Async variant of [`soft`]
pub async fn soft_async<T, E, F>(worker_id: &str, action: &str, fut: F) -> Option<T>
where
    E: Display,
    F: Future<Output = Result<T, E>>,
{
    soft(worker_id, action, fut.await)
}
