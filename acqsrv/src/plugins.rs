//! Plugin workers
//!
//! Each plugin module exposes a `register()` called explicitly from `main`
//! during startup; nothing registers itself through load-order side
//! effects.

pub mod cmbus;
pub mod mbus;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Sleep that loses to cancellation; returns whether the full duration
/// elapsed
pub(crate) async fn sleep_unless_cancelled(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Pause between reopen attempts after a transport failure
pub(crate) const REOPEN_BACKOFF: Duration = Duration::from_secs(2);
