//! Interruptible waiting between two ticks of a loop.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Why [`sleep_or_cancel`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Wakeup {
    /// The whole period has elapsed.
    Elapsed,
    /// The token has been cancelled, the loop must exit.
    Cancelled,
}

/// Waits for `period`, or until `token` is cancelled, whichever comes first.
///
/// Cancellation wins if both happen at the same time.
pub(super) async fn sleep_or_cancel(period: Duration, token: &CancellationToken) -> Wakeup {
    tokio::select! {
        biased;

        _ = token.cancelled() => Wakeup::Cancelled,
        _ = tokio::time::sleep(period) => Wakeup::Elapsed,
    }
}
