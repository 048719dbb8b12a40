use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Draw a delay uniformly from `[min_ms, max_ms]`, both ends included.
///
/// Inverted bounds are not reordered, the delay is `min_ms` in that case.
pub fn jittered_delay<R: Rng + ?Sized>(rng: &mut R, min_ms: u64, max_ms: u64) -> Duration {
    if min_ms > max_ms {
        warn!(min_ms, max_ms, "sleep bounds are inverted, using the lower bound");
        return Duration::from_millis(min_ms);
    }
    Duration::from_millis(rng.random_range(min_ms..=max_ms))
}

/// Sleep for `delay` or until `cancel` is triggered.
///
/// Returns false if the sleep was interrupted.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
