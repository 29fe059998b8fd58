pub mod atomic;

pub use atomic::{AtomicCounter, AtomicFlag};

/// Polls `flag` every `interval` until it is set, returning `false` if `token` is cancelled first.
pub async fn wait_for_flag(
    flag: &AtomicFlag,
    interval: std::time::Duration,
    token: &tokio_util::sync::CancellationToken,
    group: &str,
) -> bool {
    let mut announced = false;
    while !flag.get() {
        if !announced {
            tracing::info!(group, "Waiting for node to become IDLE before triggering a restart.");
            announced = true;
        }
        tokio::select! {
            _ = token.cancelled() => return false,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    true
}
