//! Watchdog: a non-cancelling timer that fires a callback if work overruns (spec §9).
//!
//! Mirrors the source's `Timer`-based kill-on-timeout pattern from `run_ssh_command`, recast
//! as a `tokio::time::sleep` raced against a completion signal instead of a background thread.

use std::time::Duration;

use tokio::sync::oneshot;

/// Runs `work` to completion, invoking `on_timeout` if it hasn't finished after `limit`.
/// `on_timeout` firing does not cancel `work`; it only reports that the deadline passed.
pub async fn watch<F, T>(limit: Duration, work: F, on_timeout: impl FnOnce()) -> T
where
    F: std::future::Future<Output = T>,
{
    let (tx, rx) = oneshot::channel::<()>();

    tokio::pin!(work);
    tokio::select! {
        result = &mut work => {
            let _ = tx.send(());
            result
        }
        _ = tokio::time::sleep(limit) => {
            on_timeout();
            let result = work.await;
            let _ = rx;
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn does_not_fire_when_work_finishes_in_time() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();

        let result = watch(
            Duration::from_millis(200),
            async { 42 },
            move || fired_clone.store(true, Ordering::SeqCst),
        )
        .await;

        assert_eq!(result, 42);
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn fires_but_still_returns_the_eventual_result() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();

        let result = watch(
            Duration::from_millis(10),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                7
            },
            move || fired_clone.store(true, Ordering::SeqCst),
        )
        .await;

        assert_eq!(result, 7);
        assert!(fired.load(Ordering::SeqCst));
    }
}
