use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Runs `check` every `interval` until it yields a value or `timeout` elapses.
///
/// The check always runs at least once. `Ok(None)` means the deadline passed
/// without a value; check errors are returned immediately.
pub async fn poll_until<T, E, F, Fut>(
    interval: Duration,
    timeout: Duration,
    mut check: F,
) -> Result<Option<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check().await? {
            return Ok(Some(value));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        sleep(interval.min(deadline - now)).await;
    }
}
