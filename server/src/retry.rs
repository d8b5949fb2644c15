use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use winch_config::ServerSettings;

/// Exponential backoff doubling from `base` to `cap`, with jitter applied to
/// each delay so concurrent retriers spread out.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        let base = base.max(Duration::from_millis(1));
        let cap = cap.max(base);
        Self { base, cap, next: base }
    }

    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self::new(settings.retry_base_delay(), settings.retry_max_delay())
    }

    pub fn reset(&mut self) {
        self.next = self.base;
    }

    pub fn next_delay(&mut self) -> Duration {
        let current = self.next;
        self.next = self.cap.min(current.saturating_mul(2));
        jitter(current).min(self.cap)
    }
}

fn jitter(delay: Duration) -> Duration {
    let base = delay.as_secs_f64();
    if base <= 0.0 {
        return Duration::ZERO;
    }
    let mut rng = rand::rng();
    Duration::from_secs_f64(rng.random_range(base * 0.75..=base * 1.25))
}

/// True for store errors worth retrying: connection loss, timeouts, and the
/// busy/cluster conditions Redis reports while it sorts itself out. Logical
/// errors (wrong types, malformed data) fail fast.
pub fn is_transient(err: &anyhow::Error) -> bool {
    let Some(redis_err) = err.downcast_ref::<redis::RedisError>() else {
        return false;
    };
    if redis_err.is_io_error()
        || redis_err.is_timeout()
        || redis_err.is_connection_dropped()
        || redis_err.is_connection_refusal()
    {
        return true;
    }
    matches!(
        redis_err.kind(),
        redis::ErrorKind::BusyLoadingError
            | redis::ErrorKind::TryAgain
            | redis::ErrorKind::MasterDown
            | redis::ErrorKind::ClusterDown
    )
}

/// Sleep unless cancelled first. Returns false when cancellation cut the
/// sleep short.
pub async fn sleep_cancellable(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}

/// Run `op`, retrying transient errors with backoff until it succeeds, a
/// non-transient error surfaces, or the token is cancelled (`Ok(None)`).
pub async fn forever<T, F, Fut>(
    cancel: &CancellationToken,
    mut backoff: Backoff,
    what: &str,
    mut op: F,
) -> Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        match op().await {
            Ok(value) => return Ok(Some(value)),
            Err(err) if is_transient(&err) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    operation = what,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "transient storage error; retrying"
                );
                if !sleep_cancellable(cancel, delay).await {
                    return Ok(None);
                }
            }
            Err(err) => return Err(err),
        }
    }
}
