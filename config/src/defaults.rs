pub const DEFAULT_REDIS_DSN: &str = "redis://localhost:6379/0";
pub const DEFAULT_QUEUE_NAME: &str = "default";

pub const DEFAULT_POLL_INTERVAL_SECONDS: f64 = 15.0;
pub const DEFAULT_DEQUEUE_TIMEOUT_SECONDS: f64 = 5.0;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: f64 = 30.0;
pub const DEFAULT_HEARTBEAT_TTL_BUFFER_SECONDS: f64 = 15.0;

pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 100;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 5_000;

pub const DEFAULT_MAX_RETRIES: i64 = 0;
pub const DEFAULT_STATE_HISTORY_LIMIT: i64 = 32;

/// Worker count used when the settings leave `concurrency` unset.
pub fn default_concurrency() -> usize {
    num_cpus::get().saturating_mul(2).max(1)
}
