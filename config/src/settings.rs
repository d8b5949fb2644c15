use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::defaults::{
    DEFAULT_DEQUEUE_TIMEOUT_SECONDS, DEFAULT_HEARTBEAT_INTERVAL_SECONDS,
    DEFAULT_HEARTBEAT_TTL_BUFFER_SECONDS, DEFAULT_MAX_RETRIES, DEFAULT_POLL_INTERVAL_SECONDS,
    DEFAULT_QUEUE_NAME, DEFAULT_REDIS_DSN, DEFAULT_RETRY_BASE_DELAY_MS,
    DEFAULT_RETRY_MAX_DELAY_MS, DEFAULT_STATE_HISTORY_LIMIT, default_concurrency,
};

const GENERATED_SERVER_NAME_PREFIX: &str = "winch_server_";

/// Construction-time options for a winch server, loadable from TOML and
/// `WINCH_*` environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct ServerSettings {
    pub redis_dsn: String,
    /// Cluster-unique server identity. Generated from pid + a uuid suffix
    /// when unset; an explicitly empty value is rejected at validation.
    pub server_name: Option<String>,
    pub queue: String,
    pub concurrency: usize,
    pub poll_interval_seconds: f64,
    pub dequeue_timeout_seconds: f64,
    pub heartbeat_interval_seconds: f64,
    pub heartbeat_ttl_buffer_seconds: f64,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub max_retries: i64,
    pub state_history_limit: i64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            redis_dsn: DEFAULT_REDIS_DSN.to_string(),
            server_name: None,
            queue: DEFAULT_QUEUE_NAME.to_string(),
            concurrency: default_concurrency(),
            poll_interval_seconds: DEFAULT_POLL_INTERVAL_SECONDS,
            dequeue_timeout_seconds: DEFAULT_DEQUEUE_TIMEOUT_SECONDS,
            heartbeat_interval_seconds: DEFAULT_HEARTBEAT_INTERVAL_SECONDS,
            heartbeat_ttl_buffer_seconds: DEFAULT_HEARTBEAT_TTL_BUFFER_SECONDS,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            state_history_limit: DEFAULT_STATE_HISTORY_LIMIT,
        }
    }
}

impl ServerSettings {
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = self.server_name.as_deref()
            && name.trim().is_empty()
        {
            return Err(anyhow::anyhow!("server_name must not be empty"));
        }
        if self.queue.trim().is_empty() {
            return Err(anyhow::anyhow!("queue must not be empty"));
        }
        if self.concurrency == 0 {
            return Err(anyhow::anyhow!("concurrency must be at least 1"));
        }
        if self.poll_interval_seconds <= 0.0 {
            return Err(anyhow::anyhow!("poll_interval_seconds must be positive"));
        }
        if self.dequeue_timeout_seconds <= 0.0 {
            return Err(anyhow::anyhow!("dequeue_timeout_seconds must be positive"));
        }
        if self.heartbeat_interval_seconds <= 0.0 {
            return Err(anyhow::anyhow!("heartbeat_interval_seconds must be positive"));
        }
        if self.max_retries < 0 {
            return Err(anyhow::anyhow!("max_retries must not be negative"));
        }
        if self.state_history_limit < 1 {
            return Err(anyhow::anyhow!("state_history_limit must be at least 1"));
        }
        Ok(())
    }

    /// The configured server name, or a generated one unique to this process.
    pub fn resolved_server_name(&self) -> String {
        match self.server_name.as_deref() {
            Some(name) => name.to_string(),
            None => {
                let short_id = uuid::Uuid::new_v4().to_string();
                let suffix = &short_id[..6];
                format!(
                    "{GENERATED_SERVER_NAME_PREFIX}{}_{}",
                    std::process::id(),
                    suffix
                )
            }
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval_seconds)
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.dequeue_timeout_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_interval_seconds)
    }

    /// TTL on the server registry entry; heartbeats refresh it, so a stale
    /// entry past this window means the server is gone.
    pub fn heartbeat_ttl_seconds(&self) -> i64 {
        (self.heartbeat_interval_seconds + self.heartbeat_ttl_buffer_seconds).ceil() as i64
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}
