use std::future::Future;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::job::{JobDescriptor, JobState};
use crate::storage::Storage;
use winch_config::ServerSettings;

static REDIS_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn redis_lock() -> &'static Mutex<()> {
    REDIS_LOCK.get_or_init(|| Mutex::new(()))
}

/// Serialized access to the test Redis database, flushed per test.
pub struct RedisTestContext {
    _guard: MutexGuard<'static, ()>,
    pub settings: ServerSettings,
    pub server_name: String,
    pub storage: Storage,
}

impl RedisTestContext {
    pub async fn new() -> Result<Self> {
        let guard = redis_lock().lock().await;
        let mut settings = ServerSettings::default();
        settings.redis_dsn = std::env::var("WINCH_TEST_REDIS_DSN")
            .unwrap_or_else(|_| "redis://localhost:6379/15".to_string());
        settings.queue = format!("test-queue-{}", Uuid::new_v4());
        settings.server_name = Some(format!("test-server-{}", Uuid::new_v4()));
        settings.dequeue_timeout_seconds = 1.0;
        settings.poll_interval_seconds = 1.0;
        settings.heartbeat_interval_seconds = 5.0;
        settings.retry_base_delay_ms = 10;
        settings.retry_max_delay_ms = 100;
        let server_name = settings.server_name.clone().unwrap_or_default();
        let mut storage = Storage::connect(settings.clone()).await?;
        storage.flushdb().await?;
        Ok(Self {
            _guard: guard,
            settings,
            server_name,
            storage,
        })
    }
}

pub fn build_job(queue: &str) -> JobDescriptor {
    JobDescriptor {
        id: JobDescriptor::new_id(),
        target_type: "echo".to_string(),
        method: "run".to_string(),
        args: Vec::new(),
        queue: queue.to_string(),
        state: JobState::Enqueued,
        enqueued_at: Utc::now(),
        scheduled_at: None,
        started_at: None,
        finished_at: None,
        server: None,
        retries: 0,
        max_retries: 0,
        error_type: None,
        error_message: None,
        error_detail: None,
    }
}

/// Poll `check` until it returns true or the deadline passes.
pub async fn wait_until<F, Fut>(deadline: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let started = Instant::now();
    loop {
        if check().await? {
            return Ok(());
        }
        if started.elapsed() > deadline {
            return Err(anyhow::anyhow!("condition not reached within {deadline:?}"));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
