use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::storage::Storage;

/// Periodically promote due scheduled jobs into their queues. A slow
/// iteration simply coalesces into the next tick; there is no catch-up
/// multiplication. Errors are logged and the affected entries are retried
/// implicitly on the next pass.
pub async fn run(mut storage: Storage, poll_interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = promote_due(&mut storage).await {
                    tracing::warn!(error = %err, "schedule poll failed");
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
    tracing::debug!("schedule poller stopped");
}

async fn promote_due(storage: &mut Storage) -> Result<()> {
    let due = storage.due_scheduled_jobs(Utc::now()).await?;
    for job_id in due {
        if storage.promote_scheduled_job(&job_id).await? {
            tracing::info!(job_id = %job_id, "promoted scheduled job");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;
    use crate::test_support::{RedisTestContext, build_job, wait_until};

    #[tokio::test]
    async fn due_jobs_are_promoted_within_an_interval() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx.settings.queue.clone();
        let mut job = build_job(&queue);
        job.state = JobState::Scheduled;
        let run_at = Utc::now() - chrono::Duration::seconds(1);
        ctx.storage.schedule_job(&job, run_at).await.unwrap();

        let cancel = CancellationToken::new();
        let poller = tokio::spawn(run(
            ctx.storage.clone(),
            Duration::from_millis(100),
            cancel.clone(),
        ));

        let mut storage = ctx.storage.clone();
        let queue_name = queue.clone();
        wait_until(Duration::from_secs(2), || async {
            Ok(storage.queue_len(&queue_name).await? == 1)
        })
        .await
        .unwrap();

        cancel.cancel();
        poller.await.unwrap();

        let loaded = ctx.storage.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Enqueued);
        assert_eq!(ctx.storage.schedule_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn future_jobs_stay_scheduled() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx.settings.queue.clone();
        let mut job = build_job(&queue);
        job.state = JobState::Scheduled;
        let run_at = Utc::now() + chrono::Duration::seconds(60);
        ctx.storage.schedule_job(&job, run_at).await.unwrap();

        let cancel = CancellationToken::new();
        let poller = tokio::spawn(run(
            ctx.storage.clone(),
            Duration::from_millis(50),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        poller.await.unwrap();

        assert_eq!(ctx.storage.queue_len(&queue).await.unwrap(), 0);
        assert_eq!(ctx.storage.schedule_len().await.unwrap(), 1);
    }
}
