use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::job::{JobDescriptor, JobState};
use crate::storage::Storage;
use winch_config::ServerSettings;

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub queue: Option<String>,
    pub job_id: Option<String>,
    pub max_retries: Option<i64>,
}

/// Producer-side API: put work on a queue now, or on the schedule for later.
#[derive(Clone)]
pub struct Client {
    settings: ServerSettings,
    storage: Storage,
}

impl Client {
    pub async fn connect(settings: ServerSettings) -> Result<Self> {
        let storage = Storage::connect(settings.clone()).await?;
        Ok(Self::with_storage(settings, storage))
    }

    pub fn with_storage(settings: ServerSettings, storage: Storage) -> Self {
        Self { settings, storage }
    }

    fn build_job(
        &self,
        target_type: &str,
        method: &str,
        args: Vec<Value>,
        options: &EnqueueOptions,
        state: JobState,
    ) -> JobDescriptor {
        JobDescriptor {
            id: options.job_id.clone().unwrap_or_else(JobDescriptor::new_id),
            target_type: target_type.to_string(),
            method: method.to_string(),
            args,
            queue: options
                .queue
                .clone()
                .unwrap_or_else(|| self.settings.queue.clone()),
            state,
            enqueued_at: Utc::now(),
            scheduled_at: None,
            started_at: None,
            finished_at: None,
            server: None,
            retries: 0,
            max_retries: options.max_retries.unwrap_or(self.settings.max_retries),
            error_type: None,
            error_message: None,
            error_detail: None,
        }
    }

    pub async fn enqueue(
        &mut self,
        target_type: &str,
        method: &str,
        args: Vec<Value>,
        options: EnqueueOptions,
    ) -> Result<JobDescriptor> {
        let job = self.build_job(target_type, method, args, &options, JobState::Enqueued);
        self.storage.enqueue_job(&job).await?;
        tracing::info!(
            job_id = %job.id,
            target_type = %job.target_type,
            method = %job.method,
            queue = %job.queue,
            "enqueued job"
        );
        Ok(job)
    }

    pub async fn schedule(
        &mut self,
        target_type: &str,
        method: &str,
        args: Vec<Value>,
        run_at: DateTime<Utc>,
        options: EnqueueOptions,
    ) -> Result<JobDescriptor> {
        let mut job = self.build_job(target_type, method, args, &options, JobState::Scheduled);
        job.scheduled_at = Some(run_at);
        self.storage.schedule_job(&job, run_at).await?;
        tracing::info!(
            job_id = %job.id,
            target_type = %job.target_type,
            run_at = %run_at.to_rfc3339(),
            "scheduled job"
        );
        Ok(job)
    }

    /// Operator action: move a failed job back onto its queue. Returns false
    /// when the job is missing or not in the failed state.
    pub async fn requeue_failed(&mut self, job_id: &str) -> Result<bool> {
        let requeued = self.storage.requeue_failed_job(job_id).await?;
        if requeued {
            tracing::info!(job_id = %job_id, "requeued failed job");
        }
        Ok(requeued)
    }

    pub async fn get_job(&mut self, job_id: &str) -> Result<Option<JobDescriptor>> {
        self.storage.get_job(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RedisTestContext;
    use serde_json::json;

    #[tokio::test]
    async fn enqueue_applies_defaults() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let mut settings = ctx.settings.clone();
        settings.max_retries = 2;
        let mut client = Client::with_storage(settings.clone(), ctx.storage.clone());

        let job = client
            .enqueue("reports", "build", vec![json!(7)], EnqueueOptions::default())
            .await
            .unwrap();
        assert_eq!(job.queue, settings.queue);
        assert_eq!(job.max_retries, 2);
        assert_eq!(job.state, JobState::Enqueued);

        let loaded = ctx.storage.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.target_type, "reports");
        assert_eq!(loaded.method, "build");
        assert_eq!(loaded.args, vec![json!(7)]);
        assert_eq!(ctx.storage.queue_len(&settings.queue).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn enqueue_honors_explicit_options() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let mut client = Client::with_storage(ctx.settings.clone(), ctx.storage.clone());

        let options = EnqueueOptions {
            queue: Some(format!("{}-other", ctx.settings.queue)),
            job_id: Some("explicit-id".to_string()),
            max_retries: Some(5),
        };
        let job = client
            .enqueue("reports", "build", vec![], options)
            .await
            .unwrap();
        assert_eq!(job.id, "explicit-id");
        assert_eq!(job.max_retries, 5);
        assert_eq!(
            ctx.storage.queue_len(&job.queue).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn schedule_places_job_on_schedule_only() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let mut client = Client::with_storage(ctx.settings.clone(), ctx.storage.clone());

        let run_at = Utc::now() + chrono::Duration::seconds(30);
        let job = client
            .schedule("reports", "build", vec![], run_at, EnqueueOptions::default())
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(ctx.storage.schedule_len().await.unwrap(), 1);
        assert_eq!(ctx.storage.queue_len(&job.queue).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn requeue_failed_round_trip() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let mut client = Client::with_storage(ctx.settings.clone(), ctx.storage.clone());

        let job = client
            .enqueue("reports", "build", vec![], EnqueueOptions::default())
            .await
            .unwrap();
        assert!(!client.requeue_failed(&job.id).await.unwrap());

        let failure = crate::job::FailureInfo {
            error_type: "HandlerError".to_string(),
            message: "broken".to_string(),
            detail: None,
        };
        ctx.storage
            .mark_job_failed(&job.id, &failure, Utc::now())
            .await
            .unwrap();

        assert!(client.requeue_failed(&job.id).await.unwrap());
        let loaded = client.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Enqueued);
    }
}
