use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::activator::{Invocation, JobActivator};
use crate::job::{FailureInfo, JobDescriptor};
use crate::retry::{self, Backoff};
use crate::storage::Storage;

/// Executes one job at a time. Holds no state between jobs; everything it
/// records goes through the storage gateway.
pub struct Worker {
    id: usize,
    server: String,
    storage: Storage,
    activator: Arc<dyn JobActivator>,
    cancel: CancellationToken,
    free_tx: mpsc::Sender<Worker>,
    completions: mpsc::UnboundedSender<String>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: usize,
        server: String,
        storage: Storage,
        activator: Arc<dyn JobActivator>,
        cancel: CancellationToken,
        free_tx: mpsc::Sender<Worker>,
        completions: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            id,
            server,
            storage,
            activator,
            cancel,
            free_tx,
            completions,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Run `job_id` on this worker's own task and return immediately. The
    /// worker emits exactly one completion event and hands itself back to
    /// the free pool afterwards, whatever the outcome.
    pub fn process(self, job_id: String) {
        tokio::spawn(async move {
            let mut worker = self;
            if let Err(err) = worker.run(&job_id).await {
                tracing::error!(
                    worker = worker.id,
                    job_id = %job_id,
                    error = %err,
                    "job execution error"
                );
            }
            let _ = worker.completions.send(job_id);
            let free_tx = worker.free_tx.clone();
            let _ = free_tx.send(worker).await;
        });
    }

    fn backoff(&self) -> Backoff {
        Backoff::from_settings(self.storage.settings())
    }

    async fn run(&mut self, job_id: &str) -> Result<()> {
        let started_at = Instant::now();
        let storage = self.storage.clone();
        let job = match retry::forever(&self.cancel.clone(), self.backoff(), "load job", move || {
            let mut storage = storage.clone();
            async move { storage.get_job(job_id).await }
        })
        .await?
        {
            Some(Some(job)) => job,
            Some(None) => {
                tracing::warn!(job_id = %job_id, "dequeued job has no descriptor; dropping");
                return Ok(());
            }
            None => return Ok(()),
        };

        let Some(handler) = self.activator.activate(&job.target_type) else {
            let failure = FailureInfo::handler_not_found(&job.target_type);
            tracing::error!(job_id = %job.id, target_type = %job.target_type, "no handler for job");
            self.record_failure(&job, failure).await?;
            return Ok(());
        };

        let server = self.server.clone();
        let storage = self.storage.clone();
        retry::forever(&self.cancel.clone(), self.backoff(), "mark processing", move || {
            let mut storage = storage.clone();
            let server = server.clone();
            async move {
                storage
                    .mark_job_processing(job_id, &server, Utc::now())
                    .await
            }
        })
        .await?;

        let invocation = Invocation {
            job_id: job.id.clone(),
            method: job.method.clone(),
            args: job.args.clone(),
        };
        // Invoked on its own task so a panicking handler surfaces as a
        // JoinError instead of unwinding through the worker.
        let handle = tokio::spawn(async move { handler.invoke(invocation).await });
        let outcome = match handle.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(FailureInfo::from_error(&err)),
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    match join_err.into_panic().downcast::<String>() {
                        Ok(payload) => *payload,
                        Err(payload) => payload
                            .downcast::<&str>()
                            .map(|s| s.to_string())
                            .unwrap_or_else(|_| "handler panicked".to_string()),
                    }
                } else {
                    "handler task was cancelled".to_string()
                };
                Err(FailureInfo::panic(message))
            }
        };
        let duration_ms = started_at.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(_) => {
                let storage = self.storage.clone();
                retry::forever(&self.cancel.clone(), self.backoff(), "mark succeeded", move || {
                    let mut storage = storage.clone();
                    async move { storage.mark_job_succeeded(job_id, Utc::now()).await }
                })
                .await?;
                tracing::info!(
                    worker = self.id,
                    job_id = %job.id,
                    target_type = %job.target_type,
                    method = %job.method,
                    duration_ms,
                    "job succeeded"
                );
            }
            Err(failure) => {
                tracing::warn!(
                    worker = self.id,
                    job_id = %job.id,
                    error_type = %failure.error_type,
                    error_message = %failure.message,
                    duration_ms,
                    "job failed"
                );
                self.record_failure(&job, failure).await?;
            }
        }
        Ok(())
    }

    /// Record a failed attempt: re-enqueue while retries remain, otherwise
    /// mark the job failed for good.
    async fn record_failure(&mut self, job: &JobDescriptor, failure: FailureInfo) -> Result<()> {
        if job.retries < job.max_retries {
            let attempt = job.retries + 1;
            let queue = job.queue.clone();
            tracing::info!(
                job_id = %job.id,
                attempt,
                max_retries = job.max_retries,
                "re-enqueueing failed job"
            );
            let storage = self.storage.clone();
            let job_id = job.id.clone();
            retry::forever(&self.cancel.clone(), self.backoff(), "retry job", move || {
                let mut storage = storage.clone();
                let job_id = job_id.clone();
                let queue = queue.clone();
                let failure = failure.clone();
                async move { storage.retry_job(&job_id, &queue, attempt, &failure).await }
            })
            .await?;
        } else {
            let storage = self.storage.clone();
            let job_id = job.id.clone();
            retry::forever(&self.cancel.clone(), self.backoff(), "mark failed", move || {
                let mut storage = storage.clone();
                let job_id = job_id.clone();
                let failure = failure.clone();
                async move { storage.mark_job_failed(&job_id, &failure, Utc::now()).await }
            })
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activator::{HandlerRegistry, JobHandler};
    use crate::job::JobState;
    use crate::test_support::{RedisTestContext, build_job};
    use async_trait::async_trait;
    use serde_json::{Value, json};

    struct EchoHandler;

    #[async_trait]
    impl JobHandler for EchoHandler {
        async fn invoke(&self, invocation: Invocation) -> Result<Value> {
            Ok(json!(invocation.args))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl JobHandler for FailingHandler {
        async fn invoke(&self, _invocation: Invocation) -> Result<Value> {
            Err(anyhow::anyhow!("did not work"))
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl JobHandler for PanickingHandler {
        async fn invoke(&self, _invocation: Invocation) -> Result<Value> {
            panic!("handler blew up");
        }
    }

    fn test_registry() -> Arc<HandlerRegistry> {
        let mut registry = HandlerRegistry::new();
        registry.register("echo", Arc::new(EchoHandler));
        registry.register("failing", Arc::new(FailingHandler));
        registry.register("panicking", Arc::new(PanickingHandler));
        Arc::new(registry)
    }

    struct WorkerHarness {
        worker: Option<Worker>,
        free_rx: mpsc::Receiver<Worker>,
        completion_rx: mpsc::UnboundedReceiver<String>,
    }

    fn spawn_worker(ctx: &RedisTestContext) -> WorkerHarness {
        let (free_tx, free_rx) = mpsc::channel(1);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let worker = Worker::new(
            0,
            ctx.server_name.clone(),
            ctx.storage.clone(),
            test_registry(),
            CancellationToken::new(),
            free_tx,
            completion_tx,
        );
        WorkerHarness {
            worker: Some(worker),
            free_rx,
            completion_rx,
        }
    }

    async fn run_one(harness: &mut WorkerHarness, job_id: String) {
        harness.worker.take().unwrap().process(job_id.clone());
        let returned = harness.free_rx.recv().await.unwrap();
        harness.worker = Some(returned);
        let completed = harness.completion_rx.recv().await.unwrap();
        assert_eq!(completed, job_id);
    }

    #[tokio::test]
    async fn worker_records_success() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx.settings.queue.clone();
        let mut job = build_job(&queue);
        job.target_type = "echo".to_string();
        ctx.storage.enqueue_job(&job).await.unwrap();

        let mut harness = spawn_worker(&ctx);
        run_one(&mut harness, job.id.clone()).await;

        let loaded = ctx.storage.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Succeeded);
        assert!(loaded.finished_at.is_some());
        assert_eq!(loaded.server.as_deref(), Some(ctx.server_name.as_str()));
    }

    #[tokio::test]
    async fn worker_captures_handler_failure() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx.settings.queue.clone();
        let mut job = build_job(&queue);
        job.target_type = "failing".to_string();
        ctx.storage.enqueue_job(&job).await.unwrap();

        let mut harness = spawn_worker(&ctx);
        run_one(&mut harness, job.id.clone()).await;

        let loaded = ctx.storage.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Failed);
        assert_eq!(loaded.error_type.as_deref(), Some("HandlerError"));
        assert_eq!(loaded.error_message.as_deref(), Some("did not work"));
    }

    #[tokio::test]
    async fn worker_captures_handler_panic() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx.settings.queue.clone();
        let mut job = build_job(&queue);
        job.target_type = "panicking".to_string();
        ctx.storage.enqueue_job(&job).await.unwrap();

        let mut harness = spawn_worker(&ctx);
        run_one(&mut harness, job.id.clone()).await;

        let loaded = ctx.storage.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Failed);
        assert_eq!(loaded.error_type.as_deref(), Some("Panic"));
        assert!(loaded.error_message.unwrap().contains("handler blew up"));
    }

    #[tokio::test]
    async fn worker_fails_unknown_target_type() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx.settings.queue.clone();
        let mut job = build_job(&queue);
        job.target_type = "unregistered".to_string();
        ctx.storage.enqueue_job(&job).await.unwrap();

        let mut harness = spawn_worker(&ctx);
        run_one(&mut harness, job.id.clone()).await;

        let loaded = ctx.storage.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Failed);
        assert_eq!(loaded.error_type.as_deref(), Some("HandlerNotFound"));
    }

    #[tokio::test]
    async fn worker_requeues_while_retries_remain() {
        let mut ctx = RedisTestContext::new().await.unwrap();
        let queue = ctx.settings.queue.clone();
        let mut job = build_job(&queue);
        job.target_type = "failing".to_string();
        job.max_retries = 1;
        ctx.storage.enqueue_job(&job).await.unwrap();

        let mut harness = spawn_worker(&ctx);
        run_one(&mut harness, job.id.clone()).await;

        let loaded = ctx.storage.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Enqueued);
        assert_eq!(loaded.retries, 1);

        // second attempt exhausts the budget
        run_one(&mut harness, job.id.clone()).await;
        let loaded = ctx.storage.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Failed);
    }

    #[tokio::test]
    async fn worker_drops_job_without_descriptor() {
        let ctx = RedisTestContext::new().await.unwrap();
        let mut harness = spawn_worker(&ctx);
        // the completion event and returned worker inside run_one are the
        // whole contract for a missing descriptor
        run_one(&mut harness, "no-such-job".to_string()).await;
    }
}
