use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Mutex, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::activator::JobActivator;
use crate::drain;
use crate::pool::WorkerPool;
use crate::retry::{self, Backoff};
use crate::scheduler;
use crate::storage::Storage;
use winch_config::ServerSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Init,
    Announced,
    Recovering,
    Dispatching,
    Stopping,
    Stopped,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Init => "INIT",
            ServerState::Announced => "ANNOUNCED",
            ServerState::Recovering => "RECOVERING",
            ServerState::Dispatching => "DISPATCHING",
            ServerState::Stopping => "STOPPING",
            ServerState::Stopped => "STOPPED",
        }
    }
}

/// The server runtime: announce, recover, dequeue, dispatch, shut down.
///
/// Owns two storage gateways. The blocking one is reserved for the dequeue
/// wait so that a pending BRPOPLPUSH cannot starve completions or recovery.
pub struct Server {
    settings: ServerSettings,
    server_name: String,
    queue: String,
    concurrency: usize,
    storage: Storage,
    blocking: Storage,
    activator: Arc<dyn JobActivator>,
    cancel: CancellationToken,
    state: Arc<Mutex<ServerState>>,
}

impl Server {
    /// Validate the settings and open both store connections. Validation
    /// failures mean the server never starts.
    pub async fn connect(
        settings: ServerSettings,
        activator: Arc<dyn JobActivator>,
    ) -> Result<Self> {
        settings.validate()?;
        let server_name = settings.resolved_server_name();
        let queue = settings.queue.clone();
        let concurrency = settings.concurrency;
        let storage = Storage::connect(settings.clone()).await?;
        let blocking = Storage::connect(settings.clone()).await?;
        Ok(Self {
            settings,
            server_name,
            queue,
            concurrency,
            storage,
            blocking,
            activator,
            cancel: CancellationToken::new(),
            state: Arc::new(Mutex::new(ServerState::Init)),
        })
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Token observed by every component. Cancelling it initiates a clean
    /// shutdown; the run loop notices within one dequeue timeout.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn backoff(&self) -> Backoff {
        Backoff::from_settings(&self.settings)
    }

    async fn set_state(&self, state: ServerState) {
        *self.state.lock().await = state;
    }

    /// Run the full lifecycle. Returns once cancellation has been observed
    /// and every component has stopped, or after a fatal storage error has
    /// been cleaned up.
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(
            server = %self.server_name,
            queue = %self.queue,
            concurrency = self.concurrency,
            "server starting"
        );

        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let mut pool = WorkerPool::new(
            self.concurrency,
            &self.server_name,
            self.storage.clone(),
            self.activator.clone(),
            self.cancel.clone(),
            completion_tx,
        )?;

        let drain_handle = tokio::spawn(drain::run(
            self.storage.clone(),
            completion_rx,
            self.server_name.clone(),
            self.queue.clone(),
            self.cancel.clone(),
        ));
        let poller_handle = tokio::spawn(scheduler::run(
            self.storage.clone(),
            self.settings.poll_interval(),
            self.cancel.clone(),
        ));
        let heartbeat_handle = tokio::spawn(heartbeat_loop(
            self.storage.clone(),
            self.server_name.clone(),
            self.state.clone(),
            self.settings.heartbeat_interval(),
            self.cancel.clone(),
        ));

        let result = self.dispatch(&mut pool).await;

        self.set_state(ServerState::Stopping).await;
        tracing::info!(server = %self.server_name, "shutdown requested");
        self.cancel.cancel();

        let _ = poller_handle.await;
        pool.shutdown().await;
        let _ = drain_handle.await;
        let _ = heartbeat_handle.await;
        self.hide().await;

        self.set_state(ServerState::Stopped).await;
        tracing::info!(server = %self.server_name, "server stopped");
        result
    }

    async fn dispatch(&mut self, pool: &mut WorkerPool) -> Result<()> {
        let storage = self.storage.clone();
        let server_name = self.server_name.clone();
        let queue = self.queue.clone();
        let concurrency = self.concurrency;
        let announced = retry::forever(
            &self.cancel.clone(),
            self.backoff(),
            "announce server",
            || {
                let mut storage = storage.clone();
                let server_name = server_name.clone();
                let queue = queue.clone();
                async move {
                    storage
                        .announce_server(&server_name, &queue, concurrency)
                        .await
                }
            },
        )
        .await?;
        if announced.is_none() {
            return Ok(());
        }
        self.set_state(ServerState::Announced).await;

        self.set_state(ServerState::Recovering).await;
        let storage = self.storage.clone();
        let server_name = self.server_name.clone();
        let queue = self.queue.clone();
        let cancel = self.cancel.clone();
        let recovered = retry::forever(
            &self.cancel.clone(),
            self.backoff(),
            "requeue processing jobs",
            || {
                let mut storage = storage.clone();
                let server_name = server_name.clone();
                let queue = queue.clone();
                let cancel = cancel.clone();
                async move {
                    storage
                        .requeue_processing_jobs(&server_name, &queue, &cancel)
                        .await
                }
            },
        )
        .await?;
        let Some(recovered) = recovered else {
            return Ok(());
        };
        tracing::info!(
            server = %self.server_name,
            count = recovered,
            "requeued processing jobs left by the previous run"
        );

        self.set_state(ServerState::Dispatching).await;
        loop {
            let Some(worker) = pool.take_free(&self.cancel).await else {
                return Ok(());
            };
            match self.next_job_id().await {
                Ok(Some(job_id)) => {
                    tracing::debug!(job_id = %job_id, worker = worker.id(), "dispatching job");
                    worker.process(job_id);
                }
                Ok(None) => {
                    pool.release(worker).await;
                    return Ok(());
                }
                Err(err) => {
                    pool.release(worker).await;
                    tracing::error!(
                        server = %self.server_name,
                        error = %err,
                        "fatal storage error in manager loop"
                    );
                    return Err(err);
                }
            }
        }
    }

    /// Blocking dequeue in a retry loop. The bounded timeout on each wait is
    /// what lets the loop observe cancellation.
    async fn next_job_id(&mut self) -> Result<Option<String>> {
        let timeout = self.settings.dequeue_timeout();
        let mut backoff = self.backoff();
        loop {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            match self
                .blocking
                .dequeue_job_id(&self.server_name, &self.queue, timeout)
                .await
            {
                Ok(Some(job_id)) => return Ok(Some(job_id)),
                Ok(None) => continue,
                Err(err) if retry::is_transient(&err) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        error = %err,
                        retry_in_ms = delay.as_millis() as u64,
                        "transient storage error while dequeuing; retrying"
                    );
                    if !retry::sleep_cancellable(&self.cancel, delay).await {
                        return Ok(None);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Remove this server from the registry. Best-effort: cancellation has
    /// already fired, so transient failures get a few short retries rather
    /// than the usual infinite loop.
    async fn hide(&mut self) {
        let mut backoff = self.backoff();
        for _ in 0..3 {
            match self.storage.hide_server(&self.server_name).await {
                Ok(()) => {
                    tracing::info!(server = %self.server_name, "server hidden");
                    return;
                }
                Err(err) if retry::is_transient(&err) => {
                    tracing::warn!(error = %err, "transient error while hiding server; retrying");
                    tokio::time::sleep(backoff.next_delay()).await;
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to hide server");
                    return;
                }
            }
        }
        tracing::error!(server = %self.server_name, "failed to hide server after retries");
    }
}

/// Refresh the registry entry so dashboards can tell live servers from dead
/// ones; the entry's TTL outlives two missed beats at most.
async fn heartbeat_loop(
    mut storage: Storage,
    server_name: String,
    state: Arc<Mutex<ServerState>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let label = state.lock().await.as_str();
                if let Err(err) = storage.heartbeat_server(&server_name, label).await {
                    tracing::warn!(error = %err, "failed to refresh server heartbeat");
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}
