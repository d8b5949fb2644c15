use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::activator::JobActivator;
use crate::storage::Storage;
use crate::worker::Worker;

/// Bounded set of idle workers. At any instant
/// `busy workers + free workers == concurrency`; the free side lives in the
/// channel, the busy side is whatever `process` is currently running.
pub struct WorkerPool {
    concurrency: usize,
    free_tx: mpsc::Sender<Worker>,
    free_rx: mpsc::Receiver<Worker>,
    disposed: bool,
}

impl WorkerPool {
    pub fn new(
        concurrency: usize,
        server: &str,
        storage: Storage,
        activator: Arc<dyn JobActivator>,
        cancel: CancellationToken,
        completions: mpsc::UnboundedSender<String>,
    ) -> Result<Self> {
        let (free_tx, free_rx) = mpsc::channel(concurrency.max(1));
        for id in 0..concurrency {
            let worker = Worker::new(
                id,
                server.to_string(),
                storage.clone(),
                activator.clone(),
                cancel.clone(),
                free_tx.clone(),
                completions.clone(),
            );
            free_tx
                .try_send(worker)
                .map_err(|_| anyhow::anyhow!("worker pool channel full while seeding"))?;
        }
        Ok(Self {
            concurrency,
            free_tx,
            free_rx,
            disposed: false,
        })
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Wait for a free worker. Returns `None` when cancellation fires first.
    pub async fn take_free(&mut self, cancel: &CancellationToken) -> Option<Worker> {
        tokio::select! {
            worker = self.free_rx.recv() => worker,
            _ = cancel.cancelled() => None,
        }
    }

    /// Hand back a worker that was taken but never dispatched.
    pub async fn release(&mut self, worker: Worker) {
        let _ = self.free_tx.send(worker).await;
    }

    /// Stop handing out workers and wait for every in-flight job to finish.
    /// Dropping the collected workers closes the completion channel, which
    /// lets the drain exit once it has consumed the remaining events.
    /// Idempotent.
    pub async fn shutdown(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        for _ in 0..self.concurrency {
            if self.free_rx.recv().await.is_none() {
                break;
            }
        }
    }
}
