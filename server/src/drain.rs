use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::retry::{self, Backoff};
use crate::storage::Storage;

/// Single consumer of worker completion events. Each event means "no longer
/// in flight": the job id is cleared from this server's processing list.
/// Runs until the channel closes, which happens only after the pool has
/// dropped every worker, so events emitted during shutdown still land.
pub async fn run(
    storage: Storage,
    mut completions: mpsc::UnboundedReceiver<String>,
    server: String,
    queue: String,
    cancel: CancellationToken,
) {
    while let Some(job_id) = completions.recv().await {
        let result = retry::forever(
            &cancel,
            Backoff::from_settings(storage.settings()),
            "remove processing job",
            || {
                let mut storage = storage.clone();
                let server = server.clone();
                let queue = queue.clone();
                let job_id = job_id.clone();
                async move {
                    storage
                        .remove_processing_job(&server, &queue, &job_id)
                        .await
                }
            },
        )
        .await;
        match result {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::warn!(
                    job_id = %job_id,
                    "cancelled before the processing entry could be cleared; \
                     it will be requeued on the next start"
                );
            }
            Err(err) => {
                tracing::error!(job_id = %job_id, error = %err, "failed to clear processing entry");
            }
        }
    }
    tracing::debug!(server = %server, queue = %queue, "completion drain stopped");
}
