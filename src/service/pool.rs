use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{CheckpointReport, ContinuityService};
use crate::config::WorkerConfig;
use crate::error::{AppError, AppResult};
use crate::state::SessionState;

struct Job {
    state: SessionState,
    respond: oneshot::Sender<CheckpointReport>,
}

/// Fixed set of workers draining a bounded checkpoint queue.
///
/// Submitters wait for queue space, so a burst of checkpoints applies
/// backpressure instead of spawning unbounded work.
pub struct CheckpointPool {
    tx: Option<mpsc::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl CheckpointPool {
    /// Start `config.worker_count` workers over `service`.
    pub fn new(service: Arc<ContinuityService>, config: &WorkerConfig) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..config.worker_count.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    loop {
                        // The lock is held only while waiting for the next job.
                        let job = rx.lock().await.recv().await;
                        let Some(job) = job else {
                            break;
                        };
                        debug!(worker, session_id = %job.state.session_id, "Checkpoint picked up");
                        let report = service.checkpoint(&job.state).await;
                        if job.respond.send(report).is_err() {
                            debug!(worker, "Checkpoint submitter went away");
                        }
                    }
                    debug!(worker, "Checkpoint worker stopped");
                })
            })
            .collect::<Vec<_>>();

        info!(
            workers = workers.len(),
            queue_capacity = config.queue_capacity,
            "Checkpoint pool started"
        );

        Self {
            tx: Some(tx),
            workers,
        }
    }

    /// Number of worker tasks.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue a checkpoint and wait for its report.
    ///
    /// # Errors
    /// Returns an internal error if the pool is shut down or the worker
    /// handling the job panicked.
    pub async fn submit(&self, state: SessionState) -> AppResult<CheckpointReport> {
        let tx = self.tx.as_ref().ok_or_else(|| AppError::Internal {
            message: "checkpoint pool is shut down".to_string(),
        })?;

        let (respond, response) = oneshot::channel();
        tx.send(Job { state, respond })
            .await
            .map_err(|_| AppError::Internal {
                message: "checkpoint queue closed".to_string(),
            })?;

        response.await.map_err(|_| AppError::Internal {
            message: "checkpoint worker dropped the job".to_string(),
        })
    }

    /// Stop accepting work, finish queued jobs and join the workers.
    pub async fn shutdown(mut self) {
        self.tx.take();
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Checkpoint worker failed");
            }
        }
        info!("Checkpoint pool stopped");
    }
}
