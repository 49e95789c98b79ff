use std::{any::type_name_of_val, fmt, sync::Arc, time::Duration};

use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use crate::error::Result;

use super::{
    config::QueueConfig, dispatcher::JobDispatcher, queue::QueueService,
};

const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Bounded pool of workers pulling from the analysis queue. Each worker owns
/// one job at a time.
pub struct WorkerPool {
    config: QueueConfig,
    queue: Arc<dyn QueueService>,
    dispatcher: Arc<dyn JobDispatcher>,
    shutdown_token: CancellationToken,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let worker_handle_count = self
            .worker_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field(
                "dispatcher_type",
                &type_name_of_val(self.dispatcher.as_ref()),
            )
            .field("worker_handle_count", &worker_handle_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(
        config: QueueConfig,
        queue: Arc<dyn QueueService>,
        dispatcher: Arc<dyn JobDispatcher>,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            config,
            queue,
            dispatcher,
            shutdown_token,
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    pub async fn is_running(&self) -> bool {
        !self.shutdown_token.is_cancelled()
            && !self.worker_handles.lock().await.is_empty()
    }

    /// Spawns `worker_count` workers. Calling it again while running is a
    /// no-op.
    pub async fn start(&self) -> Result<()> {
        let mut handles = self.worker_handles.lock().await;
        if !handles.is_empty() || self.shutdown_token.is_cancelled() {
            return Ok(());
        }

        let worker_count = self.config.worker_count.max(1);
        let poll_interval = self.config.poll_interval();
        let group = std::process::id();

        for i in 0..worker_count {
            let worker_id = format!("analysis-{group}-w{i}");
            let queue = Arc::clone(&self.queue);
            let dispatcher = Arc::clone(&self.dispatcher);
            let shutdown = self.shutdown_token.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    if shutdown.is_cancelled() {
                        info!(
                            target: "analysis::dispatch",
                            worker = %worker_id,
                            "worker shutting down"
                        );
                        break;
                    }

                    match dispatcher.dispatch_next().await {
                        Ok(Some(status)) => {
                            trace!(
                                target: "analysis::dispatch",
                                worker = %worker_id,
                                job = %status.job_id(),
                                status = ?status,
                                "worker finished job"
                            );
                        }
                        Ok(None) => {
                            tokio::select! {
                                _ = shutdown.cancelled() => {}
                                _ = queue.wait_for_work() => {}
                                _ = tokio::time::sleep(poll_interval) => {}
                            }
                        }
                        Err(err) => {
                            warn!(
                                target: "analysis::dispatch",
                                worker = %worker_id,
                                error = %err,
                                "dequeue failed; backing off"
                            );
                            tokio::select! {
                                _ = shutdown.cancelled() => {}
                                _ = tokio::time::sleep(poll_interval) => {}
                            }
                        }
                    }
                }
            }));
        }

        info!(
            target: "analysis::dispatch",
            workers = worker_count,
            "worker pool started"
        );
        Ok(())
    }

    /// Cancels every worker (and the jobs they own) and waits for them.
    pub async fn shutdown(&self) -> Result<()> {
        info!(target: "analysis::dispatch", "shutting down worker pool");
        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        for handle in handles {
            match tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Worker task failed: {:?}", e),
                Err(_) => warn!("Worker task timed out during shutdown"),
            }
        }
        Ok(())
    }
}
