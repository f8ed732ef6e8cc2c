//! One worker loop per agent id, sharing a shutdown flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::WorkerConfig;
use crate::queue::JobQueue;
use crate::tasks::TaskFactory;
use crate::worker::worker::Worker;

/// Independent per-agent workers over one queue.
pub struct WorkerPool {
    workers: Vec<(String, JoinHandle<()>)>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawn a worker for each agent id. Duplicate ids share nothing but the
    /// name, so callers should pass distinct ids.
    pub fn start(
        agent_ids: &[String],
        queue: Arc<dyn JobQueue>,
        factory: Arc<TaskFactory>,
        config: WorkerConfig,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let workers = agent_ids
            .iter()
            .map(|agent_id| {
                let worker = Worker::new(
                    agent_id.clone(),
                    Arc::clone(&queue),
                    Arc::clone(&factory),
                    config.clone(),
                );
                (agent_id.clone(), worker.spawn(Arc::clone(&shutdown)))
            })
            .collect::<Vec<_>>();

        info!(agents = workers.len(), "Worker pool started");
        Self { workers, shutdown }
    }

    pub fn agent_ids(&self) -> Vec<&str> {
        self.workers.iter().map(|(id, _)| id.as_str()).collect()
    }

    /// Number of worker loops still running.
    pub fn running(&self) -> usize {
        self.workers.iter().filter(|(_, h)| !h.is_finished()).count()
    }

    /// Stop polling and wait for every loop to exit. Jobs already running
    /// are finished, not cancelled.
    pub async fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);

        let (ids, handles): (Vec<String>, Vec<JoinHandle<()>>) = self.workers.into_iter().unzip();
        for (agent_id, result) in ids.iter().zip(join_all(handles).await) {
            if let Err(e) = result {
                error!(agent_id = %agent_id, "Worker task panicked: {e}");
            }
        }
        info!("Worker pool stopped");
    }
}
