//! Batch job pipeline: dedup on ingestion, a fixed pool of workers draining an
//! unbounded queue, and an in-memory status table.

mod queue;
mod worker;

pub use queue::{JobQueue, QueuedJob};
pub use worker::JobWorker;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::domain::models::{BatchItem, CompanyRecord, Job, JobStatus};
use crate::error::{AppError, Result};
use crate::repository::CompanyStore;
use crate::service::discovery::PageDiscovery;
use crate::service::gemini::GuardedInsight;

pub struct JobProcessor {
    queue: Arc<JobQueue>,
    store: Arc<dyn CompanyStore>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobProcessor {
    /// Build the pipeline and spawn `worker_count` workers on the current runtime.
    pub fn start(
        discovery: PageDiscovery,
        insight: GuardedInsight,
        store: Arc<dyn CompanyStore>,
        worker_count: usize,
        budget: Duration,
    ) -> Self {
        let (queue, receiver) = JobQueue::new();
        let queue = Arc::new(queue);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let worker = JobWorker {
            queue: queue.clone(),
            discovery,
            insight,
            store: store.clone(),
            budget,
        };

        let worker_count = worker_count.max(1);
        let workers = (0..worker_count)
            .map(|id| tokio::spawn(worker.clone().run(id, receiver.clone())))
            .collect();

        log::info!("[JOB] Pipeline started with {} workers", worker_count);

        Self {
            queue,
            store,
            workers: Mutex::new(workers),
        }
    }

    /// Replace the current batch. Returns the ids of the accepted jobs.
    pub fn submit_batch(&self, items: &[BatchItem]) -> Result<Vec<String>> {
        self.queue.submit_batch(items)
    }

    pub fn status(&self, job_id: &str) -> Result<Job> {
        self.queue.status(job_id)
    }

    pub fn all_statuses(&self) -> HashMap<String, JobStatus> {
        self.queue.all_statuses()
    }

    pub fn collect_completed(&self) -> Vec<CompanyRecord> {
        self.queue.collect_completed()
    }

    /// Drop all jobs and truncate the persisted store.
    ///
    /// A worker already writing its record finishes first; every later write
    /// sees the cleared table and is refused.
    pub async fn reset(&self) -> Result<()> {
        let _writes = self.queue.exclusive_store_access().await;
        self.queue.clear();
        let deleted = self
            .store
            .delete_all()
            .await
            .map_err(|e| AppError::database(format!("{:#}", e)))?;
        log::info!("[JOB] Reset: job table cleared, {} records deleted", deleted);
        Ok(())
    }

    pub async fn wait_until_idle(&self) {
        self.queue.wait_until_idle().await
    }

    /// Close the queue and wait for the workers to drain it.
    pub async fn shutdown(&self) {
        self.queue.close();
        let handles = {
            let mut workers = match self.workers.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *workers)
        };

        for handle in handles {
            if let Err(e) = handle.await {
                log::error!("[JOB] Worker panicked: {}", e);
            }
        }
        log::info!("[JOB] Pipeline stopped");
    }
}
