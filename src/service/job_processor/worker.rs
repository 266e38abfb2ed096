use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tracing::Instrument;

use super::queue::{JobQueue, QueuedJob};
use crate::domain::models::{CompanyRecord, JobResult};
use crate::error::{AppError, Result};
use crate::repository::CompanyStore;
use crate::service::discovery::PageDiscovery;
use crate::service::gemini::GuardedInsight;

pub(crate) type SharedReceiver = Arc<Mutex<mpsc::UnboundedReceiver<QueuedJob>>>;

/// Everything a worker needs to carry one job from discovery to a stored record.
#[derive(Clone)]
pub struct JobWorker {
    pub(crate) queue: Arc<JobQueue>,
    pub(crate) discovery: PageDiscovery,
    pub(crate) insight: GuardedInsight,
    pub(crate) store: Arc<dyn CompanyStore>,
    pub(crate) budget: Duration,
}

impl JobWorker {
    /// Drain the shared queue until it is closed.
    pub(crate) async fn run(self, worker_id: usize, receiver: SharedReceiver) {
        log::debug!("[JOB] Worker {} started", worker_id);

        loop {
            let next = {
                let mut rx = receiver.lock().await;
                rx.recv().await
            };
            let Some(job) = next else {
                break;
            };

            if job.batch.is_cancelled() || !self.queue.is_current(&job.id) {
                log::debug!("[JOB] Worker {} skipping stale job {}", worker_id, job.id);
                continue;
            }

            let batch = job.batch.clone();
            let work = AssertUnwindSafe(
                self.process(&job)
                    .instrument(tracing::info_span!("job", id = %job.id)),
            )
            .catch_unwind();
            tokio::select! {
                _ = batch.cancelled() => {
                    log::info!("[JOB] Job {} abandoned, its batch was replaced", job.id);
                }
                outcome = work => {
                    if let Err(panic) = outcome {
                        let reason = panic_message(&*panic);
                        log::error!("[JOB] Worker {} panicked on {}: {}", worker_id, job.id, reason);
                        self.queue.fail(&job.id, format!("worker panicked: {}", reason));
                    }
                }
            }
        }

        log::debug!("[JOB] Worker {} stopped", worker_id);
    }

    async fn process(&self, job: &QueuedJob) {
        let timer = Instant::now();
        log::info!(
            "[JOB] Starting {} for {} ({})",
            job.id,
            job.item.company_name,
            job.item.website_url
        );

        match self.execute(job).await {
            Ok(result) => {
                let urls = result.url_count;
                if self.queue.complete(&job.id, result) {
                    log::info!(
                        "[JOB] {} complete: {} urls in {}ms",
                        job.id,
                        urls,
                        timer.elapsed().as_millis()
                    );
                }
            }
            Err(e) => {
                log::warn!("[JOB] {} failed: {}", job.id, e);
                self.queue.fail(&job.id, e.to_string());
            }
        }
    }

    async fn execute(&self, job: &QueuedJob) -> Result<JobResult> {
        let item = &job.item;

        let outcome = self
            .discovery
            .discover_within(&item.website_url, self.budget)
            .await?;
        if outcome.degraded {
            log::warn!(
                "[JOB] {} discovery degraded (budget exhausted: {})",
                job.id,
                outcome.budget_exhausted
            );
        }

        let insight = self
            .insight
            .generate(&item.company_name, &outcome.urls)
            .await?;

        let record = CompanyRecord::new(
            item.company_name.clone(),
            item.website_url.clone(),
            outcome.urls,
            insight,
        );

        // The batch may have been reset while this job was running. The permit
        // keeps a reset from deleting records until this write has landed.
        let permit = self.queue.store_write_permit().await;
        if !self.queue.is_current(&job.id) {
            return Err(AppError::JobNotFound(job.id.clone()));
        }
        self.store
            .upsert(&record)
            .await
            .map_err(|e| AppError::database(format!("{:#}", e)))?;
        drop(permit);

        Ok(JobResult {
            url_count: record.discovered_urls.len(),
            truncated: outcome.truncated,
            degraded: outcome.degraded,
            source: outcome.source,
            record,
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
