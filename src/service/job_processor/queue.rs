use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use dashmap::DashMap;
use tokio::sync::{mpsc, Notify, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;

use crate::domain::models::{BatchItem, CompanyRecord, Job, JobResult, JobStatus};
use crate::error::{AppError, Result};

/// A job handed to the worker pool.
///
/// `batch` is cancelled when the batch the job belongs to is replaced or reset,
/// so stale work is skipped or abandoned.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: String,
    pub item: BatchItem,
    pub batch: CancellationToken,
}

/// In-memory job table plus the channel feeding the workers.
pub struct JobQueue {
    jobs: DashMap<String, Job>,
    sender: Mutex<Option<mpsc::UnboundedSender<QueuedJob>>>,
    batch: Mutex<CancellationToken>,
    idle: Notify,
    /// Shared by workers while they persist a record, exclusive during reset.
    store_writes: RwLock<()>,
}

impl JobQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<QueuedJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            jobs: DashMap::new(),
            sender: Mutex::new(Some(tx)),
            batch: Mutex::new(CancellationToken::new()),
            idle: Notify::new(),
            store_writes: RwLock::new(()),
        };
        (queue, rx)
    }

    /// Replace the job table with the unique, non-blank items of `items`.
    pub fn submit_batch(&self, items: &[BatchItem]) -> Result<Vec<String>> {
        let sender = lock(&self.sender).clone().ok_or_else(|| {
            AppError::Other(anyhow::anyhow!("job queue has been shut down"))
        })?;
        let batch = self.start_new_batch();

        let mut seen = HashSet::with_capacity(items.len());
        let mut ids = Vec::with_capacity(items.len());

        for item in items {
            if item.is_blank() {
                log::warn!("[JOB] Skipping blank batch item {:?}", item);
                continue;
            }
            if !seen.insert(item.dedup_key()) {
                log::debug!(
                    "[JOB] Dropping duplicate {} ({})",
                    item.company_name,
                    item.website_url
                );
                continue;
            }

            let job = Job::queued(item);
            let message = QueuedJob {
                id: job.id.clone(),
                item: BatchItem::new(job.company_name.clone(), job.website_url.clone()),
                batch: batch.clone(),
            };
            ids.push(job.id.clone());
            self.jobs.insert(job.id.clone(), job);

            if sender.send(message).is_err() {
                return Err(AppError::Other(anyhow::anyhow!("job workers have stopped")));
            }
        }

        log::info!(
            "[JOB] Accepted {} of {} batch items",
            ids.len(),
            items.len()
        );
        self.idle.notify_waiters();
        Ok(ids)
    }

    pub fn status(&self, job_id: &str) -> Result<Job> {
        self.jobs
            .get(job_id)
            .map(|job| job.clone())
            .ok_or_else(|| AppError::JobNotFound(job_id.to_string()))
    }

    pub fn all_statuses(&self) -> HashMap<String, JobStatus> {
        self.jobs
            .iter()
            .map(|entry| (entry.key().clone(), entry.status))
            .collect()
    }

    /// Records of completed jobs, one per normalized company name, keeping the
    /// most recently completed job.
    pub fn collect_completed(&self) -> Vec<CompanyRecord> {
        let mut latest: HashMap<String, (chrono::DateTime<chrono::Utc>, CompanyRecord)> =
            HashMap::new();

        for entry in self.jobs.iter() {
            let (Some(result), Some(completed_at)) = (&entry.result, entry.completed_at) else {
                continue;
            };
            let key = result.record.normalized_name();
            match latest.get(&key) {
                Some((seen_at, _)) if *seen_at >= completed_at => {}
                _ => {
                    latest.insert(key, (completed_at, result.record.clone()));
                }
            }
        }

        let mut records: Vec<CompanyRecord> = latest.into_values().map(|(_, r)| r).collect();
        records.sort_by(|a, b| a.company_name.cmp(&b.company_name));
        records
    }

    /// Queued -> Complete. A job that is gone or already terminal is left alone.
    pub fn complete(&self, job_id: &str, result: JobResult) -> bool {
        let changed = self
            .jobs
            .get_mut(job_id)
            .map(|mut job| job.complete(result))
            .unwrap_or(false);
        self.idle.notify_waiters();
        changed
    }

    /// Queued -> Error. A job that is gone or already terminal is left alone.
    pub fn fail(&self, job_id: &str, message: impl Into<String>) -> bool {
        let changed = self
            .jobs
            .get_mut(job_id)
            .map(|mut job| job.fail(message))
            .unwrap_or(false);
        self.idle.notify_waiters();
        changed
    }

    pub fn is_current(&self, job_id: &str) -> bool {
        self.jobs.contains_key(job_id)
    }

    /// Held by a worker from its `is_current` check until its upsert returns.
    pub(crate) async fn store_write_permit(&self) -> RwLockReadGuard<'_, ()> {
        self.store_writes.read().await
    }

    /// Waits for in-flight record writes and blocks new ones while held.
    pub(crate) async fn exclusive_store_access(&self) -> RwLockWriteGuard<'_, ()> {
        self.store_writes.write().await
    }

    /// Cancel the running batch and drop every job.
    pub fn clear(&self) {
        self.start_new_batch();
        self.idle.notify_waiters();
    }

    pub fn has_queued(&self) -> bool {
        self.jobs.iter().any(|job| job.status == JobStatus::Queued)
    }

    /// Resolves once no job in the table is still queued.
    pub async fn wait_until_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.has_queued() {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting work. Workers exit once the channel is drained.
    pub fn close(&self) {
        lock(&self.sender).take();
    }

    fn start_new_batch(&self) -> CancellationToken {
        let fresh = CancellationToken::new();
        let previous = std::mem::replace(&mut *lock(&self.batch), fresh.clone());
        previous.cancel();
        self.jobs.clear();
        fresh
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::DiscoverySource;
    use std::time::Duration;

    fn item(name: &str, site: &str) -> BatchItem {
        BatchItem::new(name, site)
    }

    fn result_for(name: &str, insight: &str) -> JobResult {
        JobResult {
            record: CompanyRecord::new(name, "https://example.test", vec![], insight),
            url_count: 0,
            truncated: false,
            degraded: false,
            source: DiscoverySource::Nothing,
        }
    }

    #[test]
    fn test_submit_batch_dedups_and_skips_blank() {
        let (queue, mut rx) = JobQueue::new();
        let ids = queue
            .submit_batch(&[
                item("Acme", "https://acme.test"),
                item("  ACME ", "http://www.acme.test/"),
                item("", "https://blank.test"),
                item("Globex", "  "),
                item("Globex", "https://globex.test"),
            ])
            .unwrap();

        assert_eq!(ids.len(), 2);
        assert_eq!(queue.all_statuses().len(), 2);
        assert!(queue
            .all_statuses()
            .values()
            .all(|s| *s == JobStatus::Queued));

        let first = rx.try_recv().unwrap();
        assert_eq!(first.id, ids[0]);
        assert_eq!(first.item.company_name, "Acme");
    }

    #[test]
    fn test_new_batch_replaces_previous_and_cancels_it() {
        let (queue, mut rx) = JobQueue::new();
        let old = queue.submit_batch(&[item("Acme", "acme.test")]).unwrap();
        let old_msg = rx.try_recv().unwrap();

        let new = queue.submit_batch(&[item("Globex", "globex.test")]).unwrap();

        assert!(old_msg.batch.is_cancelled());
        assert!(matches!(queue.status(&old[0]), Err(AppError::JobNotFound(_))));
        assert_eq!(queue.status(&new[0]).unwrap().company_name, "Globex");
        assert!(!queue.complete(&old[0], result_for("Acme", "late")));
    }

    #[test]
    fn test_transition_is_final() {
        let (queue, _rx) = JobQueue::new();
        let ids = queue.submit_batch(&[item("Acme", "acme.test")]).unwrap();

        assert!(queue.fail(&ids[0], "boom"));
        assert!(!queue.complete(&ids[0], result_for("Acme", "late")));

        let job = queue.status(&ids[0]).unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error_message.as_deref(), Some("boom"));
        assert!(job.result.is_none());
    }

    #[test]
    fn test_collect_completed_keeps_latest_per_company() {
        let (queue, _rx) = JobQueue::new();
        let ids = queue
            .submit_batch(&[
                item("Acme", "acme.test"),
                item("acme", "acme.example"),
                item("Globex", "globex.test"),
                item("Initech", "initech.test"),
            ])
            .unwrap();

        queue.complete(&ids[0], result_for("Acme", "first"));
        std::thread::sleep(Duration::from_millis(5));
        queue.complete(&ids[1], result_for("acme", "second"));
        queue.complete(&ids[2], result_for("Globex", "globex"));
        queue.fail(&ids[3], "unreachable");

        let records = queue.collect_completed();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].company_name, "Globex");
        assert_eq!(records[1].insight_text, "second");

        // Reading does not consume
        assert_eq!(queue.collect_completed().len(), 2);
    }

    #[tokio::test]
    async fn test_wait_until_idle_wakes_on_last_transition() {
        let (queue, _rx) = JobQueue::new();
        let queue = std::sync::Arc::new(queue);
        let ids = queue
            .submit_batch(&[item("Acme", "acme.test"), item("Globex", "globex.test")])
            .unwrap();

        let finisher = {
            let queue = queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                queue.fail(&ids[0], "x");
                tokio::time::sleep(Duration::from_millis(20)).await;
                queue.complete(&ids[1], result_for("Globex", "ok"));
            })
        };

        tokio::time::timeout(Duration::from_secs(2), queue.wait_until_idle())
            .await
            .expect("queue never went idle");
        assert!(!queue.has_queued());
        finisher.await.unwrap();
    }

    #[test]
    fn test_closed_queue_rejects_batches() {
        let (queue, _rx) = JobQueue::new();
        queue.close();
        assert!(queue.submit_batch(&[item("Acme", "acme.test")]).is_err());
    }
}
