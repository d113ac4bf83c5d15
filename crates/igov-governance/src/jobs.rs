//! Short-lived preview job store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use igov_core::{PreviewJob, PreviewResult};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Keyed store of previews awaiting execution.
///
/// Jobs are immutable once stored; readers get a shared handle, so a concurrent
/// sweep never invalidates a job that is already being executed.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn put(&self, result: PreviewResult) -> Arc<PreviewJob>;

    /// `None` for unknown ids and for jobs older than the store's TTL.
    async fn get(&self, job_id: &str) -> Option<Arc<PreviewJob>>;

    /// Drops jobs older than `max_age`, returning how many were removed.
    async fn sweep(&self, max_age: Duration) -> usize;
}

pub fn new_job_id(now: DateTime<Utc>) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("{}-{}", now.timestamp_millis(), &random[..8])
}

pub struct MemoryJobStore {
    ttl: Duration,
    clock: Clock,
    jobs: RwLock<HashMap<String, Arc<PreviewJob>>>,
}

impl MemoryJobStore {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, system_clock())
    }

    pub fn with_clock(ttl: Duration, clock: Clock) -> Self {
        Self {
            ttl,
            clock,
            jobs: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn put(&self, result: PreviewResult) -> Arc<PreviewJob> {
        let created_at = (self.clock)();
        let job = {
            let mut jobs = self.jobs.write().await;
            let mut job_id = new_job_id(created_at);
            while jobs.contains_key(&job_id) {
                job_id = new_job_id(created_at);
            }
            let job = Arc::new(PreviewJob {
                job_id: job_id.clone(),
                created_at,
                result,
            });
            jobs.insert(job_id, Arc::clone(&job));
            job
        };
        self.sweep(self.ttl).await;
        job
    }

    async fn get(&self, job_id: &str) -> Option<Arc<PreviewJob>> {
        let now = (self.clock)();
        self.jobs
            .read()
            .await
            .get(job_id)
            .filter(|job| now - job.created_at <= self.ttl)
            .cloned()
    }

    async fn sweep(&self, max_age: Duration) -> usize {
        let now = (self.clock)();
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| now - job.created_at <= max_age);
        let removed = before - jobs.len();
        if removed > 0 {
            debug!(removed, remaining = jobs.len(), "swept expired preview jobs");
        }
        removed
    }
}
