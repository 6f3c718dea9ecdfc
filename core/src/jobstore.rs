use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::job::{JobError, JobId, ScheduledJob, SturdyRef};
use crate::store::{ns, Kv, KvSerde};

/// What a finished (or abandoned) periodic run leaves behind in its record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    /// Failure summary; `None` records a success and clears `previous_error`.
    pub error: Option<JobError>,
    /// Whether `retries` goes back to zero.
    pub reset_retries: bool,
}

impl RunRecord {
    /// Successful run.
    pub fn success(reset_retries: bool) -> Self {
        Self { error: None, reset_retries }
    }

    /// Terminal failure. Always resets the retry counter.
    pub fn failure(error: JobError) -> Self {
        Self { error: Some(error), reset_retries: true }
    }
}

/// Durable storage for job records. Every mutation is a point update keyed by id.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Create a one-shot record and return its id.
    async fn create_one_shot_job(
        &self,
        grain_id: &str,
        name: &str,
        callback: SturdyRef,
        when_ms: u64,
        slack_ms: u64,
        now_ms: u64,
    ) -> Result<JobId, StoreError>;

    /// Create a periodic record and return its id.
    async fn create_periodic_job(
        &self,
        grain_id: &str,
        name: &str,
        callback: SturdyRef,
        period_ms: u64,
        now_ms: u64,
    ) -> Result<JobId, StoreError>;

    /// Coarse pre-filter: jobs whose due time has passed, minus runs that
    /// heartbeated at or after `stale_before_ms`.
    async fn query_ready_jobs(
        &self,
        now_ms: u64,
        stale_before_ms: u64,
    ) -> Result<Vec<ScheduledJob>, StoreError>;

    /// Bump `retries` and return the new value.
    async fn increment_retries(&self, id: &JobId) -> Result<u32, StoreError>;

    /// Count a dropped connection and mark the job as owing a retry. With
    /// `release`, the keep-alive is cleared too, so the next sweep retries at
    /// once instead of waiting for it to go stale. Returns the new count.
    async fn record_disconnect(&self, id: &JobId, release: bool) -> Result<u32, StoreError>;

    /// Record a heartbeat from the running job's grain. Resets `retries`.
    async fn update_keep_alive(&self, id: &JobId, at_ms: u64) -> Result<(), StoreError>;

    /// Mark a run as dispatched so a crash mid-run shows up as a stale keep-alive.
    async fn mark_started(&self, id: &JobId, at_ms: u64) -> Result<(), StoreError>;

    /// Close out a run of a job that keeps its record: advance the period,
    /// store or clear `previous_error`, drop the keep-alive and any pending retry.
    async fn record_outcome(&self, id: &JobId, record: RunRecord) -> Result<(), StoreError>;

    /// Remove a record. Returns `false` if it was already gone.
    async fn delete_job(&self, id: &JobId) -> Result<bool, StoreError>;

    /// Fetch one record.
    async fn get_job(&self, id: &JobId) -> Result<Option<ScheduledJob>, StoreError>;

    /// All records, in creation order.
    async fn list_jobs(&self) -> Result<Vec<ScheduledJob>, StoreError>;
}

/// [`JobStore`] over any [`Kv`]: a registry of ids at `jobs:registry` plus one
/// bincode record per job at `jobs:<id>`.
pub struct KvJobStore<K: Kv> {
    kv: K,
    // Serializes read-modify-write cycles so concurrent point updates never interleave.
    write: Mutex<()>,
}

impl<K: Kv> KvJobStore<K> {
    /// Wrap `kv`.
    pub fn new(kv: K) -> Self {
        Self { kv, write: Mutex::new(()) }
    }

    fn registry_key() -> Vec<u8> {
        ns("jobs", "registry")
    }

    fn record_key(id: &JobId) -> Vec<u8> {
        ns("jobs", &id.0)
    }

    fn registry(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.kv.get_t(&Self::registry_key())?.unwrap_or_default())
    }

    fn load(&self, id: &JobId) -> Result<Option<ScheduledJob>, StoreError> {
        Ok(self.kv.get_t(&Self::record_key(id))?)
    }

    fn load_all(&self) -> Result<Vec<ScheduledJob>, StoreError> {
        let mut out = Vec::new();
        for id in self.registry()? {
            if let Some(job) = self.load(&JobId(id))? {
                out.push(job);
            }
        }
        Ok(out)
    }

    async fn insert(&self, job: ScheduledJob) -> Result<JobId, StoreError> {
        let _guard = self.write.lock().await;
        self.kv.put_t(&Self::record_key(&job.id), &job)?;
        let mut ids = self.registry()?;
        ids.push(job.id.0.clone());
        self.kv.put_t(&Self::registry_key(), &ids)?;
        Ok(job.id)
    }

    async fn update<F>(&self, id: &JobId, f: F) -> Result<ScheduledJob, StoreError>
    where
        F: FnOnce(&mut ScheduledJob) + Send,
    {
        let _guard = self.write.lock().await;
        let mut job = self.load(id)?.ok_or_else(|| StoreError::NotFound(id.clone()))?;
        f(&mut job);
        self.kv.put_t(&Self::record_key(id), &job)?;
        Ok(job)
    }
}

fn new_id() -> JobId {
    JobId(Uuid::new_v4().simple().to_string())
}

#[async_trait]
impl<K: Kv> JobStore for KvJobStore<K> {
    async fn create_one_shot_job(
        &self,
        grain_id: &str,
        name: &str,
        callback: SturdyRef,
        when_ms: u64,
        slack_ms: u64,
        now_ms: u64,
    ) -> Result<JobId, StoreError> {
        let job = ScheduledJob::one_shot(
            new_id(),
            grain_id.to_string(),
            name.to_string(),
            callback,
            when_ms,
            slack_ms,
            now_ms,
        );
        self.insert(job).await
    }

    async fn create_periodic_job(
        &self,
        grain_id: &str,
        name: &str,
        callback: SturdyRef,
        period_ms: u64,
        now_ms: u64,
    ) -> Result<JobId, StoreError> {
        let job = ScheduledJob::periodic(
            new_id(),
            grain_id.to_string(),
            name.to_string(),
            callback,
            period_ms,
            now_ms,
        );
        self.insert(job).await
    }

    async fn query_ready_jobs(
        &self,
        now_ms: u64,
        stale_before_ms: u64,
    ) -> Result<Vec<ScheduledJob>, StoreError> {
        let jobs = self.load_all()?;
        Ok(jobs
            .into_iter()
            .filter(|j| j.due_at_ms() <= now_ms)
            .filter(|j| !matches!(j.last_keep_alive_ms, Some(k) if k >= stale_before_ms))
            .collect())
    }

    async fn increment_retries(&self, id: &JobId) -> Result<u32, StoreError> {
        let job = self
            .update(id, |j| j.retries = j.retries.saturating_add(1))
            .await?;
        Ok(job.retries)
    }

    async fn record_disconnect(&self, id: &JobId, release: bool) -> Result<u32, StoreError> {
        let job = self
            .update(id, |j| {
                j.retries = j.retries.saturating_add(1);
                j.retry_pending = true;
                if release {
                    j.last_keep_alive_ms = None;
                }
            })
            .await?;
        Ok(job.retries)
    }

    async fn update_keep_alive(&self, id: &JobId, at_ms: u64) -> Result<(), StoreError> {
        self.update(id, |j| {
            j.last_keep_alive_ms = Some(at_ms);
            j.retries = 0;
        })
        .await?;
        Ok(())
    }

    async fn mark_started(&self, id: &JobId, at_ms: u64) -> Result<(), StoreError> {
        self.update(id, |j| j.last_keep_alive_ms = Some(at_ms)).await?;
        Ok(())
    }

    async fn record_outcome(&self, id: &JobId, record: RunRecord) -> Result<(), StoreError> {
        self.update(id, |j| {
            if let Some(period) = j.period_ms() {
                j.next_period_start_ms = Some(j.due_at_ms().saturating_add(period));
            }
            j.previous_error = record.error;
            j.last_keep_alive_ms = None;
            j.retry_pending = false;
            if record.reset_retries {
                j.retries = 0;
            }
        })
        .await?;
        Ok(())
    }

    async fn delete_job(&self, id: &JobId) -> Result<bool, StoreError> {
        let _guard = self.write.lock().await;
        let mut ids = self.registry()?;
        let before = ids.len();
        ids.retain(|i| i != &id.0);
        if ids.len() != before {
            self.kv.put_t(&Self::registry_key(), &ids)?;
        }
        Ok(self.kv.delete(&Self::record_key(id)))
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<ScheduledJob>, StoreError> {
        self.load(id)
    }

    async fn list_jobs(&self) -> Result<Vec<ScheduledJob>, StoreError> {
        self.load_all()
    }
}
