use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{EventLog, JobStore};
use crate::error::StoreError;
use crate::state_machine::{Job, JobEvent, JobFields, JobStatus, normalize_base};

/// In-process job store. Conditional writes are atomic under the write lock.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_jobs(jobs: impl IntoIterator<Item = Job>) -> Self {
        Self {
            jobs: RwLock::new(jobs.into_iter().map(|j| (j.key.clone(), j)).collect()),
        }
    }

    /// Copy of every job, for snapshotting.
    pub async fn snapshot(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.key.cmp(&b.key));
        jobs
    }

    /// Put `key` back to `previous`, removing it when `previous` is `None`.
    pub async fn restore(&self, key: &str, previous: Option<Job>) {
        let mut jobs = self.jobs.write().await;
        match previous {
            Some(job) => jobs.insert(key.to_string(), job),
            None => jobs.remove(key),
        };
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get(&self, key: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.get(key).cloned())
    }

    async fn list(&self) -> Result<Vec<Job>, StoreError> {
        Ok(self.snapshot().await)
    }

    async fn find_by_base(&self, base: &str) -> Result<Vec<Job>, StoreError> {
        let wanted = normalize_base(base);
        let mut found: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.base_key() == wanted)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.key.cmp(&b.key)));
        Ok(found)
    }

    async fn insert_if_absent(&self, job: Job) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.key) {
            return Ok(false);
        }
        jobs.insert(job.key.clone(), job);
        Ok(true)
    }

    async fn update_if_status_in(
        &self,
        key: &str,
        from: &[JobStatus],
        to: JobStatus,
        fields: &JobFields,
    ) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(key) {
            Some(job) if from.contains(&job.status) => {
                job.status = to;
                job.apply(fields);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn set_pallet(&self, key: &str, pallet: &str) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(key) {
            Some(job) => {
                job.pallet = Some(pallet.to_string());
                Ok(1)
            }
            None => Ok(0),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryEventLog {
    events: RwLock<Vec<JobEvent>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<JobEvent> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, event: JobEvent) -> Result<(), StoreError> {
        self.events.write().await.push(event);
        Ok(())
    }

    async fn for_job(&self, key: &str) -> Result<Vec<JobEvent>, StoreError> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|e| e.job_key == key)
            .cloned()
            .collect())
    }
}
