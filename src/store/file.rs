use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::memory::MemoryJobStore;
use super::{EventLog, JobStore};
use crate::error::StoreError;
use crate::state_machine::{Job, JobEvent, JobFields, JobStatus};

/// Job store persisted as a JSON snapshot, rewritten atomically after every
/// mutation. A mutation whose snapshot write fails is undone in memory.
pub struct FileJobStore {
    path: PathBuf,
    inner: MemoryJobStore,
    // Held across each mutation and its snapshot write.
    flush: Mutex<()>,
}

impl FileJobStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let jobs: Vec<Job> = match tokio::fs::read_to_string(&path).await {
            Ok(text) if !text.trim().is_empty() => serde_json::from_str(&text)?,
            Ok(_) => Vec::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), jobs = jobs.len(), "Loaded job snapshot");
        Ok(Self {
            path,
            inner: MemoryJobStore::from_jobs(jobs),
            flush: Mutex::new(()),
        })
    }

    /// Write the snapshot after a mutation of `key`. On failure `key` is put
    /// back to `previous`, so memory never holds a change the file lacks.
    /// Callers hold `flush` across the mutation and this call.
    async fn persist(&self, key: &str, previous: Option<Job>) -> Result<(), StoreError> {
        let jobs = self.inner.snapshot().await;
        let written = match serde_json::to_vec_pretty(&jobs) {
            Ok(body) => write_atomic(&self.path, &body).await.map_err(StoreError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = written {
            tracing::warn!(path = %self.path.display(), job = %key, error = %e, "Snapshot write failed, change rolled back");
            self.inner.restore(key, previous).await;
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn get(&self, key: &str) -> Result<Option<Job>, StoreError> {
        self.inner.get(key).await
    }

    async fn list(&self) -> Result<Vec<Job>, StoreError> {
        self.inner.list().await
    }

    async fn find_by_base(&self, base: &str) -> Result<Vec<Job>, StoreError> {
        self.inner.find_by_base(base).await
    }

    async fn insert_if_absent(&self, job: Job) -> Result<bool, StoreError> {
        let _flush = self.flush.lock().await;
        let key = job.key.clone();
        let inserted = self.inner.insert_if_absent(job).await?;
        if inserted {
            self.persist(&key, None).await?;
        }
        Ok(inserted)
    }

    async fn update_if_status_in(
        &self,
        key: &str,
        from: &[JobStatus],
        to: JobStatus,
        fields: &JobFields,
    ) -> Result<u64, StoreError> {
        let _flush = self.flush.lock().await;
        let previous = self.inner.get(key).await?;
        let rows = self.inner.update_if_status_in(key, from, to, fields).await?;
        if rows > 0 {
            self.persist(key, previous).await?;
        }
        Ok(rows)
    }

    async fn set_pallet(&self, key: &str, pallet: &str) -> Result<u64, StoreError> {
        let _flush = self.flush.lock().await;
        let previous = self.inner.get(key).await?;
        let rows = self.inner.set_pallet(key, pallet).await?;
        if rows > 0 {
            self.persist(key, previous).await?;
        }
        Ok(rows)
    }
}

/// Event log stored as one JSON object per line; only ever appended to.
pub struct JsonlEventLog {
    path: PathBuf,
    write: Mutex<()>,
}

impl JsonlEventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: Mutex::new(()),
        }
    }
}

#[async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, event: JobEvent) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        let _guard = self.write.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn for_job(&self, key: &str) -> Result<Vec<JobEvent>, StoreError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut events = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<JobEvent>(line) {
                Ok(event) if event.job_key == key => events.push(event),
                Ok(_) => {}
                Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "Skipping unreadable event line"),
            }
        }
        Ok(events)
    }
}

/// Write `body` next to `path` under a temporary name, then rename it into place.
pub async fn write_atomic(path: &Path, body: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, body).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{Trigger, advance};
    use tempfile::TempDir;

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.json");

        let store = FileJobStore::open(&path).await.unwrap();
        store.insert_if_absent(Job::new("A", "part1")).await.unwrap();
        store
            .update_if_status_in(
                "a/part1",
                &[JobStatus::Pending],
                JobStatus::Staged,
                &JobFields {
                    assign_machine: Some(4),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let reopened = FileJobStore::open(&path).await.unwrap();
        let job = reopened.get("a/part1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Staged);
        assert_eq!(job.machine_id, Some(4));
    }

    #[tokio::test]
    async fn failed_snapshot_write_leaves_no_unlogged_transition() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.json");
        let store = FileJobStore::open(&path).await.unwrap();
        store.insert_if_absent(Job::new("A", "part1")).await.unwrap();
        let events = crate::store::MemoryEventLog::new();

        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        let first = advance(
            &store,
            &events,
            "a/part1",
            Trigger::CutStatus,
            JobFields::default(),
            serde_json::json!({}),
        )
        .await;
        assert!(first.is_err());
        assert_eq!(store.get("a/part1").await.unwrap().unwrap().status, JobStatus::Pending);
        assert!(store.insert_if_absent(Job::new("B", "part2")).await.is_err());
        assert!(store.get("b/part2").await.unwrap().is_none());

        std::fs::remove_dir(&path).unwrap();
        let retry = advance(
            &store,
            &events,
            "a/part1",
            Trigger::CutStatus,
            JobFields::default(),
            serde_json::json!({}),
        )
        .await
        .unwrap();
        assert!(retry.is_advanced());
        assert_eq!(events.all().await.len(), 1);

        let reopened = FileJobStore::open(&path).await.unwrap();
        assert_eq!(reopened.get("a/part1").await.unwrap().unwrap().status, JobStatus::CncFinish);
    }

    #[tokio::test]
    async fn missing_snapshot_opens_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileJobStore::open(dir.path().join("none.json")).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn jsonl_log_appends_and_filters() {
        let dir = TempDir::new().unwrap();
        let log = JsonlEventLog::new(dir.path().join("events").join("events.jsonl"));
        log.append(JobEvent::new("a/part1", "created", serde_json::json!({"n": 1}), None))
            .await
            .unwrap();
        log.append(JobEvent::new("a/part1", "staged", serde_json::json!({}), Some(1)))
            .await
            .unwrap();
        log.append(JobEvent::new("b/part2", "created", serde_json::json!({}), None))
            .await
            .unwrap();

        let events = log.for_job("a/part1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "created");
        assert_eq!(events[1].machine_id, Some(1));
    }

    #[tokio::test]
    async fn write_atomic_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("out.csv");
        write_atomic(&target, b"a,b\n").await.unwrap();
        write_atomic(&target, b"c,d\n").await.unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "c,d\n");
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }
}
