//! File-based handoff of finished jobs to the downstream sorting system.
//!
//! The destination file name is a single-slot mailbox. The engine only writes
//! it while it does not exist; the downstream consumer removes it once read.
//! Writes go to a temporary name and are renamed into place, so the consumer
//! never observes a half-written payload.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::csv_rows::{CsvDocument, Field};
use crate::error::{EngineError, HandoffError};
use crate::staging::PARTS_HEADER;
use crate::state_machine::{Advance, Job, JobFields, Machine, StateMachine, Trigger, advance};
use crate::store::{EventLog, JobStore, write_atomic};

pub const DESTINATION: Field<'static> = Field::new("Destination", 7);
pub const SOURCE_MACHINE: Field<'static> = Field::new("SourceMachine", 8);
pub const PALLET_NAME: Field<'static> = Field::new("PalletName", 12);

/// Suffix a delivered parts list carries until FORWARDED is committed.
pub const SENT_SUFFIX: &str = ".sent";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxOptions {
    pub mailbox_name: String,
    pub poll_interval: Duration,
    pub timeout: Duration,
    /// Constant written into every row's `Destination` column.
    pub destination: String,
}

impl Default for MailboxOptions {
    fn default() -> Self {
        Self {
            mailbox_name: "Nestpick.csv".to_string(),
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(300),
            destination: "99".to_string(),
        }
    }
}

/// A payload that made it into the mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub mailbox: PathBuf,
    pub rows: usize,
    pub malformed: Vec<usize>,
    pub pallet: Option<String>,
    pub waited: Duration,
}

/// Payload built from a parts list, ready for the mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub text: String,
    pub rows: usize,
    pub malformed: Vec<usize>,
    pub pallet: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HandoffChannel {
    opts: MailboxOptions,
}

impl HandoffChannel {
    pub fn new(opts: MailboxOptions) -> Self {
        Self { opts }
    }

    pub fn mailbox_path(&self, handoff_dir: &Path) -> PathBuf {
        handoff_dir.join(&self.opts.mailbox_name)
    }

    /// Rewrite `Destination` and `SourceMachine` on every row of `parts`.
    pub fn build_payload(&self, parts: &str, machine: &Machine) -> Payload {
        let doc = CsvDocument::parse(parts, &PARTS_HEADER);
        let projection = doc.project(&[
            (DESTINATION, self.opts.destination.clone()),
            (SOURCE_MACHINE, machine.id.to_string()),
        ]);
        let pallet = doc
            .rows()
            .find_map(|row| doc.value(row, PALLET_NAME))
            .map(str::to_string);
        Payload {
            text: projection.text,
            rows: projection.rewritten,
            malformed: projection.malformed,
            pallet,
        }
    }

    /// Poll until the mailbox is empty. Fails after the configured timeout or
    /// as soon as `cancel` fires.
    pub async fn wait_for_slot(
        &self,
        mailbox: &Path,
        cancel: &CancellationToken,
    ) -> Result<Duration, HandoffError> {
        let started = Instant::now();
        loop {
            if !tokio::fs::try_exists(mailbox).await? {
                return Ok(started.elapsed());
            }
            let waited = started.elapsed();
            if waited >= self.opts.timeout {
                return Err(HandoffError::MailboxTimeout {
                    path: mailbox.to_path_buf(),
                    waited_ms: waited.as_millis() as u64,
                });
            }
            tracing::debug!(mailbox = %mailbox.display(), waited_ms = waited.as_millis() as u64, "Mailbox occupied");
            tokio::select! {
                _ = cancel.cancelled() => return Err(HandoffError::Cancelled(mailbox.to_path_buf())),
                _ = sleep(self.opts.poll_interval) => {}
            }
        }
    }

    /// Build the payload from `source` and place it in `machine`'s mailbox.
    pub async fn deliver(
        &self,
        job_key: &str,
        source: &Path,
        machine: &Machine,
        cancel: &CancellationToken,
    ) -> Result<Delivery, HandoffError> {
        let dir = machine
            .handoff_dir()
            .ok_or_else(|| HandoffError::Unreachable(machine.run_folder.clone()))?;
        if !tokio::fs::metadata(dir).await.is_ok_and(|m| m.is_dir()) {
            return Err(HandoffError::Unreachable(dir.to_path_buf()));
        }

        let parts = match tokio::fs::read(source).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(HandoffError::PayloadMissing(job_key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let payload = self.build_payload(&parts, machine);
        if !payload.malformed.is_empty() {
            tracing::warn!(
                job = %job_key,
                lines = ?payload.malformed,
                "Payload rows passed through unmodified"
            );
        }

        let mailbox = self.mailbox_path(dir);
        let waited = self.wait_for_slot(&mailbox, cancel).await?;
        if cancel.is_cancelled() {
            return Err(HandoffError::Cancelled(mailbox));
        }
        write_atomic(&mailbox, payload.text.as_bytes()).await?;

        tracing::info!(
            job = %job_key,
            machine = machine.id,
            mailbox = %mailbox.display(),
            rows = payload.rows,
            "Payload delivered"
        );
        Ok(Delivery {
            mailbox,
            rows: payload.rows,
            malformed: payload.malformed,
            pallet: payload.pallet,
            waited,
        })
    }

    /// Rebuild the delivery record for a payload already written to the
    /// mailbox, from its `.sent` copy.
    async fn delivered(&self, marker: &Path, machine: &Machine) -> Result<Delivery, HandoffError> {
        let dir = machine
            .handoff_dir()
            .ok_or_else(|| HandoffError::Unreachable(machine.run_folder.clone()))?;
        let bytes = tokio::fs::read(marker).await?;
        let payload = self.build_payload(&String::from_utf8_lossy(&bytes), machine);
        Ok(Delivery {
            mailbox: self.mailbox_path(dir),
            rows: payload.rows,
            malformed: payload.malformed,
            pallet: payload.pallet,
            waited: Duration::ZERO,
        })
    }

    /// Hand a CNC_FINISH job off downstream.
    ///
    /// Once the mailbox write is confirmed the source is renamed to its
    /// `.sent` marker, and the marker is removed only after the conditional
    /// FORWARDED write. A retry that finds the marker without the source
    /// commits without writing the mailbox again, so any crash point yields
    /// at most one transition and one event.
    pub async fn forward(
        &self,
        job: &Job,
        machine: &Machine,
        source: &Path,
        store: &dyn JobStore,
        events: &dyn EventLog,
        cancel: &CancellationToken,
    ) -> Result<Advance, EngineError> {
        let marker = sent_marker(source);
        match store.get(&job.key).await? {
            None => return Ok(Advance::UnknownJob),
            Some(current) if StateMachine::already_reached(current.status, Trigger::HandoffSucceeded) => {
                discard(&marker).await;
                return Ok(Advance::AlreadyAdvanced(current.status));
            }
            Some(_) => {}
        }

        let resumed = !tokio::fs::try_exists(source).await? && tokio::fs::try_exists(&marker).await?;
        let delivery = if resumed {
            tracing::info!(job = %job.key, marker = %marker.display(), "Resuming delivered handoff");
            self.delivered(&marker, machine).await?
        } else {
            let delivery = self.deliver(&job.key, source, machine, cancel).await?;
            if let Err(e) = tokio::fs::rename(source, &marker).await {
                tracing::warn!(path = %source.display(), error = %e, "Failed to mark payload as sent");
            }
            delivery
        };

        let fields = JobFields {
            assign_machine: Some(machine.id),
            forwarded_at: Some(Utc::now()),
            pallet: delivery.pallet.clone(),
            ..Default::default()
        };
        let event_source = json!({
            "mailbox": delivery.mailbox,
            "rows": delivery.rows,
            "waited_ms": delivery.waited.as_millis() as u64,
            "resumed": resumed,
        });
        let outcome = advance(store, events, &job.key, Trigger::HandoffSucceeded, fields, event_source).await?;
        discard(source).await;
        discard(&marker).await;
        Ok(outcome)
    }
}

/// `<source>.sent`.
pub fn sent_marker(source: &Path) -> PathBuf {
    let mut name = source.as_os_str().to_owned();
    name.push(SENT_SUFFIX);
    PathBuf::from(name)
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove delivered payload"),
    }
}

/// Staged parts list for `job` on `machine`: `<base>.csv` directly inside
/// `<run>/<job folder>`. A lone `.sent` marker resolves to the path it was
/// renamed from, so an interrupted handoff can finish. Nothing outside the
/// job's own staging directory is considered.
pub fn payload_path(machine: &Machine, job: &Job) -> Option<PathBuf> {
    let staged = machine.run_folder.join(job.staging_dir());
    let name = format!("{}.csv", job.base_key());
    staged_file(&staged, &name).or_else(|| {
        staged_file(&staged, &format!("{name}{SENT_SUFFIX}")).map(|marker| marker.with_extension(""))
    })
}

fn staged_file(dir: &Path, name: &str) -> Option<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .find(|e| e.file_type().is_file() && e.file_name().to_string_lossy().eq_ignore_ascii_case(name))
        .map(|e| e.into_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::JobStatus;
    use crate::store::{MemoryEventLog, MemoryJobStore};
    use tempfile::TempDir;

    fn machine(dir: &Path, id: u32) -> Machine {
        Machine {
            id,
            name: format!("WT{id}"),
            address: String::new(),
            run_folder: dir.join("run"),
            handoff_folder: Some(dir.join("nestpick")),
            handoff_enabled: true,
            status_folder: None,
        }
    }

    fn fast() -> HandoffChannel {
        HandoffChannel::new(MailboxOptions {
            poll_interval: Duration::from_millis(20),
            timeout: Duration::from_secs(5),
            ..Default::default()
        })
    }

    fn cnc_finished(folder: &str, base: &str) -> Job {
        let mut job = Job::new(folder, base);
        job.status = JobStatus::CncFinish;
        job
    }

    const PARTS: &str = "X-pos,Y-pos,reserve,ElementID,LengthX,LengthY,Thickness,Destination,SourceMachine,Type,Additional,Category,PalletName,X-posTarget,YposTarget,RposTarget\n\
0,0,,part1-1,0,0,0,,,,,,,0,0,0\n\
0,0,,part1-2,0,0,0,,,,,,P3,0,0,0\n";

    #[test]
    fn payload_rewrites_fixed_fields_and_reads_pallet() {
        let dir = TempDir::new().unwrap();
        let payload = fast().build_payload(PARTS, &machine(dir.path(), 2));
        assert_eq!(payload.rows, 2);
        assert_eq!(payload.pallet.as_deref(), Some("P3"));
        let row: Vec<&str> = payload.text.lines().nth(1).unwrap().split(',').collect();
        assert_eq!(row[7], "99");
        assert_eq!(row[8], "2");
    }

    #[tokio::test]
    async fn no_write_while_mailbox_occupied() {
        let dir = TempDir::new().unwrap();
        let m = machine(dir.path(), 1);
        std::fs::create_dir_all(m.handoff_folder.as_ref().unwrap()).unwrap();
        let mailbox = m.handoff_folder.as_ref().unwrap().join("Nestpick.csv");
        std::fs::write(&mailbox, "previous job").unwrap();
        let source = dir.path().join("part1.csv");
        std::fs::write(&source, PARTS).unwrap();

        let channel = HandoffChannel::new(MailboxOptions {
            poll_interval: Duration::from_millis(10),
            timeout: Duration::from_millis(100),
            ..Default::default()
        });
        let err = channel
            .deliver("a/part1", &source, &m, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HandoffError::MailboxTimeout { .. }));
        assert_eq!(std::fs::read_to_string(&mailbox).unwrap(), "previous job");
        assert!(source.exists());
    }

    #[tokio::test]
    async fn consumer_removal_unblocks_the_write() {
        let dir = TempDir::new().unwrap();
        let m = machine(dir.path(), 1);
        std::fs::create_dir_all(m.handoff_folder.as_ref().unwrap()).unwrap();
        let mailbox = m.handoff_folder.as_ref().unwrap().join("Nestpick.csv");
        std::fs::write(&mailbox, "previous job").unwrap();
        let source = dir.path().join("part1.csv");
        std::fs::write(&source, PARTS).unwrap();

        let consumer = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(150)).await;
                assert_eq!(std::fs::read_to_string(&mailbox).unwrap(), "previous job");
                std::fs::remove_file(&mailbox).unwrap();
            })
        };

        let delivery = fast()
            .deliver("a/part1", &source, &m, &CancellationToken::new())
            .await
            .unwrap();
        consumer.await.unwrap();

        assert!(delivery.waited >= Duration::from_millis(100));
        let written = std::fs::read_to_string(&mailbox).unwrap();
        assert!(written.contains("part1-1,0,0,0,99,1"));
    }

    #[tokio::test]
    async fn cancellation_aborts_wait_without_writing() {
        let dir = TempDir::new().unwrap();
        let m = machine(dir.path(), 1);
        std::fs::create_dir_all(m.handoff_folder.as_ref().unwrap()).unwrap();
        let mailbox = m.handoff_folder.as_ref().unwrap().join("Nestpick.csv");
        std::fs::write(&mailbox, "previous job").unwrap();
        let source = dir.path().join("part1.csv");
        std::fs::write(&source, PARTS).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = fast().deliver("a/part1", &source, &m, &cancel).await.unwrap_err();
        assert!(matches!(err, HandoffError::Cancelled(_)));
        assert_eq!(std::fs::read_to_string(&mailbox).unwrap(), "previous job");
    }

    #[tokio::test]
    async fn unreachable_destination() {
        let dir = TempDir::new().unwrap();
        let m = machine(dir.path(), 1);
        let source = dir.path().join("part1.csv");
        std::fs::write(&source, PARTS).unwrap();
        let err = fast()
            .deliver("a/part1", &source, &m, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HandoffError::Unreachable(_)));
    }

    #[tokio::test]
    async fn forward_transitions_and_deletes_source() {
        let dir = TempDir::new().unwrap();
        let m = machine(dir.path(), 1);
        std::fs::create_dir_all(m.handoff_folder.as_ref().unwrap()).unwrap();
        let source = dir.path().join("part1.csv");
        std::fs::write(&source, PARTS).unwrap();
        let job = cnc_finished("A", "part1");
        let store = MemoryJobStore::from_jobs([job.clone()]);
        let events = MemoryEventLog::new();

        let out = fast()
            .forward(&job, &m, &source, &store, &events, &CancellationToken::new())
            .await
            .unwrap();

        let Advance::Advanced(updated) = out else {
            panic!("expected advance, got {out:?}");
        };
        assert_eq!(updated.status, JobStatus::Forwarded);
        assert_eq!(updated.pallet.as_deref(), Some("P3"));
        assert!(updated.forwarded_at.is_some());
        assert!(!source.exists());
        assert!(!sent_marker(&source).exists());
        assert_eq!(events.all().await.len(), 1);
    }

    #[tokio::test]
    async fn retry_after_crash_forwards_exactly_once() {
        let dir = TempDir::new().unwrap();
        let m = machine(dir.path(), 1);
        let handoff = m.handoff_folder.clone().unwrap();
        std::fs::create_dir_all(&handoff).unwrap();
        let source = dir.path().join("part1.csv");
        std::fs::write(&source, PARTS).unwrap();
        let job = cnc_finished("A", "part1");
        let store = MemoryJobStore::from_jobs([job.clone()]);
        let events = MemoryEventLog::new();
        let channel = fast();
        let cancel = CancellationToken::new();

        // First attempt writes the mailbox, then the process dies before
        // marking the source sent.
        channel.deliver(&job.key, &source, &m, &cancel).await.unwrap();
        assert!(source.exists());

        // Downstream consumes the first copy while the retry waits.
        let mailbox = handoff.join("Nestpick.csv");
        let consumer = tokio::spawn({
            let mailbox = mailbox.clone();
            async move {
                sleep(Duration::from_millis(60)).await;
                std::fs::remove_file(mailbox).unwrap();
            }
        });
        let out = channel
            .forward(&job, &m, &source, &store, &events, &cancel)
            .await
            .unwrap();
        consumer.await.unwrap();
        assert!(out.is_advanced());

        // A further retry is a no-op.
        let again = channel
            .forward(&job, &m, &source, &store, &events, &cancel)
            .await
            .unwrap();
        assert_eq!(again, Advance::AlreadyAdvanced(JobStatus::Forwarded));

        let recorded = events.all().await;
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].event_type, "forwarded");
        assert_eq!(
            store.get(&job.key).await.unwrap().unwrap().status,
            JobStatus::Forwarded
        );
    }

    #[tokio::test]
    async fn crash_after_marking_sent_commits_without_rewriting() {
        let dir = TempDir::new().unwrap();
        let m = machine(dir.path(), 1);
        let handoff = m.handoff_folder.clone().unwrap();
        std::fs::create_dir_all(&handoff).unwrap();
        let source = dir.path().join("part1.csv");
        std::fs::write(&source, PARTS).unwrap();
        let job = cnc_finished("A", "part1");
        let store = MemoryJobStore::from_jobs([job.clone()]);
        let events = MemoryEventLog::new();
        let channel = HandoffChannel::new(MailboxOptions {
            poll_interval: Duration::from_millis(10),
            timeout: Duration::from_millis(100),
            ..Default::default()
        });
        let cancel = CancellationToken::new();

        // The mailbox write was confirmed and the source marked, then the
        // process died before FORWARDED was committed.
        channel.deliver(&job.key, &source, &m, &cancel).await.unwrap();
        std::fs::rename(&source, sent_marker(&source)).unwrap();
        let mailbox = handoff.join("Nestpick.csv");
        let written = std::fs::read_to_string(&mailbox).unwrap();

        let out = channel
            .forward(&job, &m, &source, &store, &events, &cancel)
            .await
            .unwrap();
        let Advance::Advanced(updated) = out else {
            panic!("expected advance, got {out:?}");
        };
        assert_eq!(updated.status, JobStatus::Forwarded);
        assert_eq!(updated.pallet.as_deref(), Some("P3"));
        assert_eq!(std::fs::read_to_string(&mailbox).unwrap(), written);
        assert!(!sent_marker(&source).exists());

        let again = channel
            .forward(&job, &m, &source, &store, &events, &cancel)
            .await
            .unwrap();
        assert_eq!(again, Advance::AlreadyAdvanced(JobStatus::Forwarded));
        let recorded = events.all().await;
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].payload["source"]["resumed"], true);
    }

    #[test]
    fn payload_path_reads_the_job_staging_dir() {
        let dir = TempDir::new().unwrap();
        let m = machine(dir.path(), 1);
        let job = Job::new("Orders/A", "Part1");
        std::fs::create_dir_all(m.run_folder.join("Orders/A/sub")).unwrap();
        std::fs::create_dir_all(m.run_folder.join("A")).unwrap();
        std::fs::write(m.run_folder.join("A/part1.csv"), "x").unwrap();
        std::fs::write(m.run_folder.join("Orders/A/sub/part1.csv"), "z").unwrap();
        assert_eq!(payload_path(&m, &job), None);

        std::fs::write(m.run_folder.join("Orders/A/PART1.csv"), "y").unwrap();
        assert_eq!(payload_path(&m, &job).unwrap(), m.run_folder.join("Orders/A/PART1.csv"));
    }

    #[test]
    fn payload_path_never_borrows_another_jobs_parts_list() {
        let dir = TempDir::new().unwrap();
        let m = machine(dir.path(), 1);
        std::fs::create_dir_all(m.run_folder.join("B")).unwrap();
        std::fs::write(m.run_folder.join("B/part1.csv"), PARTS).unwrap();
        assert_eq!(payload_path(&m, &Job::new("A", "part1")), None);
        assert_eq!(
            payload_path(&m, &Job::new("B", "part1")).unwrap(),
            m.run_folder.join("B/part1.csv")
        );
    }

    #[test]
    fn payload_path_resolves_a_sent_marker() {
        let dir = TempDir::new().unwrap();
        let m = machine(dir.path(), 1);
        std::fs::create_dir_all(m.run_folder.join("A")).unwrap();
        std::fs::write(m.run_folder.join("A/part1.csv.sent"), PARTS).unwrap();
        assert_eq!(
            payload_path(&m, &Job::new("A", "part1")).unwrap(),
            m.run_folder.join("A/part1.csv")
        );
    }
}
