//! Consumes downstream completion and pallet reports and closes out jobs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::json;

use crate::csv_rows::{CsvDocument, Field};
use crate::error::EngineError;
use crate::matcher::DropCategory;
use crate::state_machine::{Advance, Job, JobEvent, JobFields, Machine, Trigger, advance, normalize_base};
use crate::store::{EventLog, JobStore};

const KNOWN_COLUMNS: &[&str] = &["ElementID", "Job", "JobKey", "NcFile", "Base", "PalletName", "Pallet"];

const JOB_FIELDS: &[Field<'static>] = &[
    Field::new("Job", 0),
    Field::new("JobKey", 0),
    Field::new("NcFile", 0),
    Field::new("Base", 0),
    Field::new("ElementID", 0),
];

const PALLET_FIELDS: &[Field<'static>] = &[Field::new("PalletName", 1), Field::new("Pallet", 1)];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub completed: Vec<String>,
    pub pallets: Vec<(String, String)>,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct CompletionReconciler {
    archive_dir_name: String,
}

impl CompletionReconciler {
    pub fn new(archive_dir_name: impl Into<String>) -> Self {
        Self {
            archive_dir_name: archive_dir_name.into(),
        }
    }

    pub fn archive_dir_name(&self) -> &str {
        &self.archive_dir_name
    }

    /// Apply a downstream report found in `machine`'s handoff folder.
    pub async fn reconcile(
        &self,
        file_name: &str,
        text: &str,
        category: DropCategory,
        machine: &Machine,
        store: &dyn JobStore,
        events: &dyn EventLog,
    ) -> Result<ReconcileSummary, EngineError> {
        let pairs = extract_pairs(text);
        let mut summary = ReconcileSummary::default();

        for (ident, pallet) in pairs {
            let jobs = resolve_jobs(store, &ident, machine).await?;
            if jobs.is_empty() {
                tracing::debug!(ident = %ident, file = %file_name, "No job for report row");
                summary.skipped += 1;
                continue;
            }
            for job in jobs {
                match category {
                    DropCategory::Completion => {
                        let fields = JobFields {
                            completed_at: Some(Utc::now()),
                            pallet: pallet.clone(),
                            ..Default::default()
                        };
                        let source = json!({"file": file_name, "ident": ident});
                        match advance(store, events, &job.key, Trigger::CompletionReport, fields, source).await? {
                            Advance::Advanced(_) => summary.completed.push(job.key.clone()),
                            other => {
                                tracing::debug!(job = %job.key, outcome = ?other, "Completion row skipped");
                                summary.skipped += 1;
                            }
                        }
                    }
                    DropCategory::PalletReport => {
                        let Some(pallet) = pallet.as_deref() else {
                            summary.skipped += 1;
                            continue;
                        };
                        if job.pallet.as_deref() == Some(pallet) {
                            continue;
                        }
                        if store.set_pallet(&job.key, pallet).await? > 0 {
                            events
                                .append(JobEvent::new(
                                    job.key.clone(),
                                    "pallet_updated",
                                    json!({"file": file_name, "from": job.pallet, "to": pallet}),
                                    Some(machine.id),
                                ))
                                .await?;
                            summary.pallets.push((job.key.clone(), pallet.to_string()));
                        }
                    }
                    _ => {
                        summary.skipped += 1;
                    }
                }
            }
        }

        tracing::info!(
            file = %file_name,
            machine = machine.id,
            completed = summary.completed.len(),
            pallets = summary.pallets.len(),
            skipped = summary.skipped,
            "Report reconciled"
        );
        Ok(summary)
    }
}

/// Unique (identifier, pallet) pairs in row order. The last non-empty pallet
/// seen for an identifier wins.
pub fn extract_pairs(text: &str) -> Vec<(String, Option<String>)> {
    let doc = CsvDocument::parse(text, KNOWN_COLUMNS);
    let job_col = doc.first_column(JOB_FIELDS).unwrap_or(0);
    let pallet_col = doc.first_column(PALLET_FIELDS);

    let mut order = Vec::new();
    let mut pairs: BTreeMap<String, Option<String>> = BTreeMap::new();
    for row in doc.rows() {
        let Some(ident) = row.get(job_col).map(|s| normalize_base(s)).filter(|s| !s.is_empty()) else {
            continue;
        };
        let pallet = pallet_col
            .and_then(|i| row.get(i))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        match pairs.get_mut(&ident) {
            Some(existing) => {
                if pallet.is_some() {
                    *existing = pallet;
                }
            }
            None => {
                order.push(ident.clone());
                pairs.insert(ident, pallet);
            }
        }
    }
    order
        .into_iter()
        .filter_map(|ident| pairs.remove(&ident).map(|p| (ident, p)))
        .collect()
}

/// Jobs a report identifier refers to on `machine`. Element ids of the form
/// `<base>-<n>` fall back to `<base>`.
async fn resolve_jobs(store: &dyn JobStore, ident: &str, machine: &Machine) -> Result<Vec<Job>, EngineError> {
    let mut jobs = store.find_by_base(ident).await?;
    if jobs.is_empty()
        && let Some((base, n)) = ident.rsplit_once('-')
        && !n.is_empty()
        && n.chars().all(|c| c.is_ascii_digit())
    {
        jobs = store.find_by_base(base).await?;
    }
    jobs.retain(|j| j.machine_id.is_none_or(|id| id == machine.id));
    Ok(jobs)
}

/// Move a consumed file into `<dir>/<archive>/<stem>_<timestamp>.<ext>`.
pub async fn archive_file(path: &Path, archive_dir_name: &str) -> std::io::Result<PathBuf> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let archive = dir.join(archive_dir_name);
    tokio::fs::create_dir_all(&archive).await?;

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let stamp = Utc::now().format("%Y%m%d%H%M%S");

    let mut target = archive.join(format!("{stem}_{stamp}{ext}"));
    let mut n = 1;
    while tokio::fs::try_exists(&target).await? {
        target = archive.join(format!("{stem}_{stamp}_{n}{ext}"));
        n += 1;
    }
    tokio::fs::rename(path, &target).await?;
    tracing::debug!(from = %path.display(), to = %target.display(), "Archived drop file");
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::JobStatus;
    use crate::store::{MemoryEventLog, MemoryJobStore};
    use tempfile::TempDir;

    fn machine(id: u32) -> Machine {
        Machine {
            id,
            name: format!("WT{id}"),
            address: String::new(),
            run_folder: PathBuf::from("/run"),
            handoff_folder: Some(PathBuf::from("/np")),
            handoff_enabled: true,
            status_folder: None,
        }
    }

    fn job(folder: &str, base: &str, status: JobStatus, machine: Option<u32>) -> Job {
        let mut j = Job::new(folder, base);
        j.status = status;
        j.machine_id = machine;
        j
    }

    #[test]
    fn pairs_from_headerless_and_headed_reports() {
        assert_eq!(
            extract_pairs("part1,P1\npart2.nc,P2\n"),
            vec![
                ("part1".to_string(), Some("P1".to_string())),
                ("part2".to_string(), Some("P2".to_string()))
            ]
        );
        let headed = "ElementID,PalletName\npart1-1,\npart1-2,P9\n";
        assert_eq!(
            extract_pairs(headed),
            vec![
                ("part1-1".to_string(), None),
                ("part1-2".to_string(), Some("P9".to_string()))
            ]
        );
        assert_eq!(extract_pairs("Part1\npart1\n"), vec![("part1".to_string(), None)]);
    }

    #[tokio::test]
    async fn completion_closes_forwarded_jobs_only() {
        let store = MemoryJobStore::from_jobs([
            job("A", "part1", JobStatus::Forwarded, Some(1)),
            job("B", "part2", JobStatus::CncFinish, Some(1)),
            job("C", "part3", JobStatus::Complete, Some(1)),
        ]);
        let events = MemoryEventLog::new();
        let summary = CompletionReconciler::new("archive")
            .reconcile(
                "Report_FullNestpickUnstack.csv",
                "part1,Pallet_A04\npart2,P1\npart3,P1\nghost,P1\n",
                DropCategory::Completion,
                &machine(1),
                &store,
                &events,
            )
            .await
            .unwrap();

        assert_eq!(summary.completed, vec!["a/part1".to_string()]);
        assert_eq!(summary.skipped, 3);
        let done = store.get("a/part1").await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Complete);
        assert_eq!(done.pallet.as_deref(), Some("Pallet_A04"));
        assert!(done.completed_at.is_some());
        assert_eq!(
            store.get("b/part2").await.unwrap().unwrap().status,
            JobStatus::CncFinish
        );
        assert_eq!(events.all().await.len(), 1);
    }

    #[tokio::test]
    async fn completion_ignores_other_machines_jobs() {
        let store = MemoryJobStore::from_jobs([job("A", "part1", JobStatus::Forwarded, Some(2))]);
        let events = MemoryEventLog::new();
        let summary = CompletionReconciler::new("archive")
            .reconcile("r.csv", "part1,P1\n", DropCategory::Completion, &machine(1), &store, &events)
            .await
            .unwrap();
        assert!(summary.completed.is_empty());
        assert_eq!(
            store.get("a/part1").await.unwrap().unwrap().status,
            JobStatus::Forwarded
        );
    }

    #[tokio::test]
    async fn pallet_report_updates_regardless_of_status() {
        let store = MemoryJobStore::from_jobs([
            job("A", "part1", JobStatus::CncFinish, Some(1)),
            job("B", "part2", JobStatus::Complete, Some(1)),
        ]);
        let events = MemoryEventLog::new();
        let text = "ElementID,PalletName\npart1-1,P5\npart2,P6\n";
        let summary = CompletionReconciler::new("archive")
            .reconcile("Nestpick.erl", text, DropCategory::PalletReport, &machine(1), &store, &events)
            .await
            .unwrap();

        assert_eq!(summary.pallets.len(), 2);
        let j1 = store.get("a/part1").await.unwrap().unwrap();
        assert_eq!(j1.pallet.as_deref(), Some("P5"));
        assert_eq!(j1.status, JobStatus::CncFinish);
        assert_eq!(
            store.get("b/part2").await.unwrap().unwrap().pallet.as_deref(),
            Some("P6")
        );
        let recorded = events.all().await;
        assert!(recorded.iter().all(|e| e.event_type == "pallet_updated"));
    }

    #[tokio::test]
    async fn archive_moves_file_with_timestamp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Report_FullNestpickUnstack.csv");
        std::fs::write(&path, "part1,P1").unwrap();
        let first = archive_file(&path, "archive").await.unwrap();
        assert!(!path.exists());
        assert!(first.starts_with(dir.path().join("archive")));
        assert!(
            first
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("Report_FullNestpickUnstack_")
        );

        std::fs::write(&path, "part1,P1").unwrap();
        let second = archive_file(&path, "archive").await.unwrap();
        assert_ne!(first, second);
        assert_eq!(std::fs::read_dir(dir.path().join("archive")).unwrap().count(), 2);
    }
}
