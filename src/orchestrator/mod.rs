//! Recurring scan loops, one per watched root.
//!
//! Every loop lists its root, classifies entries, waits for them to settle
//! and hands each one to its handler. A failure on one file is logged at the
//! per-file boundary and the cycle moves on. Handoffs run as separate tasks,
//! at most one per machine, so a full mailbox never stalls ingestion.

mod context;
mod intake;
mod status_files;

pub use context::ScanContext;

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::assets::{AssetKind, AssetLocator, AssetManifest};
use crate::error::{AssetError, EngineError, HandoffError};
use crate::handoff::payload_path;
use crate::health::HealthKind;
use crate::matcher::{Classified, classify_path};
use crate::reconcile::archive_file;
use crate::stability::content_hash;
use crate::staging::{StageReport, StagingCopier};
use crate::state_machine::{Advance, Job, JobFields, JobStatus, Machine, Trigger, advance};

use status_files::{handle_status_file, read_drop};

/// A folder with its own scan loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchRoot {
    /// Processed-jobs root; new `.nc` programs become jobs.
    Intake(PathBuf),
    /// Load/label/cut status drops.
    Status(PathBuf),
    /// A machine's handoff folder: downstream reports in, payloads out.
    Handoff(Machine),
}

impl fmt::Display for WatchRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchRoot::Intake(p) => write!(f, "intake {}", p.display()),
            WatchRoot::Status(p) => write!(f, "status {}", p.display()),
            WatchRoot::Handoff(m) => write!(f, "handoff {} ({})", m.name, m.id),
        }
    }
}

/// What one file turned into during a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileOutcome {
    NotReady,
    Duplicate,
    Skipped,
    Processed { advanced: usize },
}

/// Counters for one cycle over one root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub seen: usize,
    pub processed: usize,
    pub advanced: usize,
    pub not_ready: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub failed: usize,
    pub handoffs_started: usize,
}

impl CycleSummary {
    pub(crate) fn record(&mut self, outcome: FileOutcome) {
        match outcome {
            FileOutcome::NotReady => self.not_ready += 1,
            FileOutcome::Duplicate => self.duplicates += 1,
            FileOutcome::Skipped => self.skipped += 1,
            FileOutcome::Processed { advanced } => {
                self.processed += 1;
                self.advanced += advanced;
            }
        }
    }

    pub fn merge(&mut self, other: &CycleSummary) {
        self.seen += other.seen;
        self.processed += other.processed;
        self.advanced += other.advanced;
        self.not_ready += other.not_ready;
        self.duplicates += other.duplicates;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.handoffs_started += other.handoffs_started;
    }

    pub fn is_quiet(&self) -> bool {
        self.processed == 0 && self.failed == 0 && self.handoffs_started == 0
    }
}

/// Result of the operator `stage` command.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub manifest: AssetManifest,
    pub report: StageReport,
    /// `None` when the primary program could not be copied and the job was
    /// left where it was.
    pub advance: Option<Advance>,
}

/// Drives every watched root on its own interval and owns the shared
/// [`ScanContext`].
#[derive(Clone)]
pub struct ScanOrchestrator {
    ctx: Arc<ScanContext>,
    cancel: CancellationToken,
    loops: TaskTracker,
    handoffs: TaskTracker,
}

impl ScanOrchestrator {
    pub fn new(ctx: Arc<ScanContext>) -> Self {
        Self {
            ctx,
            cancel: CancellationToken::new(),
            loops: TaskTracker::new(),
            handoffs: TaskTracker::new(),
        }
    }

    pub fn context(&self) -> &Arc<ScanContext> {
        &self.ctx
    }

    /// Intake root, each distinct status folder, and each machine's handoff
    /// folder.
    pub async fn roots(&self) -> Result<Vec<WatchRoot>, EngineError> {
        let machines = self.ctx.machines.list().await?;
        let mut roots = Vec::new();

        if let Some(root) = &self.ctx.config.processed_jobs_root {
            roots.push(WatchRoot::Intake(root.clone()));
        }

        let mut status_dirs = HashSet::new();
        let global = self.ctx.config.status_root.iter();
        for dir in global.chain(machines.iter().filter_map(|m| m.status_folder.as_ref())) {
            if status_dirs.insert(dir.clone()) {
                roots.push(WatchRoot::Status(dir.clone()));
            }
        }

        for machine in machines {
            if machine.handoff_dir().is_some() {
                roots.push(WatchRoot::Handoff(machine));
            }
        }
        Ok(roots)
    }

    /// Run one cycle over `root`. Never fails; problems are counted and logged.
    pub async fn run_cycle(&self, root: &WatchRoot) -> CycleSummary {
        let summary = match root {
            WatchRoot::Intake(dir) => intake::scan_intake(&self.ctx, dir).await,
            WatchRoot::Status(dir) => self.scan_status_root(dir).await,
            WatchRoot::Handoff(machine) => self.scan_handoff_root(machine).await,
        };
        self.ctx.locks.prune();
        if !summary.is_quiet() {
            tracing::info!(
                root = %root,
                processed = summary.processed,
                advanced = summary.advanced,
                failed = summary.failed,
                handoffs = summary.handoffs_started,
                tracked = self.ctx.gate.tracked(),
                "Scan cycle finished"
            );
        }
        summary
    }

    /// Spawn one loop per root. Returns the number of loops started.
    pub async fn start(&self) -> Result<usize, EngineError> {
        let roots = self.roots().await?;
        let count = roots.len();
        for root in roots {
            self.spawn_loop(root);
        }
        tracing::info!(loops = count, "Scan loops started");
        Ok(count)
    }

    fn spawn_loop(&self, root: WatchRoot) {
        let this = self.clone();
        let interval = self.ctx.config.scan_interval();
        self.loops.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                this.run_cycle(&root).await;
            }
            tracing::debug!(root = %root, "Scan loop stopped");
        });
    }

    /// One cycle over every root, all roots in parallel, then wait for the
    /// handoffs those cycles launched.
    pub async fn run_once(&self) -> Result<Vec<(WatchRoot, CycleSummary)>, EngineError> {
        let mut set = JoinSet::new();
        for root in self.roots().await? {
            let this = self.clone();
            set.spawn(async move {
                let summary = this.run_cycle(&root).await;
                (root, summary)
            });
        }
        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            results.push(joined?);
        }
        self.wait_handoffs().await;
        Ok(results)
    }

    /// Block until every spawned handoff task has finished. Scan loops are
    /// tracked apart and keep running.
    pub async fn wait_handoffs(&self) {
        self.handoffs.close();
        self.handoffs.wait().await;
        self.handoffs.reopen();
    }

    /// Stop new cycles, abort mailbox waits, and let running copies and
    /// store writes finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.loops.close();
        self.loops.wait().await;
        self.handoffs.close();
        self.handoffs.wait().await;
        tracing::info!("Scan orchestrator stopped");
    }

    async fn scan_status_root(&self, dir: &Path) -> CycleSummary {
        let mut summary = CycleSummary::default();
        let Some(entries) = self.list_root(dir, &mut summary).await else {
            return summary;
        };
        for (path, classified) in entries {
            if !classified.category.is_status() {
                summary.skipped += 1;
                continue;
            }
            if !self.ctx.gate.is_ready(&path) {
                summary.not_ready += 1;
                continue;
            }
            match handle_status_file(&self.ctx, &path, &classified).await {
                Ok(outcome) => summary.record(outcome),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Status file failed");
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    async fn scan_handoff_root(&self, machine: &Machine) -> CycleSummary {
        let mut summary = CycleSummary::default();
        let Some(dir) = machine.handoff_dir() else {
            return summary;
        };
        if !tokio::fs::metadata(dir).await.is_ok_and(|m| m.is_dir()) {
            self.ctx.health.report(
                Some(machine.id),
                HealthKind::HandoffUnreachable,
                format!("{} is not reachable", dir.display()),
            );
            summary.failed += 1;
            return summary;
        }
        self.ctx.health.clear(Some(machine.id), HealthKind::HandoffUnreachable);

        if let Some(entries) = self.list_root(dir, &mut summary).await {
            for (path, classified) in entries {
                if !classified.category.is_downstream() {
                    summary.skipped += 1;
                    continue;
                }
                if !self.ctx.gate.is_ready(&path) {
                    summary.not_ready += 1;
                    continue;
                }
                match self.handle_report_file(&path, &classified, machine).await {
                    Ok(outcome) => summary.record(outcome),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Report file failed");
                        summary.failed += 1;
                    }
                }
            }
        }

        match self.dispatch_handoffs(machine).await {
            Ok(true) => summary.handoffs_started += 1,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(machine = machine.id, error = %e, "Handoff dispatch failed");
                summary.failed += 1;
            }
        }
        summary
    }

    /// Top-level files of `dir` that classify. Unclassified names are counted
    /// as seen and skipped silently.
    async fn list_root(&self, dir: &Path, summary: &mut CycleSummary) -> Option<Vec<(PathBuf, Classified)>> {
        let mut reader = match tokio::fs::read_dir(dir).await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(root = %dir.display(), error = %e, "Cannot list root");
                return None;
            }
        };
        let mut live = HashSet::new();
        let mut entries = Vec::new();
        loop {
            let entry = match reader.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(root = %dir.display(), error = %e, "Listing interrupted");
                    summary.failed += 1;
                    break;
                }
            };
            if !entry.file_type().await.is_ok_and(|t| t.is_file()) {
                continue;
            }
            let path = entry.path();
            summary.seen += 1;
            live.insert(path.clone());
            match classify_path(&path) {
                Some(classified) => entries.push((path, classified)),
                None => summary.skipped += 1,
            }
        }
        self.ctx.gate.prune(dir, &live);
        Some(entries)
    }

    async fn handle_report_file(
        &self,
        path: &Path,
        classified: &Classified,
        machine: &Machine,
    ) -> Result<FileOutcome, EngineError> {
        let Some((bytes, mtime)) = read_drop(path).await? else {
            return Ok(FileOutcome::NotReady);
        };
        let hash = content_hash(&bytes);
        if !self.ctx.gate.should_process(path, &hash, mtime) {
            return Ok(FileOutcome::Duplicate);
        }
        let text = String::from_utf8_lossy(&bytes);
        let summary = self
            .ctx
            .reconciler
            .reconcile(
                &classified.name,
                &text,
                classified.category,
                machine,
                self.ctx.store.as_ref(),
                self.ctx.events.as_ref(),
            )
            .await?;

        self.ctx.gate.mark_processed(path, &hash);
        if self.ctx.config.archive_consumed {
            match archive_file(path, self.ctx.reconciler.archive_dir_name()).await {
                Ok(_) => self.ctx.gate.forget(path),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to archive report"),
            }
        }
        Ok(FileOutcome::Processed {
            advanced: summary.completed.len() + summary.pallets.len(),
        })
    }

    /// Start a handoff task for `machine` if it has CNC_FINISH jobs and no
    /// handoff already running.
    async fn dispatch_handoffs(&self, machine: &Machine) -> Result<bool, EngineError> {
        if self.ctx.handoff_in_flight(machine.id) {
            return Ok(false);
        }
        let mut jobs: Vec<Job> = self
            .ctx
            .store
            .list_by_status(JobStatus::CncFinish)
            .await?
            .into_iter()
            .filter(|j| j.machine_id == Some(machine.id))
            .collect();
        if jobs.is_empty() {
            return Ok(false);
        }
        jobs.sort_by_key(|j| j.cut_at.unwrap_or(j.created_at));

        let Some(claim) = self.ctx.claim_handoff(machine.id) else {
            return Ok(false);
        };
        let ctx = Arc::clone(&self.ctx);
        let machine = machine.clone();
        let cancel = self.cancel.child_token();
        self.handoffs.spawn(async move {
            let _claim = claim;
            run_handoffs(&ctx, &machine, jobs, &cancel).await;
        });
        Ok(true)
    }

    /// Operator staging: copy the job's assets into `machine_id`'s run folder
    /// and move it PENDING → STAGED.
    pub async fn stage_job(&self, key: &str, machine_id: u32) -> Result<StageOutcome, EngineError> {
        let ctx = &self.ctx;
        let job = ctx
            .store
            .get(key)
            .await?
            .ok_or_else(|| EngineError::JobNotFound(key.to_string()))?;
        let machine = ctx
            .machines
            .get(machine_id)
            .await?
            .ok_or_else(|| EngineError::MachineNotFound(machine_id.to_string()))?;
        let root = ctx
            .config
            .processed_jobs_root
            .clone()
            .ok_or_else(|| AssetError::RootMissing(PathBuf::from(&job.folder)))?;

        let locator = AssetLocator::new(root);
        let (folder, base) = (job.folder.clone(), job.base.clone());
        let manifest = tokio::task::spawn_blocking(move || locator.locate(&folder, &base)).await??;
        for kind in &manifest.missing {
            if matches!(kind, AssetKind::PartsList | AssetKind::PartCount) {
                ctx.health.report(
                    Some(machine.id),
                    HealthKind::MissingSidecar,
                    format!("{}: no {kind} found", job.key),
                );
            }
        }

        let dest = machine.run_folder.join(job.staging_dir());
        let report = {
            let manifest = manifest.clone();
            let dest = dest.clone();
            let parts = job.part_count;
            tokio::task::spawn_blocking(move || StagingCopier::stage(&manifest, &dest, parts)).await?
        };
        for (path, error) in &report.failed {
            ctx.health.report(
                Some(machine.id),
                HealthKind::CopyFailure,
                format!("{}: {error}", path.display()),
            );
        }

        let primary_failed = manifest
            .primary()
            .is_some_and(|p| report.failed.iter().any(|(src, _)| src == &p.source));
        if primary_failed {
            tracing::warn!(job = %job.key, machine = machine.id, "Primary program not staged");
            return Ok(StageOutcome {
                manifest,
                report,
                advance: None,
            });
        }

        let _guard = ctx.locks.lock(&job.key).await;
        let fields = JobFields {
            assign_machine: Some(machine.id),
            staged_at: Some(Utc::now()),
            ..Default::default()
        };
        let source = json!({
            "dest": dest,
            "copied": report.copied.len(),
            "skipped": report.skipped.len(),
            "failed": report.failed.len(),
        });
        let outcome = advance(
            ctx.store.as_ref(),
            ctx.events.as_ref(),
            &job.key,
            Trigger::StageRequest,
            fields,
            source,
        )
        .await?;
        Ok(StageOutcome {
            manifest,
            report,
            advance: Some(outcome),
        })
    }
}

/// Forward `jobs` one at a time through `machine`'s single mailbox. Stops at
/// the first mailbox-level failure; the remaining jobs stay CNC_FINISH and
/// are retried next cycle.
async fn run_handoffs(ctx: &ScanContext, machine: &Machine, jobs: Vec<Job>, cancel: &CancellationToken) {
    for job in jobs {
        if cancel.is_cancelled() {
            break;
        }
        let source = {
            let (m, j) = (machine.clone(), job.clone());
            match tokio::task::spawn_blocking(move || payload_path(&m, &j)).await {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(job = %job.key, error = %e, "Payload search failed");
                    continue;
                }
            }
        };
        let Some(source) = source else {
            ctx.health.report(
                Some(machine.id),
                HealthKind::MissingSidecar,
                format!("{}: no staged parts list to hand off", job.key),
            );
            continue;
        };

        // The mailbox wait runs outside the job lock.
        let result = ctx
            .handoff
            .forward(&job, machine, &source, ctx.store.as_ref(), ctx.events.as_ref(), cancel)
            .await;
        match result {
            Ok(Advance::Advanced(_)) => {
                ctx.health.clear(Some(machine.id), HealthKind::MailboxTimeout);
                ctx.health.clear(Some(machine.id), HealthKind::HandoffUnreachable);
            }
            Ok(other) => tracing::debug!(job = %job.key, outcome = ?other, "Handoff made no transition"),
            Err(EngineError::Handoff(e @ HandoffError::MailboxTimeout { .. })) => {
                ctx.health.report(Some(machine.id), HealthKind::MailboxTimeout, e.to_string());
                break;
            }
            Err(EngineError::Handoff(e @ HandoffError::Unreachable(_))) => {
                ctx.health
                    .report(Some(machine.id), HealthKind::HandoffUnreachable, e.to_string());
                break;
            }
            Err(EngineError::Handoff(HandoffError::Cancelled(_))) => {
                tracing::info!(job = %job.key, machine = machine.id, "Handoff cancelled");
                break;
            }
            Err(e) => tracing::warn!(job = %job.key, machine = machine.id, error = %e, "Handoff failed"),
        }
    }
}
