//! Load, label and cut status drops. Each data row names one job; the row is
//! turned into a lifecycle trigger for that job.

use std::io;
use std::path::Path;
use std::time::SystemTime;

use chrono::Utc;
use serde_json::json;

use super::FileOutcome;
use super::context::ScanContext;
use crate::csv_rows::{CsvDocument, Field};
use crate::error::EngineError;
use crate::matcher::{Classified, DropCategory};
use crate::reconcile::archive_file;
use crate::stability::content_hash;
use crate::state_machine::{Advance, Job, JobFields, Machine, StateMachine, Trigger, advance, normalize_base};

const STATUS_COLUMNS: &[&str] = &["Job", "JobKey", "NcFile", "Base", "Machine", "MachineId"];

const JOB_FIELDS: &[Field<'static>] = &[
    Field::new("Job", 0),
    Field::new("JobKey", 0),
    Field::new("NcFile", 0),
    Field::new("Base", 0),
];

const MACHINE_FIELDS: &[Field<'static>] = &[Field::new("MachineId", 1), Field::new("Machine", 1)];

pub(crate) fn trigger_for(category: DropCategory) -> Option<Trigger> {
    match category {
        DropCategory::LoadStatus => Some(Trigger::LoadStatus),
        DropCategory::LabelStatus => Some(Trigger::LabelStatus),
        DropCategory::CutStatus => Some(Trigger::CutStatus),
        DropCategory::Completion | DropCategory::PalletReport => None,
    }
}

/// Read a file that may disappear between listing and reading. `None` means
/// it vanished and the next cycle should look again.
pub(crate) async fn read_drop(path: &Path) -> Result<Option<(Vec<u8>, SystemTime)>, EngineError> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some((bytes, meta.modified().unwrap_or(SystemTime::UNIX_EPOCH))))
}

pub(crate) async fn handle_status_file(
    ctx: &ScanContext,
    path: &Path,
    classified: &Classified,
) -> Result<FileOutcome, EngineError> {
    let Some(trigger) = trigger_for(classified.category) else {
        return Ok(FileOutcome::Skipped);
    };
    let Some((bytes, mtime)) = read_drop(path).await? else {
        tracing::debug!(path = %path.display(), "Status file vanished before read");
        return Ok(FileOutcome::NotReady);
    };
    let hash = content_hash(&bytes);
    if !ctx.gate.should_process(path, &hash, mtime) {
        return Ok(FileOutcome::Duplicate);
    }

    let file_machine = ctx.machines.by_token(&classified.token).await?;
    let text = String::from_utf8_lossy(&bytes);
    let doc = CsvDocument::parse(&text, STATUS_COLUMNS);
    let job_col = doc.first_column(JOB_FIELDS).unwrap_or(0);
    let machine_col = doc.first_column(MACHINE_FIELDS);

    let mut advanced = 0;
    for line in doc.data_lines() {
        let Some(row) = &line.fields else {
            tracing::warn!(file = %classified.name, line = line.number, "Malformed status row ignored");
            continue;
        };
        let Some(ident) = row.get(job_col).map(|s| normalize_base(s)).filter(|s| !s.is_empty()) else {
            continue;
        };

        let machine = match &file_machine {
            Some(m) => Some(m.clone()),
            None => match machine_col
                .and_then(|i| row.get(i))
                .and_then(|s| s.trim().parse::<u32>().ok())
            {
                Some(id) => ctx.machines.get(id).await?,
                None => None,
            },
        };

        let Some(job) = select_job(ctx, &ident, machine.as_ref(), trigger, &hash, line.number).await? else {
            tracing::warn!(
                file = %classified.name,
                ident = %ident,
                "Status row references no known job"
            );
            continue;
        };

        let _guard = ctx.locks.lock(&job.key).await;
        let Some(job) = ctx.store.get(&job.key).await? else {
            continue;
        };
        let machine_id = machine.as_ref().map(|m| m.id).or(job.machine_id);
        let mut fields = JobFields {
            assign_machine: machine.as_ref().map(|m| m.id),
            ..Default::default()
        };
        let mut pallet = None;
        if trigger == Trigger::CutStatus {
            fields.cut_at = Some(Utc::now());
            if job.pallet.is_none() && StateMachine::plan(job.status, trigger).is_ok() {
                let reservation = ctx.pallets.reserve(machine_id).await;
                fields.allocate_pallet = Some(reservation.name());
                pallet = Some(reservation);
            }
        }
        let source = json!({"file": classified.name, "row": line.number, "ident": ident, "hash": hash});

        match advance(ctx.store.as_ref(), ctx.events.as_ref(), &job.key, trigger, fields, source).await? {
            Advance::Advanced(_) => {
                if let Some(reservation) = pallet {
                    reservation.commit();
                }
                advanced += 1;
            }
            Advance::AlreadyAdvanced(status) => {
                tracing::debug!(job = %job.key, status = %status, file = %classified.name, "Already advanced");
            }
            Advance::Rejected(e) => {
                tracing::warn!(job = %job.key, file = %classified.name, error = %e, "Invalid transition ignored");
            }
            Advance::UnknownJob => {
                tracing::warn!(job = %job.key, file = %classified.name, "Job disappeared during update");
            }
        }
    }

    ctx.gate.mark_processed(path, &hash);
    if ctx.config.archive_consumed {
        match archive_file(path, &ctx.config.archive_dir_name).await {
            Ok(_) => ctx.gate.forget(path),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to archive status file"),
        }
    }
    Ok(FileOutcome::Processed { advanced })
}

/// Pick the job a status row refers to. Jobs on another machine are never
/// candidates. A job this same content and row already moved keeps the row,
/// so a repeated drop resolves to it and changes nothing. Otherwise the
/// oldest job the trigger can still move wins, then the oldest of the rest.
async fn select_job(
    ctx: &ScanContext,
    ident: &str,
    machine: Option<&Machine>,
    trigger: Trigger,
    hash: &str,
    row: usize,
) -> Result<Option<Job>, EngineError> {
    let mut candidates = ctx.store.find_by_base(ident).await?;
    if let Some(m) = machine {
        candidates.retain(|j| j.machine_id.is_none_or(|id| id == m.id));
    }
    candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.key.cmp(&b.key)));

    if candidates.len() > 1 {
        let mut owner = None;
        for (i, job) in candidates.iter().enumerate() {
            if moved_by(ctx, &job.key, hash, row).await? {
                owner = Some(i);
                break;
            }
        }
        if let Some(i) = owner {
            return Ok(Some(candidates.swap_remove(i)));
        }
    }
    let pick = candidates
        .iter()
        .position(|j| StateMachine::plan(j.status, trigger).is_ok())
        .unwrap_or(0);
    Ok((pick < candidates.len()).then(|| candidates.swap_remove(pick)))
}

/// Whether `key` has an event sourced from `row` of a file with this content.
async fn moved_by(ctx: &ScanContext, key: &str, hash: &str, row: usize) -> Result<bool, EngineError> {
    Ok(ctx.events.for_job(key).await?.iter().any(|e| {
        let source = &e.payload["source"];
        source["hash"].as_str() == Some(hash) && source["row"].as_u64() == Some(row as u64)
    }))
}
