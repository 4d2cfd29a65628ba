//! Intake root: every stable `.nc` program under the processed-jobs root
//! becomes a PENDING job.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde_json::json;
use walkdir::WalkDir;

use super::context::ScanContext;
use super::{CycleSummary, FileOutcome};
use crate::assets::count_parts;
use crate::error::EngineError;
use crate::state_machine::{Job, JobEvent, job_key};

/// `.nc` files under `root`, skipping the archive folder.
pub(crate) fn list_programs(root: &Path, archive_dir_name: &str) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir() && e.depth() > 0 && e.file_name().eq_ignore_ascii_case(archive_dir_name))
        })
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("nc"))
        })
        .map(|e| e.into_path())
        .collect()
}

/// Folder of `path` relative to `root`, forward slashes, as found on disk.
fn relative_folder(root: &Path, path: &Path) -> String {
    path.parent()
        .and_then(|p| p.strip_prefix(root).ok())
        .map(|p| {
            p.components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_default()
}

pub(crate) async fn scan_intake(ctx: &ScanContext, root: &Path) -> CycleSummary {
    let mut summary = CycleSummary::default();

    let walk_root = root.to_path_buf();
    let archive = ctx.config.archive_dir_name.clone();
    let programs = match tokio::task::spawn_blocking(move || list_programs(&walk_root, &archive)).await {
        Ok(programs) => programs,
        Err(e) => {
            tracing::error!(root = %root.display(), error = %e, "Intake walk failed");
            summary.failed += 1;
            return summary;
        }
    };

    let live: HashSet<PathBuf> = programs.iter().cloned().collect();
    ctx.gate.prune(root, &live);

    for path in programs {
        summary.seen += 1;
        match register_program(ctx, root, &path).await {
            Ok(outcome) => summary.record(outcome),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Intake failed for program");
                summary.failed += 1;
            }
        }
    }
    summary
}

async fn register_program(ctx: &ScanContext, root: &Path, path: &Path) -> Result<FileOutcome, EngineError> {
    let Some(base) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
        return Ok(FileOutcome::Skipped);
    };
    let folder = relative_folder(root, path);
    let key = job_key(&folder, &base);

    if ctx.store.get(&key).await?.is_some() {
        return Ok(FileOutcome::Skipped);
    }
    if !ctx.gate.is_ready(path) {
        return Ok(FileOutcome::NotReady);
    }

    let dir = path.parent().unwrap_or(root).to_path_buf();
    let count_base = base.clone();
    let part_count = tokio::task::spawn_blocking(move || count_parts(&dir, &count_base)).await?;

    let mut job = Job::new(folder, base);
    job.part_count = part_count;
    if !ctx.store.insert_if_absent(job.clone()).await? {
        return Ok(FileOutcome::Skipped);
    }
    ctx.events
        .append(JobEvent::new(
            job.key.clone(),
            "created",
            json!({"file": path, "part_count": part_count}),
            None,
        ))
        .await?;

    tracing::info!(job = %job.key, parts = ?part_count, "Job registered");
    Ok(FileOutcome::Processed { advanced: 1 })
}
