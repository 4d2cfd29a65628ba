//! Copies a located asset manifest into a machine's run folder.
//!
//! Existing destination files are never overwritten; they are reported as
//! skipped. A failure on one file is recorded and the rest of the manifest
//! is still copied.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::assets::{AssetKind, AssetManifest};

/// Column layout the downstream sorter expects in a parts list.
pub const PARTS_HEADER: [&str; 16] = [
    "X-pos",
    "Y-pos",
    "reserve",
    "ElementID",
    "LengthX",
    "LengthY",
    "Thickness",
    "Destination",
    "SourceMachine",
    "Type",
    "Additional",
    "Category",
    "PalletName",
    "X-posTarget",
    "YposTarget",
    "RposTarget",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageReport {
    pub copied: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
    /// Parts list synthesized because the job had none.
    pub generated: Option<PathBuf>,
}

impl StageReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct StagingCopier;

impl StagingCopier {
    /// Copy every asset under `dest_root`, creating directories as needed.
    ///
    /// When the manifest has no parts list, one is generated with
    /// `part_count` rows (at least one) so the downstream handoff has a payload.
    pub fn stage(manifest: &AssetManifest, dest_root: &Path, part_count: Option<u32>) -> StageReport {
        let mut report = StageReport::default();

        for asset in &manifest.assets {
            let dest = dest_root.join(&asset.relative);
            match copy_no_overwrite(&asset.source, &dest) {
                Ok(true) => report.copied.push(dest),
                Ok(false) => {
                    tracing::debug!(path = %dest.display(), "Destination exists, skipping");
                    report.skipped.push(dest);
                }
                Err(e) => {
                    tracing::warn!(
                        source = %asset.source.display(),
                        dest = %dest.display(),
                        error = %e,
                        "Failed to stage asset"
                    );
                    report.failed.push((asset.source.clone(), e.to_string()));
                }
            }
        }

        if manifest.first(AssetKind::PartsList).is_none() {
            let dest = dest_root.join(format!("{}.csv", manifest.base));
            let body = synthesize_parts_list(&manifest.base, part_count.unwrap_or(1));
            match write_new(&dest, body.as_bytes()) {
                Ok(true) => {
                    tracing::info!(path = %dest.display(), "Generated parts list");
                    report.generated = Some(dest);
                }
                Ok(false) => report.skipped.push(dest),
                Err(e) => report.failed.push((dest, e.to_string())),
            }
        }

        report
    }
}

/// Copy `src` to `dest` unless `dest` exists. Returns `false` when skipped.
fn copy_no_overwrite(src: &Path, dest: &Path) -> io::Result<bool> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = match OpenOptions::new().write(true).create_new(true).open(dest) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e),
    };
    let result = File::open(src).and_then(|mut input| io::copy(&mut input, &mut out));
    if let Err(e) = result {
        drop(out);
        let _ = fs::remove_file(dest);
        return Err(e);
    }
    out.sync_all()?;
    Ok(true)
}

/// Write `body` to a temp name and move it into place unless `dest` exists.
fn write_new(dest: &Path, body: &[u8]) -> io::Result<bool> {
    if dest.exists() {
        return Ok(false);
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dest.with_file_name(format!(".{name}.tmp-{}", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp, body)?;
    if dest.exists() {
        let _ = fs::remove_file(&tmp);
        return Ok(false);
    }
    fs::rename(&tmp, dest)?;
    Ok(true)
}

/// Header plus one zeroed row per part, `ElementID` = `<base>-<n>`.
pub fn synthesize_parts_list(base: &str, parts: u32) -> String {
    let mut out = PARTS_HEADER.join(",");
    out.push('\n');
    for n in 1..=parts.max(1) {
        let element = format!("{base}-{n}");
        let row = [
            "0", "0", "", element.as_str(), "0", "0", "0", "", "", "", "", "", "", "0", "0", "0",
        ];
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}
