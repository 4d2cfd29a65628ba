//! Finds a job's primary NC program and its sidecar files on disk.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::csv_rows::CsvDocument;
use crate::error::AssetError;

const PREVIEW_EXTENSIONS: &[&str] = &["bmp", "jpg", "jpeg"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    /// The `.nc` program itself.
    Primary,
    /// `<base>.csv`, the per-part metadata list handed off downstream.
    PartsList,
    /// `<base>.pts` or `<base>.lpt`.
    PartCount,
    /// `<base>*.bmp|jpg|jpeg` label previews.
    Preview,
    /// `<prefix>_map.csv`, shared by every program with the same prefix.
    Mapping,
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AssetKind::Primary => "primary",
            AssetKind::PartsList => "parts list",
            AssetKind::PartCount => "part count",
            AssetKind::Preview => "preview",
            AssetKind::Mapping => "mapping",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub kind: AssetKind,
    pub source: PathBuf,
    /// Destination path relative to the staging folder.
    pub relative: PathBuf,
}

/// Everything found for one job. Missing sidecars are listed, not fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetManifest {
    pub root: PathBuf,
    pub base: String,
    pub assets: Vec<Asset>,
    pub missing: Vec<AssetKind>,
}

impl AssetManifest {
    pub fn first(&self, kind: AssetKind) -> Option<&Asset> {
        self.assets.iter().find(|a| a.kind == kind)
    }

    pub fn primary(&self) -> Option<&Asset> {
        self.first(AssetKind::Primary)
    }
}

#[derive(Debug, Clone)]
pub struct AssetLocator {
    processed_root: PathBuf,
}

impl AssetLocator {
    pub fn new(processed_root: impl Into<PathBuf>) -> Self {
        Self {
            processed_root: processed_root.into(),
        }
    }

    /// Where to search for a job folder: the folder itself when absolute and
    /// present, else the folder under the intake root, else the intake root.
    pub fn search_root(&self, folder: &str) -> PathBuf {
        let candidate = Path::new(folder);
        if candidate.is_absolute() && candidate.is_dir() {
            return candidate.to_path_buf();
        }
        let nested = self.processed_root.join(folder.trim_start_matches(['/', '\\']));
        if !folder.is_empty() && nested.is_dir() {
            return nested;
        }
        self.processed_root.clone()
    }

    pub fn locate(&self, folder: &str, base: &str) -> Result<AssetManifest, AssetError> {
        let root = self.search_root(folder);
        locate_in(&root, base)
    }
}

/// Walk `root` once and collect the primary file and sidecars for `base`.
pub fn locate_in(root: &Path, base: &str) -> Result<AssetManifest, AssetError> {
    if !root.is_dir() {
        return Err(AssetError::RootMissing(root.to_path_buf()));
    }
    let index = index_files(root);
    let base_lower = base.trim().to_lowercase();
    let base_lower = base_lower.strip_suffix(".nc").unwrap_or(&base_lower).to_string();

    let flat = |kind, path: &PathBuf| Asset {
        kind,
        source: path.clone(),
        relative: PathBuf::from(path.file_name().unwrap_or_default()),
    };

    let primary = index
        .get(&format!("{base_lower}.nc"))
        .ok_or_else(|| AssetError::PrimaryMissing {
            name: format!("{base}.nc"),
            root: root.to_path_buf(),
        })?;

    let mut assets = vec![flat(AssetKind::Primary, primary)];
    let mut missing = Vec::new();

    match index.get(&format!("{base_lower}.csv")) {
        Some(p) => assets.push(flat(AssetKind::PartsList, p)),
        None => missing.push(AssetKind::PartsList),
    }

    let counts: Vec<&PathBuf> = ["pts", "lpt"]
        .iter()
        .filter_map(|ext| index.get(&format!("{base_lower}.{ext}")))
        .collect();
    if counts.is_empty() {
        missing.push(AssetKind::PartCount);
    }
    assets.extend(counts.into_iter().map(|p| flat(AssetKind::PartCount, p)));

    let mut previews: Vec<Asset> = index
        .iter()
        .filter(|(name, _)| {
            name.starts_with(&base_lower)
                && Path::new(name.as_str())
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| PREVIEW_EXTENSIONS.contains(&e))
        })
        .map(|(_, path)| Asset {
            kind: AssetKind::Preview,
            source: path.clone(),
            relative: path.strip_prefix(root).unwrap_or(path).to_path_buf(),
        })
        .collect();
    previews.sort_by(|a, b| a.relative.cmp(&b.relative));
    if previews.is_empty() {
        missing.push(AssetKind::Preview);
    }
    assets.extend(previews);

    if let Some(prefix) = mapping_prefix(&base_lower)
        && let Some(p) = index.get(&format!("{prefix}_map.csv"))
    {
        assets.push(flat(AssetKind::Mapping, p));
    }

    Ok(AssetManifest {
        root: root.to_path_buf(),
        base: base.to_string(),
        assets,
        missing,
    })
}

/// Program prefix shared by a family of jobs: everything before the first `_`.
fn mapping_prefix(base_lower: &str) -> Option<&str> {
    base_lower
        .split_once('_')
        .map(|(prefix, _)| prefix)
        .filter(|p| !p.is_empty())
}

/// Lowercased file name → path, first hit in sorted walk order wins.
fn index_files(root: &Path) -> HashMap<String, PathBuf> {
    let mut index = HashMap::new();
    for entry in WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let name = entry.file_name().to_string_lossy().to_lowercase();
        index.entry(name).or_insert_with(|| entry.into_path());
    }
    index
}

/// Case-insensitive recursive search for a file named `name` under `root`.
pub fn find_file(root: &Path, name: &str) -> Option<PathBuf> {
    let wanted = name.to_lowercase();
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .find(|e| e.file_type().is_file() && e.file_name().to_string_lossy().to_lowercase() == wanted)
        .map(|e| e.into_path())
}

/// Count parts from `<base>.pts`, falling back to `<base>.lpt`.
pub fn count_parts(root: &Path, base: &str) -> Option<u32> {
    ["pts", "lpt"].iter().find_map(|ext| {
        let path = find_file(root, &format!("{base}.{ext}"))?;
        let text = std::fs::read(&path).ok()?;
        count_part_rows(&String::from_utf8_lossy(&text))
    })
}

/// Non-blank rows, skipping a leading row that contains any letter.
pub fn count_part_rows(text: &str) -> Option<u32> {
    let doc = CsvDocument::parse(text, &[]);
    let mut lines = doc.data_lines().peekable();
    if let Some(first) = lines.peek()
        && first.raw.chars().any(|c| c.is_alphabetic())
    {
        lines.next();
    }
    let count = lines
        .filter(|l| l.raw.split([',', ';']).any(|c| !c.trim().is_empty()))
        .count() as u32;
    (count > 0).then_some(count)
}
