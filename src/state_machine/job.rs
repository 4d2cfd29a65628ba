use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::JobStatus;

/// Build the canonical job key from a folder (relative to the intake root)
/// and the primary file's base name.
///
/// Keys are lowercased and use forward slashes so that lookups never depend
/// on the casing or separator conventions of the filesystem that produced them.
pub fn job_key(folder: &str, base: &str) -> String {
    let folder = folder.replace('\\', "/");
    let folder = folder.trim_matches('/');
    let base = normalize_base(base);
    if folder.is_empty() {
        base
    } else {
        format!("{}/{}", folder.to_lowercase(), base)
    }
}

/// Canonical base name: trimmed, lowercased, `.nc` extension removed.
pub fn normalize_base(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('"').trim();
    let lower = trimmed.to_lowercase();
    match lower.strip_suffix(".nc") {
        Some(stem) => stem.to_string(),
        None => lower,
    }
}

/// One cut job tracked from intake to downstream completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub key: String,
    /// Folder relative to the intake root, as found on disk.
    pub folder: String,
    /// Primary program base name, as found on disk.
    pub base: String,
    pub status: JobStatus,
    pub machine_id: Option<u32>,
    pub material: Option<String>,
    pub dimensions: Option<String>,
    pub part_count: Option<u32>,
    pub pallet: Option<String>,
    pub created_at: DateTime<Utc>,
    pub staged_at: Option<DateTime<Utc>>,
    pub cut_at: Option<DateTime<Utc>>,
    pub forwarded_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub reserved: bool,
}

impl Job {
    pub fn new(folder: impl Into<String>, base: impl Into<String>) -> Self {
        let folder = folder.into();
        let base = base.into();
        Self {
            key: job_key(&folder, &base),
            folder,
            base,
            status: JobStatus::Pending,
            machine_id: None,
            material: None,
            dimensions: None,
            part_count: None,
            pallet: None,
            created_at: Utc::now(),
            staged_at: None,
            cut_at: None,
            forwarded_at: None,
            completed_at: None,
            locked: false,
            reserved: false,
        }
    }

    /// Canonical base name used to match drop-file rows against this job.
    pub fn base_key(&self) -> String {
        normalize_base(&self.base)
    }

    /// Job folder as a relative path, used as the staging directory under a
    /// machine's run folder. Two jobs share it only when their folders match.
    pub fn staging_dir(&self) -> PathBuf {
        let dir: PathBuf = self
            .folder
            .replace('\\', "/")
            .split('/')
            .filter(|s| !s.is_empty() && *s != "." && *s != "..")
            .collect();
        if dir.as_os_str().is_empty() {
            PathBuf::from(&self.base)
        } else {
            dir
        }
    }

    /// Apply the side-effect fields of a committed transition.
    pub fn apply(&mut self, fields: &JobFields) {
        if self.machine_id.is_none() {
            self.machine_id = fields.assign_machine;
        }
        if fields.allocate_pallet.is_some() && self.pallet.is_none() {
            self.pallet = fields.allocate_pallet.clone();
        }
        if fields.pallet.is_some() {
            self.pallet = fields.pallet.clone();
        }
        self.staged_at = fields.staged_at.or(self.staged_at);
        self.cut_at = fields.cut_at.or(self.cut_at);
        self.forwarded_at = fields.forwarded_at.or(self.forwarded_at);
        self.completed_at = fields.completed_at.or(self.completed_at);
    }
}

/// Fields written together with a status change.
///
/// `assign_machine` and `allocate_pallet` only fill empty slots; `pallet`
/// overwrites whatever was there.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assign_machine: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocate_pallet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pallet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staged_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cut_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forwarded_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// A CNC cell the engine stages to and hands off from. Owned by operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub address: String,
    pub run_folder: PathBuf,
    #[serde(default)]
    pub handoff_folder: Option<PathBuf>,
    #[serde(default)]
    pub handoff_enabled: bool,
    /// Per-machine status drop folder, when it differs from the global one.
    #[serde(default)]
    pub status_folder: Option<PathBuf>,
}

impl Machine {
    /// True when a drop-file token names this machine.
    pub fn matches_token(&self, token: &str) -> bool {
        let token = token.trim();
        token.eq_ignore_ascii_case(&self.name) || token.parse::<u32>().ok() == Some(self.id)
    }

    /// Handoff folder when handoff is enabled and configured.
    pub fn handoff_dir(&self) -> Option<&Path> {
        if self.handoff_enabled {
            self.handoff_folder.as_deref()
        } else {
            None
        }
    }
}

/// Append-only record of something that happened to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: Uuid,
    pub job_key: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub machine_id: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(
        job_key: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        machine_id: Option<u32>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_key: job_key.into(),
            event_type: event_type.into(),
            payload,
            machine_id,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_key_is_case_and_separator_normalized() {
        assert_eq!(job_key("A", "Part1.NC"), "a/part1");
        assert_eq!(job_key("Orders\\2024\\A", "part1"), "orders/2024/a/part1");
        assert_eq!(job_key("/A/", "PART1"), "a/part1");
        assert_eq!(job_key("", "Part1"), "part1");
    }

    #[test]
    fn new_job_defaults() {
        let job = Job::new("Orders/A", "Part1");
        assert_eq!(job.key, "orders/a/part1");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.base_key(), "part1");
        assert_eq!(job.staging_dir(), Path::new("Orders").join("A"));
        assert!(job.machine_id.is_none());
    }

    #[test]
    fn staging_dir_stays_inside_the_run_folder() {
        assert_eq!(Job::new("..\\X\\A", "p").staging_dir(), Path::new("X").join("A"));
        assert_eq!(Job::new("", "part1").staging_dir(), Path::new("part1"));
        assert_ne!(
            Job::new("X/A", "part1").staging_dir(),
            Job::new("Y/A", "part1").staging_dir()
        );
    }

    #[test]
    fn apply_never_clears_machine() {
        let mut job = Job::new("A", "part1");
        job.machine_id = Some(2);
        job.apply(&JobFields {
            assign_machine: Some(5),
            ..Default::default()
        });
        assert_eq!(job.machine_id, Some(2));
    }

    #[test]
    fn allocation_fills_only_empty_pallet() {
        let mut job = Job::new("A", "part1");
        job.apply(&JobFields {
            allocate_pallet: Some("Pallet_A01".into()),
            ..Default::default()
        });
        assert_eq!(job.pallet.as_deref(), Some("Pallet_A01"));
        job.apply(&JobFields {
            allocate_pallet: Some("Pallet_A02".into()),
            ..Default::default()
        });
        assert_eq!(job.pallet.as_deref(), Some("Pallet_A01"));
        job.apply(&JobFields {
            pallet: Some("P7".into()),
            ..Default::default()
        });
        assert_eq!(job.pallet.as_deref(), Some("P7"));
    }

    #[test]
    fn machine_token_matching() {
        let m = Machine {
            id: 3,
            name: "WT1".into(),
            address: String::new(),
            run_folder: PathBuf::from("/run"),
            handoff_folder: None,
            handoff_enabled: true,
            status_folder: None,
        };
        assert!(m.matches_token("wt1"));
        assert!(m.matches_token("3"));
        assert!(!m.matches_token("WT2"));
        assert!(m.handoff_dir().is_none());
    }

    #[test]
    fn job_serialization_roundtrip() {
        let job = Job::new("A", "part1");
        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }
}
