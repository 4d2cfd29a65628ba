use std::path::PathBuf;

use thiserror::Error;

use crate::state_machine::JobStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Asset error: {0}")]
    Asset(#[from] AssetError),

    #[error("Handoff error: {0}")]
    Handoff(#[from] HandoffError),

    #[error("Machine not found: {0}")]
    MachineNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("primary file {name} not found under {}", root.display())]
    PrimaryMissing { name: String, root: PathBuf },

    #[error("search root {} does not exist", .0.display())]
    RootMissing(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("mailbox {} still occupied after {waited_ms}ms", path.display())]
    MailboxTimeout { path: PathBuf, waited_ms: u64 },

    #[error("handoff cancelled while waiting for {}", .0.display())]
    Cancelled(PathBuf),

    #[error("handoff payload not found for job {0}")]
    PayloadMissing(String),

    #[error("handoff destination {} is not reachable", .0.display())]
    Unreachable(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raised when a trigger asks for a transition the lifecycle table forbids.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("transition {from} -> {to} is not allowed")]
    Rejected { from: JobStatus, to: JobStatus },
}
