use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LifecycleError;

/// Lifecycle status of a cut job.
///
/// Jobs flow: PENDING → STAGED → (RUNNING) → LOAD_FINISH → LABEL_FINISH →
/// CNC_FINISH → FORWARDED → COMPLETE. Intermediate steps may be skipped, but
/// a job never moves backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Staged,
    Running,
    LoadFinish,
    LabelFinish,
    CncFinish,
    Forwarded,
    Complete,
}

impl JobStatus {
    pub const ALL: [JobStatus; 8] = [
        JobStatus::Pending,
        JobStatus::Staged,
        JobStatus::Running,
        JobStatus::LoadFinish,
        JobStatus::LabelFinish,
        JobStatus::CncFinish,
        JobStatus::Forwarded,
        JobStatus::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Staged => "STAGED",
            JobStatus::Running => "RUNNING",
            JobStatus::LoadFinish => "LOAD_FINISH",
            JobStatus::LabelFinish => "LABEL_FINISH",
            JobStatus::CncFinish => "CNC_FINISH",
            JobStatus::Forwarded => "FORWARDED",
            JobStatus::Complete => "COMPLETE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase().replace('-', "_");
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == upper)
            .ok_or_else(|| format!("unknown job status: {s}"))
    }
}

/// Something that happened on the shop floor and may advance a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Operator staged the job's assets to a machine.
    StageRequest,
    /// A load-status drop file referenced the job.
    LoadStatus,
    /// A label-status drop file referenced the job.
    LabelStatus,
    /// A cut-status drop file referenced the job.
    CutStatus,
    /// The job's payload was written to the downstream mailbox.
    HandoffSucceeded,
    /// Downstream sorting reported the job unstacked.
    CompletionReport,
}

impl Trigger {
    /// Statuses from which this trigger may fire.
    pub fn from_states(&self) -> &'static [JobStatus] {
        match self {
            Trigger::StageRequest => &[JobStatus::Pending],
            Trigger::LoadStatus => &[JobStatus::Pending, JobStatus::Staged],
            Trigger::LabelStatus => &[JobStatus::LoadFinish],
            Trigger::CutStatus => &[
                JobStatus::LabelFinish,
                JobStatus::LoadFinish,
                JobStatus::Staged,
                JobStatus::Pending,
            ],
            Trigger::HandoffSucceeded => &[JobStatus::CncFinish],
            Trigger::CompletionReport => &[JobStatus::Forwarded],
        }
    }

    pub fn target(&self) -> JobStatus {
        match self {
            Trigger::StageRequest => JobStatus::Staged,
            Trigger::LoadStatus => JobStatus::LoadFinish,
            Trigger::LabelStatus => JobStatus::LabelFinish,
            Trigger::CutStatus => JobStatus::CncFinish,
            Trigger::HandoffSucceeded => JobStatus::Forwarded,
            Trigger::CompletionReport => JobStatus::Complete,
        }
    }

    /// Event type recorded when this trigger advances a job.
    pub fn event_type(&self) -> &'static str {
        match self {
            Trigger::StageRequest => "staged",
            Trigger::LoadStatus => "load_finish",
            Trigger::LabelStatus => "label_finish",
            Trigger::CutStatus => "cnc_finish",
            Trigger::HandoffSucceeded => "forwarded",
            Trigger::CompletionReport => "complete",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_type())
    }
}

/// A transition the lifecycle table allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: JobStatus,
    pub to: JobStatus,
    pub trigger: Trigger,
}

/// Pure guard over the lifecycle table. Performs no I/O.
pub struct StateMachine;

impl StateMachine {
    /// Decide whether `trigger` may move a job currently in `current`.
    pub fn plan(current: JobStatus, trigger: Trigger) -> Result<Transition, LifecycleError> {
        let to = trigger.target();
        if trigger.from_states().contains(&current) && to > current {
            Ok(Transition {
                from: current,
                to,
                trigger,
            })
        } else {
            Err(LifecycleError::Rejected { from: current, to })
        }
    }

    /// True when `status` already sits at or past where `trigger` would take it.
    pub fn already_reached(status: JobStatus, trigger: Trigger) -> bool {
        status >= trigger.target()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRIGGERS: [Trigger; 6] = [
        Trigger::StageRequest,
        Trigger::LoadStatus,
        Trigger::LabelStatus,
        Trigger::CutStatus,
        Trigger::HandoffSucceeded,
        Trigger::CompletionReport,
    ];

    #[test]
    fn happy_path_walks_the_table() {
        let mut status = JobStatus::Pending;
        for trigger in [
            Trigger::StageRequest,
            Trigger::LoadStatus,
            Trigger::LabelStatus,
            Trigger::CutStatus,
            Trigger::HandoffSucceeded,
            Trigger::CompletionReport,
        ] {
            let t = StateMachine::plan(status, trigger).unwrap();
            assert_eq!(t.from, status);
            status = t.to;
        }
        assert_eq!(status, JobStatus::Complete);
        assert!(status.is_terminal());
    }

    #[test]
    fn cut_status_may_skip_load_and_label() {
        let t = StateMachine::plan(JobStatus::Pending, Trigger::CutStatus).unwrap();
        assert_eq!(t.to, JobStatus::CncFinish);
        let t = StateMachine::plan(JobStatus::LoadFinish, Trigger::CutStatus).unwrap();
        assert_eq!(t.to, JobStatus::CncFinish);
    }

    #[test]
    fn label_requires_load_finish() {
        let err = StateMachine::plan(JobStatus::Staged, Trigger::LabelStatus).unwrap_err();
        assert_eq!(
            err,
            LifecycleError::Rejected {
                from: JobStatus::Staged,
                to: JobStatus::LabelFinish
            }
        );
    }

    #[test]
    fn every_allowed_transition_moves_forward() {
        for from in JobStatus::ALL {
            for trigger in TRIGGERS {
                if let Ok(t) = StateMachine::plan(from, trigger) {
                    assert!(t.to > t.from, "{} -> {} goes backward", t.from, t.to);
                }
            }
        }
    }

    #[test]
    fn complete_accepts_nothing() {
        for trigger in TRIGGERS {
            assert!(StateMachine::plan(JobStatus::Complete, trigger).is_err());
        }
    }

    #[test]
    fn forwarded_cannot_be_cut_again() {
        assert!(StateMachine::plan(JobStatus::Forwarded, Trigger::CutStatus).is_err());
        assert!(StateMachine::already_reached(JobStatus::Forwarded, Trigger::CutStatus));
        assert!(!StateMachine::already_reached(JobStatus::Staged, Trigger::CutStatus));
    }

    #[test]
    fn status_parse_and_display() {
        assert_eq!("cnc_finish".parse::<JobStatus>().unwrap(), JobStatus::CncFinish);
        assert_eq!("Load-Finish".parse::<JobStatus>().unwrap(), JobStatus::LoadFinish);
        assert!("cutting".parse::<JobStatus>().is_err());
        assert_eq!(JobStatus::LabelFinish.to_string(), "LABEL_FINISH");
    }

    #[test]
    fn status_serializes_screaming_case() {
        let json = serde_json::to_string(&JobStatus::CncFinish).unwrap();
        assert_eq!(json, "\"CNC_FINISH\"");
    }
}
