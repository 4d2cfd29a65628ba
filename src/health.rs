//! Per-machine health signals for display. Nothing in the engine reads them
//! back to make decisions.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthKind {
    MissingSidecar,
    HandoffUnreachable,
    MailboxTimeout,
    CopyFailure,
}

impl fmt::Display for HealthKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthKind::MissingSidecar => "missing sidecar",
            HealthKind::HandoffUnreachable => "handoff destination unreachable",
            HealthKind::MailboxTimeout => "mailbox timeout",
            HealthKind::CopyFailure => "copy failure",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSignal {
    pub machine_id: Option<u32>,
    pub kind: HealthKind,
    pub detail: String,
    /// How many times this signal fired since it was last cleared.
    pub count: u32,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct HealthBoard {
    signals: Mutex<BTreeMap<(Option<u32>, HealthKind), HealthSignal>>,
}

impl HealthBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, machine_id: Option<u32>, kind: HealthKind, detail: impl Into<String>) {
        let detail = detail.into();
        tracing::warn!(target: "cutflow::health", machine = ?machine_id, kind = %kind, "{detail}");
        let mut signals = self.signals.lock().unwrap_or_else(|p| p.into_inner());
        let now = Utc::now();
        signals
            .entry((machine_id, kind))
            .and_modify(|s| {
                s.count += 1;
                s.detail = detail.clone();
                s.last_seen = now;
            })
            .or_insert(HealthSignal {
                machine_id,
                kind,
                detail,
                count: 1,
                last_seen: now,
            });
    }

    pub fn clear(&self, machine_id: Option<u32>, kind: HealthKind) {
        let mut signals = self.signals.lock().unwrap_or_else(|p| p.into_inner());
        signals.remove(&(machine_id, kind));
    }

    pub fn snapshot(&self) -> Vec<HealthSignal> {
        let signals = self.signals.lock().unwrap_or_else(|p| p.into_inner());
        signals.values().cloned().collect()
    }
}
