//! Classifies drop-file names into the categories the engine reacts to.
//!
//! Names are lowercased at this boundary; everything downstream compares the
//! normalized form only.

use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropCategory {
    LoadStatus,
    LabelStatus,
    CutStatus,
    /// Downstream unstack report: jobs are done.
    Completion,
    /// Downstream pallet report: job → pallet pairs, enrichment only.
    PalletReport,
}

impl DropCategory {
    pub fn is_status(&self) -> bool {
        matches!(
            self,
            DropCategory::LoadStatus | DropCategory::LabelStatus | DropCategory::CutStatus
        )
    }

    pub fn is_downstream(&self) -> bool {
        matches!(self, DropCategory::Completion | DropCategory::PalletReport)
    }
}

impl fmt::Display for DropCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropCategory::LoadStatus => "load-status",
            DropCategory::LabelStatus => "label-status",
            DropCategory::CutStatus => "cut-status",
            DropCategory::Completion => "completion",
            DropCategory::PalletReport => "pallet-report",
        };
        f.write_str(s)
    }
}

/// A classified file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub category: DropCategory,
    /// Machine token or report suffix, lowercased. May be empty.
    pub token: String,
    /// The lowercased file name that matched.
    pub name: String,
}

struct Rule {
    pattern: Regex,
    category: DropCategory,
}

// Order matters: the first matching rule wins.
static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    let rule = |pattern: &str, category| Rule {
        pattern: Regex::new(pattern).unwrap_or_else(|e| panic!("bad matcher rule {pattern}: {e}")),
        category,
    };
    vec![
        rule(r"^(?:loadstatus|load_finish)([a-z0-9_\-]+)\.csv$", DropCategory::LoadStatus),
        rule(r"^(?:labelstatus|label_finish)([a-z0-9_\-]+)\.csv$", DropCategory::LabelStatus),
        rule(r"^(?:cutstatus|cnc_finish)([a-z0-9_\-]+)\.csv$", DropCategory::CutStatus),
        rule(r"^report_fullnestpickunstack(.*)\.csv$", DropCategory::Completion),
        rule(r"^report_nestpickstack(.*)\.csv$", DropCategory::PalletReport),
        rule(r"^nestpick()\.erl$", DropCategory::PalletReport),
    ]
});

/// Classify a bare file name. A non-match is `None`, never an error.
pub fn classify(name: &str) -> Option<Classified> {
    let name = name.trim().to_lowercase();
    RULES.iter().find_map(|rule| {
        rule.pattern.captures(&name).map(|caps| Classified {
            category: rule.category,
            token: caps
                .get(1)
                .map(|m| m.as_str().trim_matches(|c| c == '_' || c == '-').to_string())
                .unwrap_or_default(),
            name: name.clone(),
        })
    })
}

/// Classify the final component of `path`.
pub fn classify_path(path: &Path) -> Option<Classified> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(classify)
}
