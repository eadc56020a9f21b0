//! Defect model shared by the grouper, pipeline, and external adapters.
//!
//! A defect is a trackable problem report consumed from one of the external
//! sources (code host, task tracker, exception tracker). Parent/child
//! relations are stored by id only and resolved through [`DefectStore`].

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a defect in its source tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DefectState {
    Open,
    InProgress,
    Resolved,
    Closed,
}

/// Coarse classification used for grouping and commit-type mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefectKind {
    Bug,
    Feature,
    Refactor,
    Docs,
    Test,
    Chore,
}

impl DefectKind {
    /// Conventional-commit type for this kind.
    pub fn commit_type(self) -> &'static str {
        match self {
            DefectKind::Bug => "fix",
            DefectKind::Feature => "feat",
            DefectKind::Refactor => "refactor",
            DefectKind::Docs => "docs",
            DefectKind::Test => "test",
            DefectKind::Chore => "chore",
        }
    }

    /// Recognize a kind from a label such as `bug` or `kind:feature`.
    pub fn from_label(label: &str) -> Option<Self> {
        let name = label.strip_prefix("kind:").unwrap_or(label);
        match name.to_ascii_lowercase().as_str() {
            "bug" | "defect" => Some(DefectKind::Bug),
            "feature" | "enhancement" => Some(DefectKind::Feature),
            "refactor" => Some(DefectKind::Refactor),
            "docs" | "documentation" => Some(DefectKind::Docs),
            "test" | "tests" => Some(DefectKind::Test),
            "chore" => Some(DefectKind::Chore),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DefectKind::Bug => "bug",
            DefectKind::Feature => "feature",
            DefectKind::Refactor => "refactor",
            DefectKind::Docs => "docs",
            DefectKind::Test => "test",
            DefectKind::Chore => "chore",
        }
    }
}

impl fmt::Display for DefectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority levels, ordered so that `Critical` sorts highest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum DefectPriority {
    Low = 0,
    #[default]
    Medium = 1,
    High = 2,
    Critical = 3,
}

impl DefectPriority {
    /// Determine priority from tracker labels; the highest explicit label
    /// wins, and unlabeled defects default to medium.
    pub fn from_labels<S: AsRef<str>>(labels: &[S]) -> Self {
        labels
            .iter()
            .filter_map(|label| {
                let name = label.as_ref();
                let name = name.strip_prefix("priority:").unwrap_or(name);
                match name.to_ascii_lowercase().as_str() {
                    "critical" | "p0" => Some(DefectPriority::Critical),
                    "high" | "p1" => Some(DefectPriority::High),
                    "medium" | "p2" => Some(DefectPriority::Medium),
                    "low" | "p3" => Some(DefectPriority::Low),
                    _ => None,
                }
            })
            .max()
            .unwrap_or_default()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DefectPriority::Critical => "critical",
            DefectPriority::High => "high",
            DefectPriority::Medium => "medium",
            DefectPriority::Low => "low",
        }
    }
}

impl fmt::Display for DefectPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which external system produced the defect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DefectOrigin {
    Tracker,
    ExceptionTracker,
    Manual,
    Host,
}

/// Structured context attached to a defect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefectContext {
    pub component: Option<String>,
    pub priority: DefectPriority,
    /// Ordered; order is preserved into the bundle's file union.
    #[serde(default)]
    pub related_files: Vec<String>,
    #[serde(default)]
    pub related_symbols: Vec<String>,
    pub origin: DefectOrigin,
}

impl Default for DefectContext {
    fn default() -> Self {
        Self {
            component: None,
            priority: DefectPriority::Medium,
            related_files: Vec::new(),
            related_symbols: Vec::new(),
            origin: DefectOrigin::Host,
        }
    }
}

/// A trackable problem report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Defect {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub state: DefectState,
    pub kind: DefectKind,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub context: DefectContext,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub url: Option<String>,
    /// Parent/child relations are ids only; resolve via [`DefectStore`].
    #[serde(default)]
    pub parent_id: Option<u64>,
    #[serde(default)]
    pub child_ids: Vec<u64>,
}

impl Defect {
    pub fn priority(&self) -> DefectPriority {
        self.context.priority
    }

    pub fn component(&self) -> Option<&str> {
        self.context.component.as_deref()
    }

    /// Acceptance-criteria checkbox lines from the body, if any.
    pub fn acceptance_criteria(&self) -> Vec<String> {
        self.body
            .lines()
            .map(str::trim)
            .filter(|l| l.starts_with("- [ ]") || l.starts_with("- [x]") || l.starts_with("- [X]"))
            .map(|l| l[5..].trim().to_string())
            .filter(|l| !l.is_empty())
            .collect()
    }
}

/// Session-owned lookup map for defects, used to resolve parent/child ids
/// without holding cyclic references.
#[derive(Debug, Default)]
pub struct DefectStore {
    by_id: HashMap<u64, Defect>,
}

impl DefectStore {
    pub fn new(defects: impl IntoIterator<Item = Defect>) -> Self {
        let mut by_id = HashMap::new();
        for defect in defects {
            by_id.insert(defect.id, defect);
        }
        Self { by_id }
    }

    pub fn get(&self, id: u64) -> Option<&Defect> {
        self.by_id.get(&id)
    }

    pub fn insert(&mut self, defect: Defect) -> Option<Defect> {
        self.by_id.insert(defect.id, defect)
    }

    pub fn parent_of(&self, id: u64) -> Option<&Defect> {
        self.get(id)?.parent_id.and_then(|p| self.get(p))
    }

    pub fn children_of(&self, id: u64) -> Vec<&Defect> {
        self.get(id)
            .map(|d| d.child_ids.iter().filter_map(|c| self.get(*c)).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Defect> {
        self.by_id.values()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Minimal defect for unit tests; context fields default except the
    /// ones passed in.
    pub fn defect(id: u64, kind: DefectKind, priority: DefectPriority, component: &str) -> Defect {
        let now = Utc::now();
        Defect {
            id,
            title: format!("Defect #{id}"),
            body: String::new(),
            state: DefectState::Open,
            kind,
            labels: BTreeSet::new(),
            context: DefectContext {
                component: Some(component.to_string()),
                priority,
                ..Default::default()
            },
            created_at: now,
            updated_at: now,
            url: None,
            parent_id: None,
            child_ids: Vec::new(),
        }
    }
}
