use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::defects::{Defect, DefectPriority};

/// Key by which defects are partitioned into bundles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    Component,
    File,
    Label,
    Kind,
    Priority,
}

impl GroupPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            GroupPolicy::Component => "component",
            GroupPolicy::File => "file",
            GroupPolicy::Label => "label",
            GroupPolicy::Kind => "kind",
            GroupPolicy::Priority => "priority",
        }
    }
}

impl fmt::Display for GroupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A grouping of related defects processed as one change proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    /// Deterministic within a session, e.g. `component-auth-1`.
    pub id: String,
    /// Human-readable, e.g. `auth (3 defects)`.
    pub name: String,
    pub policy: GroupPolicy,
    /// The shared grouping value for the chosen policy.
    pub group_value: String,
    /// Non-empty; ordered by (priority desc, id asc).
    pub defects: Vec<Defect>,
    /// Unique within a session; matches `[A-Za-z0-9._/-]+`.
    pub proposed_branch: String,
    /// Union of the members' related files, first-seen order.
    pub related_files: Vec<String>,
    /// Union of the members' components, first-seen order.
    pub components: Vec<String>,
    /// Max of the members' priorities.
    pub priority: DefectPriority,
}

impl Bundle {
    pub fn defect_ids(&self) -> Vec<u64> {
        self.defects.iter().map(|d| d.id).collect()
    }

    pub fn len(&self) -> usize {
        self.defects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defects.is_empty()
    }
}
