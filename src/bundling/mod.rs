//! Bundle formation: related defects are grouped into bundles, each of
//! which becomes one worktree, one agent run, and one change proposal.

pub mod grouper;
pub mod types;

pub use grouper::{group_defects, GroupingOptions, GroupingOutcome};
pub use types::{Bundle, GroupPolicy};
