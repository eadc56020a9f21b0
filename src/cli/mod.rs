use clap::{Parser, Subcommand};

use crate::bundling::GroupPolicy;

pub mod commands;

#[derive(Parser)]
#[command(name = "fixwright")]
#[command(about = "Automated remediation workflow for tracked defects")]
#[command(
    long_about = "fixwright groups related defects into bundles, leases an isolated git \
                  worktree per bundle, invokes an external fixing agent under a budget, \
                  verifies the result with configured checks, and opens one change \
                  proposal per bundle. Run 'fixwright autofix --all' to process every \
                  opted-in defect, or start without a command on a pipe to expose the \
                  RPC tool surface."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Verbose progress output (periodic status snapshots)
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a fixwright.toml scaffold and verify host access
    Init {
        /// Overwrite an existing fixwright.toml
        #[arg(long, help = "Overwrite existing configuration")]
        force: bool,
    },
    /// Group defects, run the fixing pipeline, and publish proposals
    Autofix {
        /// Grouping policy for bundle formation
        #[arg(long, value_enum, default_value_t = GroupPolicy::Component)]
        group_by: GroupPolicy,
        /// Concurrent pipelines
        #[arg(long, default_value = "2", value_parser = clap::value_parser!(u16).range(1..))]
        max_parallel: u16,
        /// Per-bundle attempt cap (defaults to checks.max_retries)
        #[arg(long)]
        max_retries: Option<u32>,
        /// Preview without creating worktrees, commits, or proposals
        #[arg(long)]
        dry_run: bool,
        /// Base branch for new worktree branches
        #[arg(long)]
        base_branch: Option<String>,
        /// Restrict to these defect ids (comma-separated)
        #[arg(long, value_delimiter = ',')]
        issues: Vec<u64>,
        /// Process every defect carrying the auto-fix label
        #[arg(long)]
        all: bool,
        /// Cap on defects per bundle
        #[arg(long, default_value = "5", value_parser = clap::value_parser!(u16).range(1..))]
        max_bundle_size: u16,
        /// Buckets smaller than this land in the ungrouped residue
        #[arg(long, default_value = "1", value_parser = clap::value_parser!(u16).range(1..))]
        min_bundle_size: u16,
        /// Emit the run report as JSON instead of the console rendering
        #[arg(long)]
        json: bool,
    },
    /// List candidate defects and preview the grouping without running
    Triage {
        /// Grouping policy for the preview
        #[arg(long, value_enum, default_value_t = GroupPolicy::Component)]
        group_by: GroupPolicy,
    },
}
