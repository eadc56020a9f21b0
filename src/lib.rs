// fixwright library surface: the core subsystems, exposed for the binary
// and the integration test suites.

pub mod agent;
pub mod budget;
pub mod bundling;
pub mod checks;
pub mod cli;
pub mod config;
pub mod defects;
pub mod dryrun;
pub mod errors;
pub mod exceptions;
pub mod host;
pub mod orchestrator;
pub mod pipeline;
pub mod queue;
pub mod reporter;
pub mod rpc;
pub mod shutdown;
pub mod telemetry;
pub mod tracker;
pub mod worktree;

// Re-export key types for easy access
pub use agent::{
    AgentError, AgentInvocation, AgentRequest, AgentUsage, AnalysisResult, CliFixingAgent,
    Complexity, FixResult, FixingAgent, RetryContext,
};
pub use budget::{BudgetSnapshot, BudgetTracker, LOWEST_TIER};
pub use bundling::{group_defects, Bundle, GroupPolicy, GroupingOptions, GroupingOutcome};
pub use checks::{CheckKind, CheckResult, CheckRun, CheckRunner, CheckStatus};
pub use config::{config, FixwrightConfig};
pub use defects::{Defect, DefectKind, DefectOrigin, DefectPriority, DefectState, DefectStore};
pub use dryrun::DryRunSimulator;
pub use errors::FixwrightError;
pub use exceptions::ExceptionsClient;
pub use host::{DefectFilter, GitHubHost, HostApi, Publication, PublicationRequest};
pub use orchestrator::{Orchestrator, RunOptions, RunReport};
pub use pipeline::{
    generate_commit_message, generate_pr_body, generate_pr_title, validate_commit_message,
    BundleResult, BundleStatus, Pipeline, Stage, StageError,
};
pub use queue::{backoff_delay, should_retry, ProcessingQueue, QueueEvent, QueueStats};
pub use reporter::{ProgressReporter, ProgressStatus, ReportEvent};
pub use shutdown::{with_cleanup, InterruptHandler, INTERRUPTED_EXIT_CODE};
pub use telemetry::init_telemetry;
pub use tracker::{TaskPatch, TrackerClient, TrackerTask};
pub use worktree::{LeaseStatus, WorktreeLease, WorktreeManager};
