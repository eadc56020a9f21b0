use thiserror::Error;

/// Error taxonomy for the remediation workflow.
///
/// Variants are grouped by category; `user_action` maps each category to a
/// short actionable hint shown at the end of a run.
#[derive(Debug, Error)]
pub enum FixwrightError {
    // Configuration errors are terminal and reported before any side effect.
    #[error("configuration file not found at {path}")]
    ConfigMissing { path: String },

    #[error("configuration parse failure: {0}")]
    ConfigParse(String),

    #[error("configuration invalid:\n{}", .problems.join("\n"))]
    ConfigValidation { problems: Vec<String> },

    // External API errors. Rate-limited and generic are retriable with
    // backoff inside the client adapters.
    #[error("authentication with {service} failed: {message}")]
    ApiAuthFailed { service: String, message: String },

    #[error("{service} rate limit exceeded")]
    ApiRateLimited { service: String },

    #[error("{service}: {resource} not found")]
    ApiNotFound { service: String, resource: String },

    #[error("{service} API error: {message}")]
    ApiError { service: String, message: String },

    // Worktree errors. Creation is terminal for the bundle; cleanup
    // failures are logged and swallowed by the manager.
    #[error("worktree creation failed for branch '{branch}': {message}")]
    WorktreeCreation { branch: String, message: String },

    #[error("worktree cleanup failed for lease {lease_id}: {message}")]
    WorktreeCleanup { lease_id: String, message: String },

    #[error("branch '{0}' already exists")]
    BranchExists(String),

    #[error("invalid worktree path: {0}")]
    WorktreeInvalidPath(String),

    #[error("no worktree lease with id {0}")]
    WorktreeNotFound(String),

    #[error("maximum concurrent worktrees ({0}) exceeded")]
    MaxConcurrentExceeded(usize),

    // Verifier stage reported failure; retriable at the queue level.
    #[error("checks failed: {}", .failed.join(", "))]
    CheckFailed { failed: Vec<String> },

    // Fixing-agent errors.
    #[error("agent analysis failed: {0}")]
    AnalysisFailed(String),

    #[error("agent fix failed: {0}")]
    FixFailed(String),

    #[error("budget exceeded for {scope}: spent {spent:.4} of {cap:.4} USD")]
    BudgetExceeded { scope: String, spent: f64, cap: f64 },

    #[error("could not parse agent output: {0}")]
    AgentParse(String),

    #[error("agent timed out after {seconds}s during {operation}")]
    AgentTimeout { operation: String, seconds: u64 },

    #[error("fixing-agent executable '{0}' not found on PATH")]
    CliNotFound(String),

    // Aggregate of stage errors when multiple occurred.
    #[error("pipeline failed with {} stage error(s)", .errors.len())]
    PipelineFailed { errors: Vec<String> },

    #[error("duplicate proposed branches across bundles: {}", .branches.join(", "))]
    ConflictsDetected { branches: Vec<String> },

    // User cancellation.
    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FixwrightError {
    /// Whether the error may resolve on its own if the operation is retried.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            FixwrightError::ApiRateLimited { .. }
                | FixwrightError::ApiError { .. }
                | FixwrightError::CheckFailed { .. }
                | FixwrightError::AgentParse(_)
        )
    }

    /// Short user-facing hint for the error category.
    pub fn user_action(&self) -> &'static str {
        match self {
            FixwrightError::ConfigMissing { .. }
            | FixwrightError::ConfigParse(_)
            | FixwrightError::ConfigValidation { .. } => {
                "fix fixwright.toml (run `fixwright init` to regenerate a scaffold)"
            }
            FixwrightError::ApiAuthFailed { .. } => "check tokens (gh auth status, FIXWRIGHT_HOST_TOKEN)",
            FixwrightError::ApiRateLimited { .. } => "wait and retry",
            FixwrightError::ApiNotFound { .. } => "verify owner/repo and workspace ids in config",
            FixwrightError::ApiError { .. } => "retry; check service status if it persists",
            FixwrightError::WorktreeCreation { .. } | FixwrightError::WorktreeInvalidPath(_) => {
                "check worktree.base_dir is writable and inside a git checkout"
            }
            FixwrightError::BranchExists(_) => "delete the existing branch",
            FixwrightError::WorktreeCleanup { .. } | FixwrightError::WorktreeNotFound(_) => {
                "run `git worktree prune` and remove stale autofix-* directories"
            }
            FixwrightError::MaxConcurrentExceeded(_) => "lower --max-parallel or raise worktree.max_concurrent",
            FixwrightError::CheckFailed { .. } => "fix the failing checks (type errors, lint, tests)",
            FixwrightError::AnalysisFailed(_) | FixwrightError::FixFailed(_) => {
                "inspect the agent output; the defect may need a human"
            }
            FixwrightError::BudgetExceeded { .. } => "raise ai.max_budget_per_issue / per_session",
            FixwrightError::AgentParse(_) => "retry; upgrade the agent CLI if it persists",
            FixwrightError::AgentTimeout { .. } => "retry, or raise the stage timeout",
            FixwrightError::CliNotFound(_) => "install the agent CLI or set ai.cli_path",
            FixwrightError::PipelineFailed { .. } => "see the per-stage error trail in the report",
            FixwrightError::ConflictsDetected { .. } => "narrow --issues or change --group-by",
            FixwrightError::Interrupted => "re-run to resume; completed bundles are already published",
            FixwrightError::Io(_) => "check filesystem permissions and free space",
        }
    }
}

pub type Result<T> = std::result::Result<T, FixwrightError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_categories() {
        assert!(FixwrightError::ApiRateLimited {
            service: "github".into()
        }
        .is_retriable());
        assert!(FixwrightError::CheckFailed {
            failed: vec!["test".into()]
        }
        .is_retriable());
        assert!(FixwrightError::AgentParse("bad json".into()).is_retriable());
        assert!(!FixwrightError::CliNotFound("claude".into()).is_retriable());
        assert!(!FixwrightError::BudgetExceeded {
            scope: "bundle b1".into(),
            spent: 0.02,
            cap: 0.01
        }
        .is_retriable());
    }

    #[test]
    fn every_error_has_an_action() {
        let errors = vec![
            FixwrightError::BranchExists("fix/auth-1".into()),
            FixwrightError::Interrupted,
            FixwrightError::ConflictsDetected {
                branches: vec!["fix/auth-1".into()],
            },
        ];
        for e in errors {
            assert!(!e.user_action().is_empty());
        }
    }
}
