//! Per-bundle pipeline: the ordered stages that take a bundle from defect
//! list to published change proposal.
//!
//! Stage failures never cross stage boundaries as panics or early returns
//! out of the pipeline; they are captured into the context and the driver
//! decides whether to advance, stop, or fall through to cleanup. Cleanup
//! runs on every exit path.

pub mod commit;
pub mod publish;

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{
    analysis_prompt, fix_prompt, AgentError, AgentRequest, AnalysisResult, Complexity, FixResult,
    FixingAgent, RetryContext,
};
use crate::budget::BudgetTracker;
use crate::bundling::Bundle;
use crate::checks::{install_dependencies, CheckRun, CheckRunner};
use crate::errors::FixwrightError;
use crate::host::{HostApi, Publication, PublicationRequest};
use crate::reporter::{ProgressReporter, ReportEvent};
use crate::worktree::{run_git_in, LeaseStatus, WorktreeLease, WorktreeManager};

pub use commit::{generate_commit_message, parse_shortstat, validate_commit_message, DiffStat};
pub use publish::{generate_pr_body, generate_pr_title};

/// Confidence floor below which a high-complexity analysis is not acted on.
const MIN_CONFIDENCE_FOR_HIGH_COMPLEXITY: f64 = 0.2;
/// Per-call budget handed to the agent when the bundle cap is absent.
const DEFAULT_CALL_BUDGET_USD: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    WorktreeCreate,
    Analysis,
    Fix,
    InstallDeps,
    Checks,
    Commit,
    Publish,
    UpdateSources,
    Cleanup,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::WorktreeCreate => "worktree-create",
            Stage::Analysis => "analysis",
            Stage::Fix => "fix",
            Stage::InstallDeps => "install-deps",
            Stage::Checks => "checks",
            Stage::Commit => "commit",
            Stage::Publish => "publish",
            Stage::UpdateSources => "update-sources",
            Stage::Cleanup => "cleanup",
        }
    }

    /// Coarse completion percentage once the stage begins.
    pub fn progress(self) -> u8 {
        match self {
            Stage::WorktreeCreate => 10,
            Stage::Analysis => 25,
            Stage::Fix => 45,
            Stage::InstallDeps => 55,
            Stage::Checks => 70,
            Stage::Commit => 80,
            Stage::Publish => 90,
            Stage::UpdateSources => 95,
            Stage::Cleanup => 100,
        }
    }

    /// Write stages skipped in dry-run mode; analysis and the
    /// pre-verification stages still run there.
    pub fn skipped_in_dry_run(self) -> bool {
        matches!(
            self,
            Stage::Fix | Stage::Commit | Stage::Publish | Stage::UpdateSources
        )
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A captured stage failure.
#[derive(Debug, Clone, Serialize)]
pub struct StageError {
    pub stage: Stage,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub recoverable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleStatus {
    Completed,
    Failed,
    Skipped,
}

/// Terminal outcome for one bundle, emitted exactly once.
#[derive(Debug, Clone, Serialize)]
pub struct BundleResult {
    pub bundle: Bundle,
    pub status: BundleStatus,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub publication: Option<Publication>,
    pub error: Option<String>,
    pub error_details: Vec<StageError>,
    /// Last verifier pass, consulted by the retry decision.
    pub check_run: Option<CheckRun>,
    /// True when the failure looked transient (agent rate limit).
    pub retriable: bool,
    /// Summary hint set by the queue once retries are exhausted.
    pub recoverable: Option<bool>,
}

impl BundleResult {
    pub fn skipped(bundle: Bundle, reason: &str) -> Self {
        let now = Utc::now();
        Self {
            bundle,
            status: BundleStatus::Skipped,
            attempts: 0,
            started_at: now,
            finished_at: now,
            publication: None,
            error: Some(reason.to_string()),
            error_details: Vec::new(),
            check_run: None,
            retriable: false,
            recoverable: None,
        }
    }

    pub fn bundle_id(&self) -> &str {
        &self.bundle.id
    }
}

/// Mutable state threaded through one pipeline run. Later stages read
/// earlier fields only after the owning stage completed.
#[derive(Debug)]
pub struct PipelineContext {
    pub bundle: Bundle,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub lease: Option<WorktreeLease>,
    pub analysis: Option<AnalysisResult>,
    pub fix: Option<FixResult>,
    pub check_run: Option<CheckRun>,
    pub diff: DiffStat,
    pub changed_files: Vec<String>,
    pub publication: Option<Publication>,
    pub errors: Vec<StageError>,
    pub current_stage: Option<Stage>,
    pub cancelled: bool,
    pub retriable: bool,
}

impl PipelineContext {
    fn new(bundle: Bundle, attempt: u32) -> Self {
        Self {
            bundle,
            attempt,
            started_at: Utc::now(),
            lease: None,
            analysis: None,
            fix: None,
            check_run: None,
            diff: DiffStat::default(),
            changed_files: Vec::new(),
            publication: None,
            errors: Vec::new(),
            current_stage: None,
            cancelled: false,
            retriable: false,
        }
    }

    fn push_error(&mut self, stage: Stage, message: impl Into<String>, recoverable: bool) {
        self.errors.push(StageError {
            stage,
            message: message.into(),
            timestamp: Utc::now(),
            recoverable,
        });
    }
}

#[derive(Default)]
struct RetryState {
    analysis: Option<AnalysisResult>,
    feedback: Option<RetryContext>,
}

/// Executes the ordered stages for one bundle.
pub struct Pipeline {
    worktrees: std::sync::Arc<WorktreeManager>,
    agent: std::sync::Arc<dyn FixingAgent>,
    checks: CheckRunner,
    budget: std::sync::Arc<BudgetTracker>,
    host: std::sync::Arc<dyn HostApi>,
    reporter: std::sync::Arc<ProgressReporter>,
    base_branch: String,
    /// Analysis cache and failed-check feedback carried across attempts.
    retry_state: Mutex<HashMap<String, RetryState>>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worktrees: std::sync::Arc<WorktreeManager>,
        agent: std::sync::Arc<dyn FixingAgent>,
        checks: CheckRunner,
        budget: std::sync::Arc<BudgetTracker>,
        host: std::sync::Arc<dyn HostApi>,
        reporter: std::sync::Arc<ProgressReporter>,
        base_branch: String,
    ) -> Self {
        Self {
            worktrees,
            agent,
            checks,
            budget,
            host,
            reporter,
            base_branch,
            retry_state: Mutex::new(HashMap::new()),
        }
    }

    /// Run the full stage sequence for `bundle`. Cleanup runs regardless of
    /// how far the run got.
    pub async fn process(
        &self,
        bundle: Bundle,
        attempt: u32,
        cancel: CancellationToken,
    ) -> BundleResult {
        let mut ctx = PipelineContext::new(bundle, attempt);
        self.reporter.emit(ReportEvent::GroupStart {
            bundle_id: ctx.bundle.id.clone(),
            attempt,
        });

        self.run_stages(&mut ctx, &cancel).await;
        self.stage_cleanup(&mut ctx).await;

        let succeeded = ctx.publication.is_some();
        let status = if succeeded {
            BundleStatus::Completed
        } else {
            BundleStatus::Failed
        };
        let error = if succeeded {
            None
        } else {
            summarize_errors(&ctx.errors)
        };

        // Carry failed-check feedback into the next attempt's fix prompt.
        if !succeeded {
            if let Some(run) = &ctx.check_run {
                if !run.failed_checks().is_empty() {
                    let mut state = self.retry_state.lock().unwrap();
                    state
                        .entry(ctx.bundle.id.clone())
                        .or_default()
                        .feedback = Some(RetryContext::from_check_run(attempt, run));
                }
            }
        }

        BundleResult {
            status,
            attempts: attempt,
            started_at: ctx.started_at,
            finished_at: Utc::now(),
            publication: ctx.publication,
            error,
            error_details: ctx.errors,
            check_run: ctx.check_run,
            retriable: ctx.retriable,
            recoverable: None,
            bundle: ctx.bundle,
        }
    }

    async fn run_stages(&self, ctx: &mut PipelineContext, cancel: &CancellationToken) {
        if self.stage_worktree_create(ctx, cancel).await.is_err() {
            return;
        }
        if self.stage_analysis(ctx, cancel).await.is_err() {
            return;
        }
        if self.stage_fix(ctx, cancel).await.is_err() {
            return;
        }
        if self.stage_install_deps(ctx, cancel).await.is_err() {
            return;
        }
        if self.stage_checks(ctx, cancel).await.is_err() {
            return;
        }
        if self.stage_commit(ctx, cancel).await.is_err() {
            return;
        }
        if self.stage_publish(ctx, cancel).await.is_err() {
            return;
        }
        // Non-fatal: annotation failures are logged into the trail only.
        self.stage_update_sources(ctx, cancel).await;
    }

    /// Mark the stage started; abort early when the token already fired.
    fn enter_stage(
        &self,
        ctx: &mut PipelineContext,
        stage: Stage,
        cancel: &CancellationToken,
    ) -> Result<(), ()> {
        if cancel.is_cancelled() {
            ctx.cancelled = true;
            ctx.push_error(stage, "interrupted", false);
            return Err(());
        }
        ctx.current_stage = Some(stage);
        self.reporter.emit(ReportEvent::GroupStage {
            bundle_id: ctx.bundle.id.clone(),
            stage,
            progress: stage.progress(),
        });
        Ok(())
    }

    async fn stage_worktree_create(
        &self,
        ctx: &mut PipelineContext,
        cancel: &CancellationToken,
    ) -> Result<(), ()> {
        self.enter_stage(ctx, Stage::WorktreeCreate, cancel)?;
        match self
            .worktrees
            .acquire(
                &ctx.bundle.proposed_branch,
                &ctx.bundle.defect_ids(),
                &self.base_branch,
            )
            .await
        {
            Ok(lease) => {
                ctx.lease = Some(lease);
                Ok(())
            }
            Err(e) => {
                ctx.push_error(Stage::WorktreeCreate, e.to_string(), false);
                Err(())
            }
        }
    }

    async fn stage_analysis(
        &self,
        ctx: &mut PipelineContext,
        cancel: &CancellationToken,
    ) -> Result<(), ()> {
        self.enter_stage(ctx, Stage::Analysis, cancel)?;
        let bundle_id = ctx.bundle.id.clone();

        if !self.budget.can_spend(&bundle_id, 0.0) {
            let error = self.budget_exceeded_error(&bundle_id);
            ctx.push_error(Stage::Analysis, error.to_string(), false);
            return Err(());
        }

        // Reuse the first attempt's analysis on retries.
        if ctx.attempt > 1 {
            let state = self.retry_state.lock().unwrap();
            if let Some(analysis) = state.get(&bundle_id).and_then(|s| s.analysis.clone()) {
                debug!(bundle_id = %bundle_id, "reusing cached analysis for retry");
                ctx.analysis = Some(analysis);
                return Ok(());
            }
        }

        let lease = ctx.lease.as_ref().expect("worktree stage completed");
        let request = AgentRequest {
            model_tier: self.budget.current_model_tier(),
            max_budget_usd: self.per_call_budget(&bundle_id),
            workdir: lease.path.clone(),
            prompt: analysis_prompt(&ctx.bundle),
        };

        let invocation = match self.agent.analyze(&request, cancel).await {
            Ok(invocation) => invocation,
            Err(AgentError::Parse(first)) => {
                // Parse failures are retried once before giving up.
                warn!(bundle_id = %bundle_id, error = %first, "analysis parse error, retrying once");
                match self.agent.analyze(&request, cancel).await {
                    Ok(invocation) => invocation,
                    Err(e) => return self.fail_agent(ctx, Stage::Analysis, e),
                }
            }
            Err(e) => return self.fail_agent(ctx, Stage::Analysis, e),
        };

        self.budget.add_cost(&bundle_id, invocation.usage.cost_usd);
        let analysis = invocation.result;

        if analysis.complexity == Complexity::High
            && analysis.confidence < MIN_CONFIDENCE_FOR_HIGH_COMPLEXITY
        {
            ctx.push_error(
                Stage::Analysis,
                format!(
                    "not actionable: high complexity at confidence {:.2}",
                    analysis.confidence
                ),
                false,
            );
            return Err(());
        }

        self.retry_state
            .lock()
            .unwrap()
            .entry(bundle_id)
            .or_default()
            .analysis = Some(analysis.clone());
        ctx.analysis = Some(analysis);
        Ok(())
    }

    async fn stage_fix(
        &self,
        ctx: &mut PipelineContext,
        cancel: &CancellationToken,
    ) -> Result<(), ()> {
        self.enter_stage(ctx, Stage::Fix, cancel)?;
        let bundle_id = ctx.bundle.id.clone();

        if !self.budget.can_spend(&bundle_id, 0.0) {
            let error = self.budget_exceeded_error(&bundle_id);
            ctx.push_error(Stage::Fix, error.to_string(), false);
            return Err(());
        }

        let feedback = {
            let state = self.retry_state.lock().unwrap();
            state.get(&bundle_id).and_then(|s| s.feedback.clone())
        };
        let (lease_id, lease_path) = {
            let lease = ctx.lease.as_ref().expect("worktree stage completed");
            (lease.id.clone(), lease.path.clone())
        };
        self.worktrees
            .update_status(&lease_id, LeaseStatus::InUse)
            .ok();

        let request = AgentRequest {
            model_tier: self.budget.current_model_tier(),
            max_budget_usd: self.per_call_budget(&bundle_id),
            workdir: lease_path.clone(),
            prompt: fix_prompt(&ctx.bundle, ctx.analysis.as_ref(), feedback.as_ref()),
        };

        let invocation = match self.agent.apply_fix(&request, cancel).await {
            Ok(invocation) => invocation,
            Err(AgentError::Parse(first)) => {
                warn!(bundle_id = %bundle_id, error = %first, "fix parse error, retrying once");
                match self.agent.apply_fix(&request, cancel).await {
                    Ok(invocation) => invocation,
                    Err(e) => return self.fail_agent(ctx, Stage::Fix, e),
                }
            }
            Err(e) => return self.fail_agent(ctx, Stage::Fix, e),
        };

        self.budget.add_cost(&bundle_id, invocation.usage.cost_usd);
        let fix = invocation.result;

        if !fix.success {
            ctx.push_error(
                Stage::Fix,
                format!("agent did not produce a fix: {}", fix.summary),
                false,
            );
            ctx.fix = Some(fix);
            return Err(());
        }

        // The agent's word is not enough; the working copy must differ.
        match run_git_in(&lease_path, &["status", "--porcelain"]).await {
            Ok(output) if output.trim().is_empty() => {
                ctx.push_error(
                    Stage::Fix,
                    "agent reported success but the working copy is unchanged",
                    false,
                );
                ctx.fix = Some(fix);
                return Err(());
            }
            Ok(output) => {
                ctx.changed_files = output
                    .lines()
                    .filter_map(|l| l.get(3..))
                    .map(str::to_string)
                    .collect();
            }
            Err(e) => {
                ctx.push_error(Stage::Fix, format!("could not inspect working copy: {e}"), false);
                return Err(());
            }
        }

        ctx.fix = Some(fix);
        Ok(())
    }

    async fn stage_install_deps(
        &self,
        ctx: &mut PipelineContext,
        cancel: &CancellationToken,
    ) -> Result<(), ()> {
        self.enter_stage(ctx, Stage::InstallDeps, cancel)?;
        let lease = ctx.lease.as_ref().expect("worktree stage completed");
        match install_dependencies(&lease.path, cancel).await {
            Ok(()) => Ok(()),
            Err(message) => {
                ctx.push_error(Stage::InstallDeps, message, false);
                Err(())
            }
        }
    }

    async fn stage_checks(
        &self,
        ctx: &mut PipelineContext,
        cancel: &CancellationToken,
    ) -> Result<(), ()> {
        self.enter_stage(ctx, Stage::Checks, cancel)?;
        if !self.checks.has_checks() {
            debug!(bundle_id = %ctx.bundle.id, "no checks configured, skipping verification");
            ctx.check_run = Some(CheckRun::default());
            return Ok(());
        }

        let lease = ctx.lease.as_ref().expect("worktree stage completed");
        self.worktrees
            .update_status(&lease.id, LeaseStatus::Checking)
            .ok();
        let run = self.checks.run(&lease.path, cancel).await;
        let failed: Vec<String> = run
            .failed_checks()
            .iter()
            .map(|c| c.kind.as_str().to_string())
            .collect();
        let passed = run.passed();
        ctx.check_run = Some(run);

        if cancel.is_cancelled() {
            ctx.cancelled = true;
            ctx.push_error(Stage::Checks, "interrupted", false);
            return Err(());
        }
        if passed {
            Ok(())
        } else {
            let error = FixwrightError::CheckFailed { failed };
            ctx.push_error(Stage::Checks, error.to_string(), error.is_retriable());
            Err(())
        }
    }

    async fn stage_commit(
        &self,
        ctx: &mut PipelineContext,
        cancel: &CancellationToken,
    ) -> Result<(), ()> {
        self.enter_stage(ctx, Stage::Commit, cancel)?;
        let lease = ctx.lease.as_ref().expect("worktree stage completed");
        self.worktrees
            .update_status(&lease.id, LeaseStatus::Committing)
            .ok();

        let message = generate_commit_message(&ctx.bundle.defects, &ctx.changed_files);
        debug_assert!(validate_commit_message(&message));

        let path = lease.path.clone();
        if let Err(e) = run_git_in(&path, &["add", "-A"]).await {
            ctx.push_error(Stage::Commit, format!("git add failed: {e}"), false);
            return Err(());
        }
        let commit = run_git_in(
            &path,
            &[
                "-c",
                "user.name=fixwright",
                "-c",
                "user.email=fixwright@localhost",
                "commit",
                "-m",
                &message,
            ],
        )
        .await;
        if let Err(e) = commit {
            ctx.push_error(Stage::Commit, format!("git commit failed: {e}"), false);
            return Err(());
        }

        let range = format!("{}..HEAD", self.base_branch);
        if let Ok(output) = run_git_in(&path, &["diff", "--shortstat", &range]).await {
            ctx.diff = parse_shortstat(&output);
        }
        info!(bundle_id = %ctx.bundle.id, files = ctx.changed_files.len(), "change committed");
        Ok(())
    }

    async fn stage_publish(
        &self,
        ctx: &mut PipelineContext,
        cancel: &CancellationToken,
    ) -> Result<(), ()> {
        self.enter_stage(ctx, Stage::Publish, cancel)?;
        let request = PublicationRequest {
            title: generate_pr_title(&ctx.bundle),
            head_branch: ctx.bundle.proposed_branch.clone(),
            base_branch: self.base_branch.clone(),
            body: generate_pr_body(
                &ctx.bundle,
                ctx.fix.as_ref(),
                ctx.check_run.as_ref(),
                ctx.diff,
            ),
            issue_ids: ctx.bundle.defect_ids(),
        };
        match self.host.publish(&request).await {
            Ok(publication) => {
                info!(bundle_id = %ctx.bundle.id, url = %publication.url, "publication opened");
                ctx.publication = Some(publication);
                Ok(())
            }
            Err(e) => {
                ctx.push_error(Stage::Publish, e.to_string(), false);
                Err(())
            }
        }
    }

    async fn stage_update_sources(&self, ctx: &mut PipelineContext, cancel: &CancellationToken) {
        if self.enter_stage(ctx, Stage::UpdateSources, cancel).is_err() {
            return;
        }
        let Some(publication) = &ctx.publication else {
            return;
        };
        let note = format!(
            "🤖 Automated fix published: {} (bundle `{}`)",
            publication.url, ctx.bundle.id
        );
        for defect_id in ctx.bundle.defect_ids() {
            if let Err(e) = self.host.comment_defect(defect_id, &note).await {
                warn!(defect_id, error = %e, "failed to annotate defect");
                ctx.push_error(
                    Stage::UpdateSources,
                    format!("defect #{defect_id}: {e}"),
                    true,
                );
            }
        }
    }

    /// Cleanup always runs: release the lease, keeping the branch only when
    /// a publication was opened. Failures are logged and swallowed.
    async fn stage_cleanup(&self, ctx: &mut PipelineContext) {
        ctx.current_stage = Some(Stage::Cleanup);
        let Some(lease) = ctx.lease.take() else {
            return;
        };
        self.worktrees
            .update_status(&lease.id, LeaseStatus::Cleaning)
            .ok();
        let result = if ctx.publication.is_some() {
            self.worktrees.release(&lease.id).await
        } else {
            self.worktrees.release_and_clean_branch(&lease.id).await
        };
        if let Err(e) = result {
            warn!(lease_id = %lease.id, error = %e, "lease cleanup failed");
            ctx.push_error(Stage::Cleanup, e.to_string(), true);
        }
    }

    /// Map an agent failure into the error taxonomy and capture it.
    fn fail_agent(
        &self,
        ctx: &mut PipelineContext,
        stage: Stage,
        error: AgentError,
    ) -> Result<(), ()> {
        if error.is_rate_limited() {
            ctx.retriable = true;
        }
        let mapped = match error {
            AgentError::CliNotFound(path) => FixwrightError::CliNotFound(path),
            AgentError::Timeout(duration) => FixwrightError::AgentTimeout {
                operation: stage.as_str().to_string(),
                seconds: duration.as_secs(),
            },
            AgentError::RateLimited(_) => FixwrightError::ApiRateLimited {
                service: "fixing-agent".to_string(),
            },
            AgentError::Parse(message) => FixwrightError::AgentParse(message),
            AgentError::Failed { exit_code, stderr } => {
                let detail = format!("exit {exit_code}: {stderr}");
                if stage == Stage::Fix {
                    FixwrightError::FixFailed(detail)
                } else {
                    FixwrightError::AnalysisFailed(detail)
                }
            }
            AgentError::Interrupted => {
                ctx.cancelled = true;
                FixwrightError::Interrupted
            }
            AgentError::Io(e) => FixwrightError::Io(e),
        };
        ctx.push_error(stage, mapped.to_string(), mapped.is_retriable());
        Err(())
    }

    fn budget_exceeded_error(&self, bundle_id: &str) -> FixwrightError {
        let snapshot = self.budget.snapshot();
        let bundle_spent = if snapshot.current_bundle.as_deref() == Some(bundle_id) {
            snapshot.bundle_cost
        } else {
            0.0
        };
        match snapshot.max_per_bundle {
            Some(cap) if bundle_spent > cap => FixwrightError::BudgetExceeded {
                scope: format!("bundle {bundle_id}"),
                spent: bundle_spent,
                cap,
            },
            _ => FixwrightError::BudgetExceeded {
                scope: "session".to_string(),
                spent: snapshot.session_cost,
                cap: snapshot.max_per_session.unwrap_or(f64::INFINITY),
            },
        }
    }

    fn per_call_budget(&self, bundle_id: &str) -> f64 {
        let snapshot = self.budget.snapshot();
        let spent = if snapshot.current_bundle.as_deref() == Some(bundle_id) {
            snapshot.bundle_cost
        } else {
            0.0
        };
        snapshot
            .max_per_bundle
            .map(|cap| (cap - spent).max(0.0))
            .unwrap_or(DEFAULT_CALL_BUDGET_USD)
    }
}

fn summarize_errors(errors: &[StageError]) -> Option<String> {
    match errors {
        [] => Some("failed without a recorded stage error".to_string()),
        [single] => Some(format!("{}: {}", single.stage, single.message)),
        many => {
            let aggregate = FixwrightError::PipelineFailed {
                errors: many
                    .iter()
                    .map(|e| format!("{}: {}", e.stage, e.message))
                    .collect(),
            };
            Some(format!(
                "{aggregate}; first: {}: {}",
                many[0].stage, many[0].message
            ))
        }
    }
}
