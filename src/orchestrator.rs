//! Top-level run sequence: fetch defects, group, pre-check conflicts, drive
//! the queue with the pipeline as processor, and compose the final report.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::agent::FixingAgent;
use crate::budget::BudgetTracker;
use crate::bundling::{group_defects, Bundle, GroupPolicy, GroupingOptions};
use crate::checks::CheckRunner;
use crate::config::FixwrightConfig;
use crate::defects::Defect;
use crate::dryrun::DryRunSimulator;
use crate::errors::FixwrightError;
use crate::exceptions::ExceptionsClient;
use crate::host::{DefectFilter, HostApi};
use crate::pipeline::{BundleResult, BundleStatus, Pipeline};
use crate::queue::{ProcessingQueue, Processor, QueueEvent};
use crate::reporter::{FailedCheck, ProgressReporter, ReportEvent};
use crate::shutdown::{with_cleanup, InterruptHandler, INTERRUPTED_EXIT_CODE};
use crate::worktree::WorktreeManager;

/// Everything the `autofix` command can override per run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub group_by: GroupPolicy,
    pub max_parallel: usize,
    pub max_retries: Option<u32>,
    pub dry_run: bool,
    pub base_branch: Option<String>,
    pub issue_ids: Vec<u64>,
    pub all: bool,
    pub max_bundle_size: usize,
    pub min_bundle_size: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            group_by: GroupPolicy::Component,
            max_parallel: 2,
            max_retries: None,
            dry_run: false,
            base_branch: None,
            issue_ids: Vec::new(),
            all: false,
            max_bundle_size: 5,
            min_bundle_size: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BundleSummary {
    pub bundle_id: String,
    pub name: String,
    pub status: BundleStatus,
    pub attempts: u32,
    pub publication_url: Option<String>,
    pub error: Option<String>,
    pub failed_checks: Vec<String>,
    pub recoverable: Option<bool>,
}

/// Structured result of one orchestrator run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub interrupted: bool,
    pub duration_ms: u64,
    pub session_cost_usd: f64,
    pub ungrouped: usize,
    pub bundles: Vec<BundleSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

impl RunReport {
    pub fn summary_line(&self) -> String {
        format!("{}/{} completed", self.completed, self.total)
    }

    /// 0 when at least one bundle completed, 130 on interrupt, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.interrupted {
            INTERRUPTED_EXIT_CODE
        } else if self.completed > 0 || self.total == 0 {
            0
        } else {
            1
        }
    }

    /// Console rendering used by the CLI.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "\n📊 Autofix run: {} ({} failed, {} skipped, {} ungrouped)\n",
            self.summary_line(),
            self.failed,
            self.skipped,
            self.ungrouped
        ));
        out.push_str(&format!(
            "   duration: {:.1}s   agent spend: ${:.4}\n",
            self.duration_ms as f64 / 1000.0,
            self.session_cost_usd
        ));
        if self.interrupted {
            out.push_str("   ⚠️  run was interrupted; partial results above\n");
        }
        for bundle in &self.bundles {
            let icon = match bundle.status {
                BundleStatus::Completed => "✅",
                BundleStatus::Failed => "❌",
                BundleStatus::Skipped => "⏭",
            };
            out.push_str(&format!(
                "   {icon} {} (attempts: {})",
                bundle.name, bundle.attempts
            ));
            if let Some(url) = &bundle.publication_url {
                out.push_str(&format!(" → {url}"));
            }
            if let Some(error) = &bundle.error {
                out.push_str(&format!(" - {error}"));
            }
            if !bundle.failed_checks.is_empty() {
                out.push_str(&format!(
                    " [failed checks: {}]",
                    bundle.failed_checks.join(", ")
                ));
            }
            if bundle.recoverable == Some(false) {
                out.push_str(" (regressing between attempts; not worth retrying)");
            }
            out.push('\n');
        }
        if let Some(preview) = &self.preview {
            out.push('\n');
            out.push_str(preview);
        }
        out
    }
}

/// Wires grouper, queue, pipeline, worktrees, budget, and reporter together.
pub struct Orchestrator {
    config: FixwrightConfig,
    host: Arc<dyn HostApi>,
    agent: Arc<dyn FixingAgent>,
    reporter: Arc<ProgressReporter>,
    interrupts: Arc<InterruptHandler>,
    repo_root: PathBuf,
}

impl Orchestrator {
    pub fn new(
        config: FixwrightConfig,
        host: Arc<dyn HostApi>,
        agent: Arc<dyn FixingAgent>,
        interrupts: Arc<InterruptHandler>,
        repo_root: impl Into<PathBuf>,
        verbose: bool,
    ) -> Self {
        Self {
            config,
            host,
            agent,
            reporter: Arc::new(ProgressReporter::new(verbose)),
            interrupts,
            repo_root: repo_root.into(),
        }
    }

    pub fn reporter(&self) -> Arc<ProgressReporter> {
        Arc::clone(&self.reporter)
    }

    /// Fetch defects per the run options (host filter plus optional
    /// exception-tracker ingestion).
    pub async fn fetch_defects(&self, options: &RunOptions) -> Result<Vec<Defect>, FixwrightError> {
        let filter = DefectFilter {
            require_label: if options.issue_ids.is_empty() {
                Some(self.config.host.auto_fix_label.clone())
            } else {
                // Explicit ids override the opt-in label.
                None
            },
            skip_label: Some(self.config.host.skip_label.clone()),
            ids: options.issue_ids.clone(),
        };
        let mut defects = self.host.fetch_defects(&filter).await?;

        if options.all && options.issue_ids.is_empty() {
            if let Some(exceptions) = &self.config.exceptions {
                match ExceptionsClient::new(exceptions) {
                    Ok(client) => match client.fetch_defects(25).await {
                        Ok(more) => defects.extend(more),
                        Err(e) => warn!(error = %e, "exception ingestion failed, continuing"),
                    },
                    Err(e) => warn!(error = %e, "exception tracker misconfigured, continuing"),
                }
            }
        }
        Ok(defects)
    }

    /// Duplicate proposed branches are terminal; overlapping file sets
    /// across bundles are only a warning.
    fn precheck_conflicts(bundles: &[Bundle]) -> Result<(), FixwrightError> {
        let mut seen: HashMap<&str, &str> = HashMap::new();
        let mut duplicates = Vec::new();
        for bundle in bundles {
            if seen
                .insert(bundle.proposed_branch.as_str(), bundle.id.as_str())
                .is_some()
            {
                duplicates.push(bundle.proposed_branch.clone());
            }
        }
        if !duplicates.is_empty() {
            return Err(FixwrightError::ConflictsDetected {
                branches: duplicates,
            });
        }

        for (i, a) in bundles.iter().enumerate() {
            let files_a: HashSet<&String> = a.related_files.iter().collect();
            for b in &bundles[i + 1..] {
                let overlap: Vec<&String> = b
                    .related_files
                    .iter()
                    .filter(|f| files_a.contains(*f))
                    .collect();
                if !overlap.is_empty() {
                    warn!(
                        bundle_a = %a.id,
                        bundle_b = %b.id,
                        files = ?overlap,
                        "bundles touch overlapping files; proposals may conflict"
                    );
                }
            }
        }
        Ok(())
    }

    pub async fn run(&self, options: RunOptions) -> Result<RunReport, FixwrightError> {
        let started = Instant::now();
        self.config.validate()?;

        let defects = self.fetch_defects(&options).await?;
        let grouping_options = GroupingOptions {
            max_bundle_size: options.max_bundle_size,
            min_bundle_size: options.min_bundle_size,
            ..Default::default()
        };
        let outcome = group_defects(&defects, options.group_by, &grouping_options);
        info!(
            defects = defects.len(),
            bundles = outcome.bundles.len(),
            residue = outcome.residue.len(),
            policy = %options.group_by,
            "grouping complete"
        );

        Self::precheck_conflicts(&outcome.bundles)?;

        let budget = Arc::new(BudgetTracker::new(
            self.config.ai.max_budget_per_issue,
            self.config.ai.max_budget_per_session,
            self.config.ai.preferred_model.clone(),
            self.config.ai.fallback_model.clone(),
        ));

        self.reporter.register_bundles(
            outcome
                .bundles
                .iter()
                .map(|b| b.id.as_str())
                .collect::<Vec<_>>(),
        );
        self.reporter.emit(ReportEvent::Start {
            total_bundles: outcome.bundles.len(),
        });

        let (preview, results) = if options.dry_run {
            let simulator = DryRunSimulator::new(
                Arc::clone(&self.agent),
                Arc::clone(&budget),
                self.repo_root.clone(),
            );
            let (preview, results) = simulator
                .simulate(&outcome.bundles, &self.interrupts.token())
                .await;
            (Some(preview), results)
        } else {
            (None, self.run_queue(&options, outcome.bundles, &budget).await?)
        };

        let interrupted = self.interrupts.is_interrupted();
        if interrupted {
            self.reporter.emit(ReportEvent::Interrupted);
        }

        let report = compose_report(
            results,
            outcome.residue.len(),
            interrupted,
            started.elapsed().as_millis() as u64,
            budget.session_cost(),
            preview,
        );
        self.reporter.emit(ReportEvent::Complete {
            completed: report.completed,
            failed: report.failed,
            skipped: report.skipped,
        });
        Ok(report)
    }

    async fn run_queue(
        &self,
        options: &RunOptions,
        bundles: Vec<Bundle>,
        budget: &Arc<BudgetTracker>,
    ) -> Result<Vec<BundleResult>, FixwrightError> {
        let base_branch = options
            .base_branch
            .clone()
            .unwrap_or_else(|| self.config.host.default_branch.clone());
        let max_retries = options
            .max_retries
            .unwrap_or(self.config.checks.max_retries);
        // More workers than leases would only manufacture spurious
        // max-concurrent failures.
        let max_parallel = options.max_parallel.min(self.config.worktree.max_concurrent);

        let worktrees = Arc::new(WorktreeManager::new(
            self.repo_root.clone(),
            &self.config.worktree,
        )?);
        // Sweep droppings from a previous crashed run before leasing.
        worktrees.cleanup_orphaned().await;

        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&worktrees),
            Arc::clone(&self.agent),
            CheckRunner::new(self.config.checks.clone()),
            Arc::clone(budget),
            Arc::clone(&self.host),
            Arc::clone(&self.reporter),
            base_branch,
        ));

        let cancel = self.interrupts.token();
        let queue = Arc::new(ProcessingQueue::new(max_parallel, max_retries, cancel.clone()));
        queue.enqueue(bundles);

        // Bridge queue events onto the reporter bus.
        let reporter = Arc::clone(&self.reporter);
        queue.on(move |event| match event {
            QueueEvent::ItemCompleted {
                bundle_id,
                publication_url,
            } => reporter.emit(ReportEvent::GroupComplete {
                bundle_id: bundle_id.clone(),
                publication_url: publication_url.clone(),
            }),
            QueueEvent::ItemFailed {
                bundle_id, error, ..
            } => reporter.emit(ReportEvent::GroupFailed {
                bundle_id: bundle_id.clone(),
                error: error.clone(),
            }),
            QueueEvent::ItemRetrying {
                bundle_id,
                next_attempt,
                failed_checks,
                ..
            } => reporter.emit(ReportEvent::GroupRetry {
                bundle_id: bundle_id.clone(),
                attempt: *next_attempt,
                failed_checks: failed_checks
                    .iter()
                    .map(|(check, stderr)| FailedCheck {
                        check: check.clone(),
                        stderr: stderr.clone(),
                    })
                    .collect(),
            }),
            QueueEvent::ItemStarted { .. } => {}
        });

        let pipeline_for_processor = Arc::clone(&pipeline);
        let cancel_for_processor = cancel.clone();
        let processor: Processor = Arc::new(move |bundle, attempt| {
            let pipeline = Arc::clone(&pipeline_for_processor);
            let cancel = cancel_for_processor.clone();
            Box::pin(async move { pipeline.process(bundle, attempt, cancel).await })
        });
        queue.set_processor(processor);

        let cleanup_loop = worktrees.spawn_auto_cleanup(cancel.clone());
        let snapshot_loop = self.spawn_snapshot_loop(cancel.clone());

        // The queue runs under a cleanup guard: whatever happens, every
        // lease is released and the worktree directories disappear.
        let worktrees_for_cleanup = Arc::clone(&worktrees);
        let queue_for_run = Arc::clone(&queue);
        let results = with_cleanup(
            &self.interrupts,
            async move { queue_for_run.start().await },
            move || async move {
                worktrees_for_cleanup.cleanup_all().await;
            },
        )
        .await;

        cleanup_loop.abort();
        if let Some(snapshot_loop) = snapshot_loop {
            snapshot_loop.abort();
        }
        Ok(results)
    }

    fn spawn_snapshot_loop(
        &self,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if !self.reporter.verbose() {
            return None;
        }
        let reporter = Arc::clone(&self.reporter);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = reporter.render_snapshot();
                        if !snapshot.is_empty() {
                            println!("{snapshot}");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        }))
    }
}

fn compose_report(
    results: Vec<BundleResult>,
    ungrouped: usize,
    interrupted: bool,
    duration_ms: u64,
    session_cost_usd: f64,
    preview: Option<String>,
) -> RunReport {
    let completed = results
        .iter()
        .filter(|r| r.status == BundleStatus::Completed)
        .count();
    let failed = results
        .iter()
        .filter(|r| r.status == BundleStatus::Failed)
        .count();
    let skipped = results
        .iter()
        .filter(|r| r.status == BundleStatus::Skipped)
        .count();

    let bundles = results
        .into_iter()
        .map(|result| BundleSummary {
            bundle_id: result.bundle.id.clone(),
            name: result.bundle.name.clone(),
            status: result.status,
            attempts: result.attempts,
            publication_url: result.publication.as_ref().map(|p| p.url.clone()),
            error: result.error.clone(),
            failed_checks: result
                .check_run
                .as_ref()
                .map(|run| {
                    run.failed_checks()
                        .into_iter()
                        .map(|c| c.kind.as_str().to_string())
                        .collect()
                })
                .unwrap_or_default(),
            recoverable: result.recoverable,
        })
        .collect::<Vec<_>>();

    RunReport {
        total: bundles.len(),
        completed,
        failed,
        skipped,
        interrupted,
        duration_ms,
        session_cost_usd,
        ungrouped,
        bundles,
        preview,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundling::{group_defects, GroupingOptions};
    use crate::defects::test_support::defect;
    use crate::defects::{DefectKind, DefectPriority};

    fn bundles_with_same_branch() -> Vec<Bundle> {
        let defects = vec![
            defect(1, DefectKind::Bug, DefectPriority::High, "auth"),
            defect(2, DefectKind::Bug, DefectPriority::Low, "auth"),
        ];
        let mut bundles = group_defects(
            &defects,
            GroupPolicy::Component,
            &GroupingOptions {
                max_bundle_size: 1,
                ..Default::default()
            },
        )
        .bundles;
        // Force the collision the pre-check must catch.
        let branch = "fix/auth-1".to_string();
        for bundle in bundles.iter_mut() {
            bundle.proposed_branch = branch.clone();
        }
        bundles
    }

    #[test]
    fn duplicate_branches_are_terminal() {
        let err = Orchestrator::precheck_conflicts(&bundles_with_same_branch()).unwrap_err();
        match err {
            FixwrightError::ConflictsDetected { branches } => {
                assert_eq!(branches, vec!["fix/auth-1"]);
            }
            other => panic!("expected ConflictsDetected, got {other:?}"),
        }
    }

    #[test]
    fn overlapping_files_are_not_terminal() {
        let mut d1 = defect(1, DefectKind::Bug, DefectPriority::High, "auth");
        d1.context.related_files = vec!["src/shared.rs".into()];
        let mut d2 = defect(2, DefectKind::Bug, DefectPriority::Low, "billing");
        d2.context.related_files = vec!["src/shared.rs".into()];
        let bundles =
            group_defects(&[d1, d2], GroupPolicy::Component, &GroupingOptions::default()).bundles;
        assert_eq!(bundles.len(), 2);
        assert!(Orchestrator::precheck_conflicts(&bundles).is_ok());
    }

    #[test]
    fn exit_codes_follow_outcomes() {
        let mut report = compose_report(Vec::new(), 0, false, 10, 0.0, None);
        assert_eq!(report.exit_code(), 0); // nothing to do is success
        report.total = 2;
        report.failed = 2;
        assert_eq!(report.exit_code(), 1);
        report.completed = 1;
        assert_eq!(report.exit_code(), 0);
        report.interrupted = true;
        assert_eq!(report.exit_code(), INTERRUPTED_EXIT_CODE);
    }

    #[test]
    fn report_renders_summary() {
        let report = compose_report(Vec::new(), 3, false, 1500, 0.12, None);
        let rendered = report.render();
        assert!(rendered.contains("0/0 completed"));
        assert!(rendered.contains("3 ungrouped"));
        assert!(rendered.contains("$0.1200"));
    }
}
