//! Budget-gate behavior at the pipeline level: a bundle whose budget is
//! already spent must fail before the agent is ever invoked.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use common::{make_defect, scratch_repo, test_config, worktree_dirs, ScriptedAgent, StubHost};
use fixwright::budget::BudgetTracker;
use fixwright::bundling::{group_defects, GroupPolicy, GroupingOptions};
use fixwright::checks::CheckRunner;
use fixwright::defects::{DefectKind, DefectPriority};
use fixwright::pipeline::{BundleStatus, Pipeline};
use fixwright::reporter::ProgressReporter;
use fixwright::worktree::WorktreeManager;

#[tokio::test]
async fn exhausted_budget_skips_agent_entirely() {
    let (_dir, root) = scratch_repo();
    let config = test_config();

    let defects = vec![make_defect(1, DefectKind::Bug, DefectPriority::High, "auth")];
    let bundle = group_defects(&defects, GroupPolicy::Component, &GroupingOptions::default())
        .bundles
        .remove(0);

    // Pre-seed the ledger past the cap before the pipeline ever runs.
    let budget = Arc::new(BudgetTracker::new(Some(0.01), None, "sonnet", "haiku"));
    budget.add_cost(&bundle.id, 0.02);
    assert!(!budget.can_spend(&bundle.id, 0.0));

    let agent = Arc::new(ScriptedAgent::default());
    let host = Arc::new(StubHost::new(Vec::new()));
    let worktrees = Arc::new(WorktreeManager::new(root.clone(), &config.worktree).unwrap());
    let pipeline = Pipeline::new(
        Arc::clone(&worktrees),
        Arc::clone(&agent) as Arc<dyn fixwright::agent::FixingAgent>,
        CheckRunner::new(config.checks.clone()),
        budget,
        Arc::clone(&host) as Arc<dyn fixwright::host::HostApi>,
        Arc::new(ProgressReporter::new(false)),
        "main".to_string(),
    );

    let result = pipeline
        .process(bundle, 1, CancellationToken::new())
        .await;

    assert_eq!(result.status, BundleStatus::Failed);
    assert!(result.error.as_deref().unwrap().contains("budget exceeded"));
    // The agent was never invoked.
    assert_eq!(agent.analysis_calls.load(Ordering::SeqCst), 0);
    assert_eq!(agent.fix_calls.load(Ordering::SeqCst), 0);
    assert_eq!(host.publication_count(), 0);
    // The lease taken for the worktree-create stage was released again.
    assert_eq!(worktrees.active_count(), 0);
    assert_eq!(worktree_dirs(&root, &config), 0);
}

#[tokio::test]
async fn session_budget_gates_later_bundles() {
    let (_dir, root) = scratch_repo();
    let config = test_config();

    let defects = vec![
        make_defect(1, DefectKind::Bug, DefectPriority::High, "auth"),
        make_defect(2, DefectKind::Bug, DefectPriority::High, "billing"),
    ];
    let bundles = group_defects(&defects, GroupPolicy::Component, &GroupingOptions::default())
        .bundles;

    let budget = Arc::new(BudgetTracker::new(None, Some(0.5), "sonnet", "haiku"));
    budget.add_cost("somewhere-else", 0.6);

    let agent = Arc::new(ScriptedAgent::default());
    let host = Arc::new(StubHost::new(Vec::new()));
    let worktrees = Arc::new(WorktreeManager::new(root, &config.worktree).unwrap());
    let pipeline = Pipeline::new(
        worktrees,
        Arc::clone(&agent) as Arc<dyn fixwright::agent::FixingAgent>,
        CheckRunner::new(config.checks.clone()),
        budget,
        host as Arc<dyn fixwright::host::HostApi>,
        Arc::new(ProgressReporter::new(false)),
        "main".to_string(),
    );

    for bundle in bundles {
        let result = pipeline.process(bundle, 1, CancellationToken::new()).await;
        assert_eq!(result.status, BundleStatus::Failed);
    }
    assert_eq!(agent.analysis_calls.load(Ordering::SeqCst), 0);
}
