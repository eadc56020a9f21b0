//! Dry-run simulator: a parallel rendition of the pipeline that produces a
//! preview without side effects. No worktree is created, no publication is
//! opened, no defect is mutated. Analysis still runs (read-only against the
//! primary checkout) so the preview can say what the agent would do; the
//! write stages are listed as skipped.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::agent::{analysis_prompt, AgentRequest, FixingAgent};
use crate::budget::BudgetTracker;
use crate::bundling::Bundle;
use crate::pipeline::{BundleResult, Stage};

const ALL_STAGES: [Stage; 9] = [
    Stage::WorktreeCreate,
    Stage::Analysis,
    Stage::Fix,
    Stage::InstallDeps,
    Stage::Checks,
    Stage::Commit,
    Stage::Publish,
    Stage::UpdateSources,
    Stage::Cleanup,
];

pub struct DryRunSimulator {
    agent: Arc<dyn FixingAgent>,
    budget: Arc<BudgetTracker>,
    repo_root: PathBuf,
    /// Extra diagnostics when the DEBUG env var is set.
    debug: bool,
}

impl DryRunSimulator {
    pub fn new(
        agent: Arc<dyn FixingAgent>,
        budget: Arc<BudgetTracker>,
        repo_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            agent,
            budget,
            repo_root: repo_root.into(),
            debug: std::env::var("DEBUG").is_ok(),
        }
    }

    /// Produce the preview string plus one synthetic (skipped) result per
    /// bundle.
    pub async fn simulate(
        &self,
        bundles: &[Bundle],
        cancel: &CancellationToken,
    ) -> (String, Vec<BundleResult>) {
        let mut preview = format!("🔍 Dry run: {} bundle(s), no side effects\n\n", bundles.len());
        let mut results = Vec::new();

        for bundle in bundles {
            if cancel.is_cancelled() {
                results.push(BundleResult::skipped(bundle.clone(), "interrupted"));
                continue;
            }

            preview.push_str(&format!(
                "📦 {} - {} defect(s), priority {}\n",
                bundle.name,
                bundle.defects.len(),
                bundle.priority
            ));
            preview.push_str(&format!("   branch: {}\n", bundle.proposed_branch));
            for defect in &bundle.defects {
                preview.push_str(&format!("   - #{} {}\n", defect.id, defect.title));
            }

            if self.budget.can_spend(&bundle.id, 0.0) {
                match self.run_analysis(bundle, cancel).await {
                    Some(line) => preview.push_str(&line),
                    None => preview.push_str("   analysis: unavailable\n"),
                }
            } else {
                preview.push_str("   analysis: skipped (budget exhausted)\n");
            }

            preview.push_str("   stages: ");
            let stage_list: Vec<String> = ALL_STAGES
                .iter()
                .map(|s| {
                    if s.skipped_in_dry_run() {
                        format!("{s}(skip)")
                    } else {
                        s.to_string()
                    }
                })
                .collect();
            preview.push_str(&stage_list.join(" → "));
            preview.push('\n');
            preview.push_str(&format!(
                "   would publish: [AUTO] {} → {}\n\n",
                bundle.group_value, bundle.proposed_branch
            ));

            results.push(BundleResult::skipped(bundle.clone(), "dry-run"));
        }

        info!(
            bundles = bundles.len(),
            cost_usd = self.budget.session_cost(),
            "dry run complete"
        );
        (preview, results)
    }

    async fn run_analysis(&self, bundle: &Bundle, cancel: &CancellationToken) -> Option<String> {
        let request = AgentRequest {
            model_tier: self.budget.current_model_tier(),
            max_budget_usd: 0.25,
            workdir: self.repo_root.clone(),
            prompt: analysis_prompt(bundle),
        };
        match self.agent.analyze(&request, cancel).await {
            Ok(invocation) => {
                self.budget.add_cost(&bundle.id, invocation.usage.cost_usd);
                let analysis = invocation.result;
                let mut line = format!(
                    "   analysis: {:?} complexity, confidence {:.2} - {}\n",
                    analysis.complexity, analysis.confidence, analysis.root_cause
                );
                if self.debug {
                    line.push_str(&format!(
                        "   analysis (debug): fix={} files={:?}\n",
                        analysis.suggested_fix, analysis.affected_files
                    ));
                }
                Some(line)
            }
            Err(e) => {
                debug!(bundle_id = %bundle.id, error = %e, "dry-run analysis failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{
        AgentError, AgentInvocation, AgentUsage, AnalysisResult, Complexity, FixResult,
    };
    use crate::bundling::{group_defects, GroupPolicy, GroupingOptions};
    use crate::defects::test_support::defect;
    use crate::defects::{DefectKind, DefectPriority};
    use crate::pipeline::BundleStatus;
    use async_trait::async_trait;

    struct StubAgent;

    #[async_trait]
    impl FixingAgent for StubAgent {
        async fn analyze(
            &self,
            _request: &AgentRequest,
            _cancel: &CancellationToken,
        ) -> Result<AgentInvocation<AnalysisResult>, AgentError> {
            Ok(AgentInvocation {
                result: AnalysisResult {
                    confidence: 0.9,
                    root_cause: "stale cache".to_string(),
                    suggested_fix: "invalidate on write".to_string(),
                    affected_files: vec!["src/cache.rs".to_string()],
                    complexity: Complexity::Low,
                },
                usage: AgentUsage {
                    input_tokens: 100,
                    output_tokens: 20,
                    cost_usd: 0.01,
                },
            })
        }

        async fn apply_fix(
            &self,
            _request: &AgentRequest,
            _cancel: &CancellationToken,
        ) -> Result<AgentInvocation<FixResult>, AgentError> {
            panic!("dry run must never invoke the fix call");
        }
    }

    fn bundles() -> Vec<Bundle> {
        let defects = vec![
            defect(1, DefectKind::Bug, DefectPriority::High, "cache"),
            defect(2, DefectKind::Bug, DefectPriority::Low, "cache"),
        ];
        group_defects(&defects, GroupPolicy::Component, &GroupingOptions::default()).bundles
    }

    #[tokio::test]
    async fn preview_lists_bundles_and_skipped_stages() {
        let budget = Arc::new(BudgetTracker::new(None, None, "sonnet", "haiku"));
        let sim = DryRunSimulator::new(Arc::new(StubAgent), Arc::clone(&budget), ".");
        let (preview, results) = sim.simulate(&bundles(), &CancellationToken::new()).await;

        assert!(preview.contains("cache (2 defects)"));
        assert!(preview.contains("fix(skip)"));
        assert!(preview.contains("publish(skip)"));
        assert!(preview.contains("stale cache"));
        assert_eq!(results.len(), 1);
        assert!(results.iter().all(|r| r.status == BundleStatus::Skipped));
        // Analysis cost is tracked even in dry run.
        assert!(budget.session_cost() > 0.0);
    }

    #[tokio::test]
    async fn exhausted_budget_skips_analysis() {
        let budget = Arc::new(BudgetTracker::new(Some(0.01), None, "sonnet", "haiku"));
        budget.add_cost("component-cache-1", 0.02);
        let sim = DryRunSimulator::new(Arc::new(StubAgent), budget, ".");
        let (preview, _) = sim.simulate(&bundles(), &CancellationToken::new()).await;
        assert!(preview.contains("skipped (budget exhausted)"));
    }
}
