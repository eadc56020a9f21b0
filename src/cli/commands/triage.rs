use anyhow::Result;

use crate::bundling::{group_defects, GroupPolicy, GroupingOptions};
use crate::config::FixwrightConfig;
use crate::host::{DefectFilter, HostApi};

use super::connect_host;

/// `fixwright triage`: list candidate defects and preview the grouping
/// without leasing anything or touching the agent.
pub struct TriageCommand {
    group_by: GroupPolicy,
}

impl TriageCommand {
    pub fn new(group_by: GroupPolicy) -> Self {
        Self { group_by }
    }

    pub async fn execute(&self, config: &FixwrightConfig) -> Result<i32> {
        let host = connect_host(config)?;
        let filter = DefectFilter {
            require_label: Some(config.host.auto_fix_label.clone()),
            skip_label: Some(config.host.skip_label.clone()),
            ids: Vec::new(),
        };
        let defects = host.fetch_defects(&filter).await?;
        if defects.is_empty() {
            println!(
                "No open defects carry the '{}' label.",
                config.host.auto_fix_label
            );
            return Ok(0);
        }

        let outcome = group_defects(&defects, self.group_by, &GroupingOptions::default());
        println!(
            "🔎 {} candidate defect(s) → {} bundle(s) by {}:",
            defects.len(),
            outcome.bundles.len(),
            self.group_by
        );
        for bundle in &outcome.bundles {
            println!(
                "  📦 {} [{}] → {}",
                bundle.name, bundle.priority, bundle.proposed_branch
            );
            for defect in &bundle.defects {
                println!("     - #{} [{}] {}", defect.id, defect.kind, defect.title);
            }
        }
        if !outcome.residue.is_empty() {
            println!("  ⏭ {} defect(s) left ungrouped:", outcome.residue.len());
            for defect in &outcome.residue {
                println!("     - #{} {}", defect.id, defect.title);
            }
        }
        Ok(0)
    }
}
