use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::info;

use crate::bundling::GroupPolicy;
use crate::config::FixwrightConfig;
use crate::orchestrator::{Orchestrator, RunOptions};
use crate::shutdown::InterruptHandler;

use super::{connect_agent, connect_host};

/// `fixwright autofix`: the full remediation run.
pub struct AutofixCommand {
    options: RunOptions,
    verbose: bool,
    json: bool,
}

impl AutofixCommand {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        group_by: GroupPolicy,
        max_parallel: u16,
        max_retries: Option<u32>,
        dry_run: bool,
        base_branch: Option<String>,
        issues: Vec<u64>,
        all: bool,
        max_bundle_size: u16,
        min_bundle_size: u16,
    ) -> Self {
        Self {
            options: RunOptions {
                group_by,
                max_parallel: max_parallel as usize,
                max_retries,
                dry_run,
                base_branch,
                issue_ids: issues,
                all,
                max_bundle_size: max_bundle_size as usize,
                min_bundle_size: min_bundle_size as usize,
            },
            verbose: false,
            json: false,
        }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    pub async fn execute(&self, config: &FixwrightConfig) -> Result<i32> {
        if self.options.issue_ids.is_empty() && !self.options.all {
            bail!("pass --issues <ids> or --all to select defects");
        }

        let interrupts = Arc::new(InterruptHandler::new());
        interrupts.install();

        let host = connect_host(config)?;
        let agent = connect_agent(config);
        let orchestrator = Orchestrator::new(
            config.clone(),
            host,
            agent,
            Arc::clone(&interrupts),
            std::env::current_dir()?,
            self.verbose,
        );

        info!(config = %config.redacted_summary(), "starting autofix run");
        let report = orchestrator.run(self.options.clone()).await?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            println!("{}", report.render());
        }
        Ok(report.exit_code())
    }
}
