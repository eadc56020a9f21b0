use std::sync::Arc;

use anyhow::Result;

use crate::agent::CliFixingAgent;
use crate::config::FixwrightConfig;
use crate::host::GitHubHost;

pub mod autofix;
pub mod init;
pub mod triage;

/// Build the production host adapter for the working directory.
pub fn connect_host(config: &FixwrightConfig) -> Result<Arc<GitHubHost>> {
    let repo_root = std::env::current_dir()?;
    Ok(Arc::new(GitHubHost::new(&config.host, repo_root)?))
}

/// Build the production fixing-agent adapter.
pub fn connect_agent(config: &FixwrightConfig) -> Arc<CliFixingAgent> {
    Arc::new(CliFixingAgent::new(config.ai.cli_path.clone()))
}

/// Guidance printed when the binary runs bare on a terminal.
pub fn show_usage_hint() {
    println!("🔧 fixwright - automated remediation workflow");
    println!();
    println!("To get started:");
    println!("  ⚙️  fixwright init                 # write a config scaffold");
    println!("  👁️  fixwright triage               # preview candidate bundles");
    println!("  🚀 fixwright autofix --all        # fix every opted-in defect");
    println!("  🧪 fixwright autofix --all --dry-run");
    println!();
    println!("Piping to stdin (non-TTY) starts the RPC tool server instead.");
}
