use std::io::IsTerminal;

use anyhow::Result;
use clap::Parser;

mod agent;
mod budget;
mod bundling;
mod checks;
mod cli;
mod config;
mod defects;
mod dryrun;
mod errors;
mod exceptions;
mod host;
mod orchestrator;
mod pipeline;
mod queue;
mod reporter;
mod rpc;
mod shutdown;
mod telemetry;
mod tracker;
mod worktree;

use cli::commands::{
    autofix::AutofixCommand, init::InitCommand, show_usage_hint, triage::TriageCommand,
};
use cli::{Cli, Commands};
use config::FixwrightConfig;
use telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // `init` must run before a valid config exists; everything else loads
    // the merged configuration up front.
    let loaded_config = config::config();
    let logging = loaded_config
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_default();
    if let Err(e) = init_telemetry(&logging) {
        eprintln!("Warning: failed to initialize telemetry: {e}");
    }

    let exit_code = match cli.command {
        Some(Commands::Init { force }) => InitCommand::new(force).execute().await?,
        Some(Commands::Autofix {
            group_by,
            max_parallel,
            max_retries,
            dry_run,
            base_branch,
            issues,
            all,
            max_bundle_size,
            min_bundle_size,
            json,
        }) => {
            let config = require_config(loaded_config)?;
            AutofixCommand::new(
                group_by,
                max_parallel,
                max_retries,
                dry_run,
                base_branch,
                issues,
                all,
                max_bundle_size,
                min_bundle_size,
            )
            .with_verbose(cli.verbose)
            .with_json(json)
            .execute(config)
            .await?
        }
        Some(Commands::Triage { group_by }) => {
            let config = require_config(loaded_config)?;
            TriageCommand::new(group_by).execute(config).await?
        }
        None => {
            if std::io::stdin().is_terminal() {
                show_usage_hint();
                0
            } else {
                let config = require_config(loaded_config)?;
                serve_rpc(config).await?
            }
        }
    };

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

fn require_config(loaded: Result<&'static FixwrightConfig>) -> Result<&'static FixwrightConfig> {
    let config = loaded?;
    config.validate()?;
    Ok(config)
}

async fn serve_rpc(config: &FixwrightConfig) -> Result<i32> {
    let tracker = match &config.tracker {
        Some(tracker_config) => Some(tracker::TrackerClient::new(tracker_config)?),
        None => None,
    };
    // Host failures (e.g. missing token) leave host tools unavailable but
    // keep the tracker tools serving.
    let host: Option<std::sync::Arc<dyn host::HostApi>> =
        match cli::commands::connect_host(config) {
            Ok(host) => Some(host),
            Err(e) => {
                tracing::warn!(error = %e, "host unavailable; serving tracker tools only");
                None
            }
        };
    let registry = rpc::ToolRegistry::new(rpc::RpcState { tracker, host });
    rpc::serve_stdio(registry).await?;
    Ok(0)
}
