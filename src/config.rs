use std::path::Path;

use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::errors::FixwrightError;

/// Main configuration structure for fixwright.
///
/// Sources are merged with precedence defaults ← file ← environment; CLI
/// flags override individual fields after loading.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FixwrightConfig {
    /// Code-hosting service (issues in, pull requests out).
    pub host: HostConfig,
    /// Task-tracker service (optional; required for the RPC surface).
    pub tracker: Option<TrackerConfig>,
    /// Exception-tracker ingestion (optional).
    pub exceptions: Option<ExceptionsConfig>,
    /// Worktree leasing.
    pub worktree: WorktreeConfig,
    /// Verification checks run inside each working copy.
    pub checks: ChecksConfig,
    /// Logging / telemetry.
    pub logging: LoggingConfig,
    /// Fixing-agent invocation and budgets.
    pub ai: AiConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HostConfig {
    /// API token; falls back to FIXWRIGHT_HOST_TOKEN / GITHUB_TOKEN.
    pub token: Option<String>,
    pub owner: String,
    pub repo: String,
    pub default_branch: String,
    /// Only defects carrying this label are considered.
    pub auto_fix_label: String,
    /// Defects carrying this label are never considered.
    pub skip_label: String,
    /// Override for GitHub Enterprise installations.
    pub api_base_url: Option<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            token: None,
            owner: String::new(),
            repo: String::new(),
            default_branch: "main".to_string(),
            auto_fix_label: "auto-fix".to_string(),
            skip_label: "no-auto-fix".to_string(),
            api_base_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TrackerConfig {
    pub token: Option<String>,
    pub workspace_id: String,
    pub project_ids: Vec<String>,
    pub triage_section: Option<String>,
    pub done_section: Option<String>,
    /// Tag applied to tracker tasks that mirror host defects.
    pub synced_tag: Option<String>,
    pub api_base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ExceptionsConfig {
    pub dsn: String,
    pub organization: String,
    pub project: String,
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorktreeConfig {
    /// Directory that holds all leased working copies.
    pub base_dir: String,
    pub max_concurrent: usize,
    pub auto_cleanup_minutes: u64,
    pub prefix: String,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            base_dir: ".fixwright/worktrees".to_string(),
            max_concurrent: 3,
            auto_cleanup_minutes: 60,
            prefix: "autofix-".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChecksConfig {
    pub test_command: Option<String>,
    pub type_check_command: Option<String>,
    pub lint_command: Option<String>,
    /// Per-command timeouts in seconds.
    pub test_timeout: u64,
    pub type_check_timeout: u64,
    pub lint_timeout: u64,
    pub max_retries: u32,
    /// Stop at the first failing check instead of running the full set.
    pub fail_fast: bool,
}

impl Default for ChecksConfig {
    fn default() -> Self {
        Self {
            test_command: None,
            type_check_command: None,
            lint_command: None,
            test_timeout: 600,
            type_check_timeout: 180,
            lint_timeout: 120,
            max_retries: 3,
            fail_fast: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace | debug | info | warn | error | fatal
    pub level: String,
    /// Human-readable output instead of JSON.
    pub pretty: bool,
    pub file_path: Option<String>,
    /// Config keys whose values are masked when the config is echoed.
    pub redact: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            pretty: false,
            file_path: None,
            redact: vec![
                "token".to_string(),
                "dsn".to_string(),
                "webhook_secret".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AiConfig {
    /// USD caps; absent means uncapped.
    pub max_budget_per_issue: Option<f64>,
    pub max_budget_per_session: Option<f64>,
    pub preferred_model: String,
    pub fallback_model: String,
    /// Fixing-agent executable.
    pub cli_path: String,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            max_budget_per_issue: Some(2.0),
            max_budget_per_session: Some(20.0),
            preferred_model: "sonnet".to_string(),
            fallback_model: "haiku".to_string(),
            cli_path: "claude".to_string(),
        }
    }
}

impl Default for FixwrightConfig {
    fn default() -> Self {
        Self {
            host: HostConfig::default(),
            tracker: None,
            exceptions: None,
            worktree: WorktreeConfig::default(),
            checks: ChecksConfig::default(),
            logging: LoggingConfig::default(),
            ai: AiConfig::default(),
        }
    }
}

const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "fatal"];

impl FixwrightConfig {
    /// Load configuration from defaults, then `fixwright.toml` (or the path
    /// in `AUTO_FIX_CONFIG`), then `FIXWRIGHT_*` environment variables.
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder();

        let explicit_path = std::env::var("AUTO_FIX_CONFIG").ok();
        match &explicit_path {
            Some(path) => {
                if !Path::new(path).exists() {
                    return Err(FixwrightError::ConfigMissing { path: path.clone() }.into());
                }
                builder = builder.add_source(File::with_name(path));
            }
            None => {
                if Path::new("fixwright.toml").exists() {
                    builder = builder.add_source(File::with_name("fixwright"));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("FIXWRIGHT")
                .separator("__")
                .try_parsing(true),
        );

        let merged = builder
            .build()
            .map_err(|e| FixwrightError::ConfigParse(e.to_string()))?;
        let mut config: FixwrightConfig = merged
            .try_deserialize()
            .map_err(|e| FixwrightError::ConfigParse(e.to_string()))?;

        // Token fallbacks outside the prefixed namespace.
        if config.host.token.is_none() {
            if let Ok(token) = std::env::var("FIXWRIGHT_HOST_TOKEN") {
                config.host.token = Some(token);
            } else if let Ok(token) = std::env::var("GITHUB_TOKEN") {
                config.host.token = Some(token);
            }
        }
        if let Some(tracker) = config.tracker.as_mut() {
            if tracker.token.is_none() {
                if let Ok(token) = std::env::var("FIXWRIGHT_TRACKER_TOKEN") {
                    tracker.token = Some(token);
                }
            }
        }

        Ok(config)
    }

    /// Validate the loaded configuration, collecting every problem before
    /// failing so the user fixes them in one pass.
    pub fn validate(&self) -> Result<(), FixwrightError> {
        let mut problems = Vec::new();

        if self.host.owner.is_empty() {
            problems.push("host.owner is required".to_string());
        }
        if self.host.repo.is_empty() {
            problems.push("host.repo is required".to_string());
        }
        if self.host.auto_fix_label.is_empty() {
            problems.push("host.auto_fix_label must not be empty".to_string());
        }
        if self.worktree.max_concurrent == 0 {
            problems.push("worktree.max_concurrent must be >= 1".to_string());
        }
        if self.worktree.auto_cleanup_minutes == 0 {
            problems.push("worktree.auto_cleanup_minutes must be >= 1".to_string());
        }
        if self.worktree.prefix.is_empty() {
            problems.push("worktree.prefix must not be empty".to_string());
        }
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            problems.push(format!(
                "logging.level '{}' is not one of {}",
                self.logging.level,
                LOG_LEVELS.join("|")
            ));
        }
        for (name, cap) in [
            ("ai.max_budget_per_issue", self.ai.max_budget_per_issue),
            ("ai.max_budget_per_session", self.ai.max_budget_per_session),
        ] {
            if let Some(cap) = cap {
                if !cap.is_finite() || cap < 0.0 {
                    problems.push(format!("{name} must be a non-negative number"));
                }
            }
        }
        if self.ai.cli_path.is_empty() {
            problems.push("ai.cli_path must not be empty".to_string());
        }
        if let Some(tracker) = &self.tracker {
            if tracker.workspace_id.is_empty() {
                problems.push("tracker.workspace_id is required when [tracker] is set".to_string());
            }
            if tracker.project_ids.is_empty() {
                problems
                    .push("tracker.project_ids must not be empty when [tracker] is set".to_string());
            }
        }
        if let Some(exceptions) = &self.exceptions {
            if exceptions.dsn.is_empty() {
                problems.push("exceptions.dsn is required when [exceptions] is set".to_string());
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(FixwrightError::ConfigValidation { problems })
        }
    }

    /// Save configuration to a TOML file (used by `fixwright init`).
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists.
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::debug!("loaded environment variables from .env");
        }
        Ok(())
    }

    /// One-line summary with secret-bearing values masked.
    pub fn redacted_summary(&self) -> String {
        let mask = |v: &Option<String>| if v.is_some() { "***" } else { "(unset)" };
        format!(
            "host={}/{} base={} token={} tracker={} exceptions={}",
            self.host.owner,
            self.host.repo,
            self.host.default_branch,
            mask(&self.host.token),
            self.tracker
                .as_ref()
                .map(|t| t.workspace_id.as_str())
                .unwrap_or("-"),
            self.exceptions
                .as_ref()
                .map(|e| e.project.as_str())
                .unwrap_or("-"),
        )
    }
}

/// Global configuration instance, loaded once.
static CONFIG: std::sync::LazyLock<Result<FixwrightConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        let _ = FixwrightConfig::load_env_file();
        FixwrightConfig::load()
    });

/// Get the global configuration.
pub fn config() -> Result<&'static FixwrightConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}
