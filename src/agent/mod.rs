//! Fixing-agent subprocess adapter.
//!
//! The external agent is a CLI invoked once per stage: a read-only analysis
//! call and a write-capable fix call. The prompt goes in on stdin; stdout is
//! a stream of JSON objects whose final object carries the usage block and
//! the tool result.

mod prompts;

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bundling::Bundle;

pub use prompts::{analysis_prompt, fix_prompt, RetryContext};

pub const ANALYSIS_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const FIX_TIMEOUT: Duration = Duration::from_secs(10 * 60);

const ANALYSIS_TOOLS: &str = "Read,Grep,Glob";
const FIX_TOOLS: &str = "Read,Grep,Glob,Edit,Write,Bash";
const MAX_AFFECTED_FILES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

/// Result of the read-only analysis call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    /// In `[0, 1]`.
    pub confidence: f64,
    pub root_cause: String,
    pub suggested_fix: String,
    /// At most three files; extra entries are truncated on parse.
    pub affected_files: Vec<String>,
    pub complexity: Complexity,
}

/// Result of the write-capable fix call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixResult {
    pub success: bool,
    pub summary: String,
    pub files_changed: Vec<String>,
}

/// Token usage and cost reported by the agent's final stdout object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

/// A parsed agent invocation: the typed result plus its cost.
#[derive(Debug, Clone)]
pub struct AgentInvocation<T> {
    pub result: T,
    pub usage: AgentUsage,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("fixing-agent executable '{0}' not found")]
    CliNotFound(String),

    #[error("agent timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("agent exited with {exit_code}: {stderr}")]
    Failed { exit_code: i32, stderr: String },

    /// stderr matched a rate-limit/overload pattern; retriable upstream.
    #[error("agent rate-limited: {0}")]
    RateLimited(String),

    #[error("could not parse agent output: {0}")]
    Parse(String),

    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AgentError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, AgentError::RateLimited(_))
    }
}

/// Parameters common to both call shapes.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub model_tier: String,
    pub max_budget_usd: f64,
    pub workdir: std::path::PathBuf,
    pub prompt: String,
}

/// Seam for stubbing the agent in tests and the dry-run simulator.
#[async_trait]
pub trait FixingAgent: Send + Sync {
    async fn analyze(
        &self,
        request: &AgentRequest,
        cancel: &CancellationToken,
    ) -> Result<AgentInvocation<AnalysisResult>, AgentError>;

    async fn apply_fix(
        &self,
        request: &AgentRequest,
        cancel: &CancellationToken,
    ) -> Result<AgentInvocation<FixResult>, AgentError>;
}

/// Production implementation that shells out to the configured CLI.
#[derive(Debug, Clone)]
pub struct CliFixingAgent {
    cli_path: String,
    analysis_timeout: Duration,
    fix_timeout: Duration,
}

impl CliFixingAgent {
    pub fn new(cli_path: impl Into<String>) -> Self {
        Self {
            cli_path: cli_path.into(),
            analysis_timeout: ANALYSIS_TIMEOUT,
            fix_timeout: FIX_TIMEOUT,
        }
    }

    async fn invoke(
        &self,
        request: &AgentRequest,
        tools: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(String, AgentUsage, serde_json::Value), AgentError> {
        debug!(
            model = %request.model_tier,
            workdir = %request.workdir.display(),
            budget = request.max_budget_usd,
            "invoking fixing agent"
        );

        let mut child = Command::new(&self.cli_path)
            .arg("--model")
            .arg(&request.model_tier)
            .arg("--allowed-tools")
            .arg(tools)
            .arg("--max-budget")
            .arg(format!("{:.4}", request.max_budget_usd))
            .arg("--cwd")
            .arg(&request.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    AgentError::CliNotFound(self.cli_path.clone())
                } else {
                    AgentError::Io(e)
                }
            })?;

        let mut stdin = child.stdin.take().expect("stdin was piped");
        stdin.write_all(request.prompt.as_bytes()).await?;
        drop(stdin);

        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = tokio::time::sleep(timeout) => {
                warn!(timeout_s = timeout.as_secs(), "agent invocation timed out, killing");
                return Err(AgentError::Timeout(timeout));
            }
            _ = cancel.cancelled() => return Err(AgentError::Interrupted),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let lowered = stderr.to_ascii_lowercase();
            if lowered.contains("rate limit") || lowered.contains("overloaded") {
                return Err(AgentError::RateLimited(stderr));
            }
            return Err(AgentError::Failed {
                exit_code: code,
                stderr,
            });
        }

        let (usage, result) = parse_agent_stdout(&stdout)?;
        Ok((stdout, usage, result))
    }
}

#[async_trait]
impl FixingAgent for CliFixingAgent {
    async fn analyze(
        &self,
        request: &AgentRequest,
        cancel: &CancellationToken,
    ) -> Result<AgentInvocation<AnalysisResult>, AgentError> {
        let (_, usage, result) = self
            .invoke(request, ANALYSIS_TOOLS, self.analysis_timeout, cancel)
            .await?;
        let mut analysis: AnalysisResult = serde_json::from_value(result)
            .map_err(|e| AgentError::Parse(format!("analysis result: {e}")))?;
        if !(0.0..=1.0).contains(&analysis.confidence) {
            return Err(AgentError::Parse(format!(
                "confidence {} outside [0, 1]",
                analysis.confidence
            )));
        }
        analysis.affected_files.truncate(MAX_AFFECTED_FILES);
        info!(
            confidence = analysis.confidence,
            complexity = ?analysis.complexity,
            cost_usd = usage.cost_usd,
            "analysis complete"
        );
        Ok(AgentInvocation {
            result: analysis,
            usage,
        })
    }

    async fn apply_fix(
        &self,
        request: &AgentRequest,
        cancel: &CancellationToken,
    ) -> Result<AgentInvocation<FixResult>, AgentError> {
        let (_, usage, result) = self
            .invoke(request, FIX_TOOLS, self.fix_timeout, cancel)
            .await?;
        let fix: FixResult = serde_json::from_value(result)
            .map_err(|e| AgentError::Parse(format!("fix result: {e}")))?;
        info!(
            success = fix.success,
            files = fix.files_changed.len(),
            cost_usd = usage.cost_usd,
            "fix call complete"
        );
        Ok(AgentInvocation { result: fix, usage })
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    usage: AgentUsage,
    #[serde(default)]
    result: serde_json::Value,
}

/// Parse the agent's stdout stream: one JSON object per line, the final
/// object carrying `usage` and the tool result.
fn parse_agent_stdout(stdout: &str) -> Result<(AgentUsage, serde_json::Value), AgentError> {
    let last = stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| AgentError::Parse("empty agent output".to_string()))?;
    let envelope: Envelope = serde_json::from_str(last.trim())
        .map_err(|e| AgentError::Parse(format!("final object: {e}")))?;
    // The result may be inlined as an object or double-encoded as a string.
    let result = match envelope.result {
        serde_json::Value::String(s) => serde_json::from_str(&s)
            .map_err(|e| AgentError::Parse(format!("string-encoded result: {e}")))?,
        other => other,
    };
    Ok((envelope.usage, result))
}

/// Extract the defect summary block shared by both prompts.
pub(crate) fn bundle_brief(bundle: &Bundle) -> String {
    let mut brief = String::new();
    for defect in &bundle.defects {
        brief.push_str(&format!(
            "- #{} [{} / {}] {}\n",
            defect.id,
            defect.kind,
            defect.priority(),
            defect.title
        ));
        if !defect.body.is_empty() {
            for line in defect.body.lines().take(20) {
                brief.push_str("  ");
                brief.push_str(line);
                brief.push('\n');
            }
        }
    }
    if !bundle.related_files.is_empty() {
        brief.push_str("\nRelated files:\n");
        for file in &bundle.related_files {
            brief.push_str(&format!("- {file}\n"));
        }
    }
    brief
}
