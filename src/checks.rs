//! Verification checks run inside a leased working copy.
//!
//! Each configured check (lint, typecheck, test) is a shell command with its
//! own timeout. A timed-out check is killed and recorded as failed with the
//! `TIMEOUT` category so the retry logic can see it.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ChecksConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Lint,
    TypeCheck,
    Test,
}

impl CheckKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckKind::Lint => "lint",
            CheckKind::TypeCheck => "typecheck",
            CheckKind::Test => "test",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passed,
    Failed,
    TimedOut,
    Interrupted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub kind: CheckKind,
    pub command: String,
    pub status: CheckStatus,
    pub duration_ms: u64,
    /// Captured stderr tail, forwarded to the agent as retry context.
    pub stderr: String,
}

impl CheckResult {
    pub fn failed(&self) -> bool {
        matches!(self.status, CheckStatus::Failed | CheckStatus::TimedOut)
    }
}

/// Outcome of one full verifier pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckRun {
    pub results: Vec<CheckResult>,
}

impl CheckRun {
    pub fn passed(&self) -> bool {
        !self.results.is_empty() && self.results.iter().all(|r| !r.failed())
    }

    pub fn failed_checks(&self) -> Vec<&CheckResult> {
        self.results.iter().filter(|r| r.failed()).collect()
    }

    pub fn pass_count(&self) -> usize {
        self.results.iter().filter(|r| !r.failed()).count()
    }
}

/// Runs the configured verifier set sequentially inside a working copy.
#[derive(Debug, Clone)]
pub struct CheckRunner {
    config: ChecksConfig,
}

const STDERR_TAIL_BYTES: usize = 4096;

impl CheckRunner {
    pub fn new(config: ChecksConfig) -> Self {
        Self { config }
    }

    fn configured(&self) -> Vec<(CheckKind, String, Duration)> {
        let mut checks = Vec::new();
        if let Some(cmd) = &self.config.lint_command {
            checks.push((
                CheckKind::Lint,
                cmd.clone(),
                Duration::from_secs(self.config.lint_timeout),
            ));
        }
        if let Some(cmd) = &self.config.type_check_command {
            checks.push((
                CheckKind::TypeCheck,
                cmd.clone(),
                Duration::from_secs(self.config.type_check_timeout),
            ));
        }
        if let Some(cmd) = &self.config.test_command {
            checks.push((
                CheckKind::Test,
                cmd.clone(),
                Duration::from_secs(self.config.test_timeout),
            ));
        }
        checks
    }

    pub fn has_checks(&self) -> bool {
        !self.configured().is_empty()
    }

    /// Run every configured check in `cwd`. With `fail_fast` the run stops
    /// at the first failure; otherwise all checks run and all failures are
    /// reported together.
    pub async fn run(&self, cwd: &Path, cancel: &CancellationToken) -> CheckRun {
        let mut run = CheckRun::default();
        for (kind, command, timeout) in self.configured() {
            if cancel.is_cancelled() {
                run.results.push(CheckResult {
                    kind,
                    command,
                    status: CheckStatus::Interrupted,
                    duration_ms: 0,
                    stderr: String::new(),
                });
                break;
            }
            let result = self.run_one(kind, &command, timeout, cwd, cancel).await;
            let failed = result.failed();
            run.results.push(result);
            if failed && self.config.fail_fast {
                debug!(check = kind.as_str(), "fail-fast: skipping remaining checks");
                break;
            }
        }
        info!(
            passed = run.passed(),
            total = run.results.len(),
            failed = run.failed_checks().len(),
            "check run finished"
        );
        run
    }

    async fn run_one(
        &self,
        kind: CheckKind,
        command: &str,
        timeout: Duration,
        cwd: &Path,
        cancel: &CancellationToken,
    ) -> CheckResult {
        debug!(check = kind.as_str(), command, "running check");
        let started = Instant::now();

        let child = match Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return CheckResult {
                    kind,
                    command: command.to_string(),
                    status: CheckStatus::Failed,
                    duration_ms: started.elapsed().as_millis() as u64,
                    stderr: format!("failed to spawn: {e}"),
                }
            }
        };

        let status = tokio::select! {
            output = child.wait_with_output() => match output {
                Ok(output) => {
                    let stderr = tail(&output.stderr);
                    let status = if output.status.success() {
                        CheckStatus::Passed
                    } else {
                        CheckStatus::Failed
                    };
                    return CheckResult {
                        kind,
                        command: command.to_string(),
                        status,
                        duration_ms: started.elapsed().as_millis() as u64,
                        stderr,
                    };
                }
                Err(e) => {
                    warn!(check = kind.as_str(), error = %e, "check wait failed");
                    CheckStatus::Failed
                }
            },
            _ = tokio::time::sleep(timeout) => {
                warn!(check = kind.as_str(), timeout_s = timeout.as_secs(), "check timed out");
                CheckStatus::TimedOut
            }
            _ = cancel.cancelled() => CheckStatus::Interrupted,
        };

        CheckResult {
            kind,
            command: command.to_string(),
            status,
            duration_ms: started.elapsed().as_millis() as u64,
            stderr: String::new(),
        }
    }
}

/// Bootstrap dependencies when the working copy needs them. Detection is by
/// manifest: npm/pnpm/yarn lockfiles trigger an install when node_modules is
/// absent; Cargo projects need nothing up front.
pub async fn install_dependencies(cwd: &Path, cancel: &CancellationToken) -> Result<(), String> {
    let command = if cwd.join("pnpm-lock.yaml").exists() {
        Some("pnpm install --frozen-lockfile")
    } else if cwd.join("yarn.lock").exists() {
        Some("yarn install --frozen-lockfile")
    } else if cwd.join("package-lock.json").exists() || cwd.join("package.json").exists() {
        Some("npm ci")
    } else {
        None
    };

    let Some(command) = command else {
        debug!("no dependency manifest requiring bootstrap");
        return Ok(());
    };
    if cwd.join("node_modules").exists() {
        debug!("node_modules already present, skipping install");
        return Ok(());
    }

    info!(command, "installing dependencies");
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn '{command}': {e}"))?;

    tokio::select! {
        output = child.wait_with_output() => {
            let output = output.map_err(|e| e.to_string())?;
            if output.status.success() {
                Ok(())
            } else {
                Err(format!(
                    "'{command}' exited with {}: {}",
                    output.status,
                    tail(&output.stderr)
                ))
            }
        }
        _ = cancel.cancelled() => Err("interrupted".to_string()),
    }
}

fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= STDERR_TAIL_BYTES {
        text.to_string()
    } else {
        let start = text.len() - STDERR_TAIL_BYTES;
        let start = text
            .char_indices()
            .map(|(i, _)| i)
            .find(|&i| i >= start)
            .unwrap_or(start);
        text[start..].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChecksConfig;

    fn runner(lint: Option<&str>, test: Option<&str>, fail_fast: bool) -> CheckRunner {
        CheckRunner::new(ChecksConfig {
            lint_command: lint.map(String::from),
            test_command: test.map(String::from),
            type_check_command: None,
            fail_fast,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn passing_checks_report_passed() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(Some("true"), Some("true"), false);
        let run = runner.run(dir.path(), &CancellationToken::new()).await;
        assert!(run.passed());
        assert_eq!(run.results.len(), 2);
    }

    #[tokio::test]
    async fn failing_check_captures_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(Some("echo boom >&2; exit 3"), None, false);
        let run = runner.run(dir.path(), &CancellationToken::new()).await;
        assert!(!run.passed());
        let failed = run.failed_checks();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].stderr.contains("boom"));
    }

    #[tokio::test]
    async fn fail_fast_skips_remaining() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(Some("false"), Some("true"), true);
        let run = runner.run(dir.path(), &CancellationToken::new()).await;
        assert_eq!(run.results.len(), 1);
        assert!(!run.passed());
    }

    #[tokio::test]
    async fn timeout_is_reported_as_timed_out() {
        let dir = tempfile::tempdir().unwrap();
        let runner = CheckRunner::new(ChecksConfig {
            test_command: Some("sleep 5".into()),
            test_timeout: 1,
            ..Default::default()
        });
        let run = runner.run(dir.path(), &CancellationToken::new()).await;
        assert_eq!(run.results[0].status, CheckStatus::TimedOut);
        assert!(run.results[0].failed());
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let runner = runner(Some("true"), Some("true"), false);
        let run = runner.run(dir.path(), &cancel).await;
        assert_eq!(run.results.len(), 1);
        assert_eq!(run.results[0].status, CheckStatus::Interrupted);
    }

    #[tokio::test]
    async fn empty_run_is_not_passed() {
        let run = CheckRun::default();
        assert!(!run.passed());
    }

    #[tokio::test]
    async fn install_noop_without_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let result = install_dependencies(dir.path(), &CancellationToken::new()).await;
        assert!(result.is_ok());
    }
}
