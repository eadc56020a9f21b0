//! CLI surface checks driven through the real binary.

use assert_cmd::Command;
use predicates::prelude::*;

fn fixwright() -> Command {
    let mut cmd = Command::cargo_bin("fixwright").unwrap();
    // Keep runs hermetic: no ambient tokens or config.
    cmd.env_remove("GITHUB_TOKEN")
        .env_remove("FIXWRIGHT_HOST_TOKEN")
        .env_remove("AUTO_FIX_CONFIG");
    cmd
}

#[test]
fn help_lists_all_commands() {
    fixwright()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("autofix"))
        .stdout(predicate::str::contains("triage"))
        .stdout(predicate::str::contains("init"));
}

#[test]
fn autofix_help_documents_flags() {
    fixwright()
        .args(["autofix", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--group-by"))
        .stdout(predicate::str::contains("--max-parallel"))
        .stdout(predicate::str::contains("--max-retries"))
        .stdout(predicate::str::contains("--dry-run"))
        .stdout(predicate::str::contains("--base-branch"))
        .stdout(predicate::str::contains("--issues"))
        .stdout(predicate::str::contains("--all"));
}

#[test]
fn autofix_rejects_zero_parallelism() {
    let dir = tempfile::tempdir().unwrap();
    fixwright()
        .current_dir(dir.path())
        .args(["autofix", "--all", "--max-parallel", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("0"));
}

#[test]
fn autofix_without_config_reports_validation_problems() {
    let dir = tempfile::tempdir().unwrap();
    fixwright()
        .current_dir(dir.path())
        .args(["autofix", "--all"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("host.owner"));
}

#[test]
fn init_writes_scaffold_and_refuses_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    fixwright()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("fixwright.toml"));
    assert!(dir.path().join("fixwright.toml").exists());

    let content = std::fs::read_to_string(dir.path().join("fixwright.toml")).unwrap();
    assert!(content.contains("[worktree]"));
    assert!(content.contains("[checks]"));
    assert!(content.contains("[logging]"));
    assert!(content.contains("[ai]"));

    fixwright()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));

    fixwright()
        .current_dir(dir.path())
        .args(["init", "--force"])
        .assert()
        .success();
}

#[test]
fn bare_invocation_on_pipe_requires_config() {
    // Piped stdin means RPC mode, which needs a valid configuration.
    let dir = tempfile::tempdir().unwrap();
    fixwright()
        .current_dir(dir.path())
        .write_stdin("")
        .assert()
        .failure()
        .stderr(predicate::str::contains("host.owner"));
}
