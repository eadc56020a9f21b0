//! Shared fixtures: a scratch git repository, a scriptable fixing agent,
//! and a recording host stub.
#![allow(dead_code)] // each test binary uses a different subset

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use git2::{BranchType, Repository, Signature};
use tokio_util::sync::CancellationToken;

use fixwright::agent::{
    AgentError, AgentInvocation, AgentRequest, AgentUsage, AnalysisResult, Complexity, FixResult,
    FixingAgent,
};
use fixwright::config::FixwrightConfig;
use fixwright::defects::{
    Defect, DefectContext, DefectKind, DefectOrigin, DefectPriority, DefectState,
};
use fixwright::errors::FixwrightError;
use fixwright::host::{DefectFilter, HostApi, Publication, PublicationRequest};

/// Scratch repository with one commit on `main`.
pub fn scratch_repo() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let repo = Repository::init(dir.path()).unwrap();
    let signature = Signature::now("Test", "test@example.com").unwrap();
    std::fs::write(dir.path().join("README.md"), "scratch\n").unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(std::path::Path::new("README.md")).unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    repo.commit(Some("HEAD"), &signature, &signature, "initial", &tree, &[])
        .unwrap();
    let head = repo.head().unwrap().peel_to_commit().unwrap();
    if repo.find_branch("main", BranchType::Local).is_err() {
        repo.branch("main", &head, false).unwrap();
    }
    let path = dir.path().to_path_buf();
    (dir, path)
}

pub fn make_defect(id: u64, kind: DefectKind, priority: DefectPriority, component: &str) -> Defect {
    let now = Utc::now();
    Defect {
        id,
        title: format!("Defect #{id}"),
        body: String::new(),
        state: DefectState::Open,
        kind,
        labels: BTreeSet::from(["auto-fix".to_string()]),
        context: DefectContext {
            component: Some(component.to_string()),
            priority,
            related_files: Vec::new(),
            related_symbols: Vec::new(),
            origin: DefectOrigin::Host,
        },
        created_at: now,
        updated_at: now,
        url: None,
        parent_id: None,
        child_ids: Vec::new(),
    }
}

/// Minimal valid config rooted in the scratch repo.
pub fn test_config() -> FixwrightConfig {
    let mut config = FixwrightConfig::default();
    config.host.owner = "acme".to_string();
    config.host.repo = "rocket".to_string();
    config.ai.max_budget_per_issue = None;
    config.ai.max_budget_per_session = None;
    config
}

/// Scriptable fixing agent. The fix call writes a file into the working
/// copy so the changed-on-disk verification passes, and can be told to
/// trigger a callback (e.g. an interrupt) on invocation.
pub struct ScriptedAgent {
    pub fix_calls: AtomicU64,
    pub analysis_calls: AtomicU64,
    pub on_fix: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl Default for ScriptedAgent {
    fn default() -> Self {
        Self {
            fix_calls: AtomicU64::new(0),
            analysis_calls: AtomicU64::new(0),
            on_fix: Mutex::new(None),
        }
    }
}

impl ScriptedAgent {
    pub fn with_on_fix(callback: impl Fn() + Send + Sync + 'static) -> Self {
        let agent = Self::default();
        *agent.on_fix.lock().unwrap() = Some(Box::new(callback));
        agent
    }
}

#[async_trait]
impl FixingAgent for ScriptedAgent {
    async fn analyze(
        &self,
        _request: &AgentRequest,
        _cancel: &CancellationToken,
    ) -> Result<AgentInvocation<AnalysisResult>, AgentError> {
        self.analysis_calls.fetch_add(1, Ordering::SeqCst);
        Ok(AgentInvocation {
            result: AnalysisResult {
                confidence: 0.9,
                root_cause: "stale guard".to_string(),
                suggested_fix: "tighten the guard".to_string(),
                affected_files: vec!["src/a.rs".to_string()],
                complexity: Complexity::Low,
            },
            usage: AgentUsage {
                input_tokens: 50,
                output_tokens: 10,
                cost_usd: 0.01,
            },
        })
    }

    async fn apply_fix(
        &self,
        request: &AgentRequest,
        _cancel: &CancellationToken,
    ) -> Result<AgentInvocation<FixResult>, AgentError> {
        let call = self.fix_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(callback) = self.on_fix.lock().unwrap().as_ref() {
            callback();
        }
        std::fs::write(
            request.workdir.join(format!("patched-{call}.txt")),
            "automated change\n",
        )
        .map_err(AgentError::Io)?;
        Ok(AgentInvocation {
            result: FixResult {
                success: true,
                summary: "patched the guard".to_string(),
                files_changed: vec![format!("patched-{call}.txt")],
            },
            usage: AgentUsage {
                input_tokens: 80,
                output_tokens: 30,
                cost_usd: 0.02,
            },
        })
    }
}

#[derive(Default)]
pub struct RecordedCalls {
    pub publications: Vec<PublicationRequest>,
    pub comments: Vec<(u64, String)>,
    pub labels: Vec<(u64, String)>,
}

/// Host stub: serves a fixed defect list, records writes, never pushes.
pub struct StubHost {
    pub defects: Vec<Defect>,
    pub calls: Mutex<RecordedCalls>,
    next_pr: AtomicU64,
}

impl StubHost {
    pub fn new(defects: Vec<Defect>) -> Self {
        Self {
            defects,
            calls: Mutex::new(RecordedCalls::default()),
            next_pr: AtomicU64::new(1),
        }
    }

    pub fn publication_count(&self) -> usize {
        self.calls.lock().unwrap().publications.len()
    }
}

#[async_trait]
impl HostApi for StubHost {
    async fn fetch_defects(&self, filter: &DefectFilter) -> Result<Vec<Defect>, FixwrightError> {
        Ok(self
            .defects
            .iter()
            .filter(|d| filter.accepts(d))
            .cloned()
            .collect())
    }

    async fn publish(&self, request: &PublicationRequest) -> Result<Publication, FixwrightError> {
        let number = self.next_pr.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().unwrap().publications.push(request.clone());
        Ok(Publication {
            number,
            url: format!("https://github.com/acme/rocket/pull/{number}"),
        })
    }

    async fn comment_defect(&self, defect_id: u64, body: &str) -> Result<(), FixwrightError> {
        self.calls
            .lock()
            .unwrap()
            .comments
            .push((defect_id, body.to_string()));
        Ok(())
    }

    async fn add_label(&self, defect_id: u64, label: &str) -> Result<(), FixwrightError> {
        self.calls
            .lock()
            .unwrap()
            .labels
            .push((defect_id, label.to_string()));
        Ok(())
    }
}

/// Number of worktree directories remaining under the configured prefix.
pub fn worktree_dirs(repo_root: &std::path::Path, config: &FixwrightConfig) -> usize {
    let base = repo_root.join(&config.worktree.base_dir);
    match std::fs::read_dir(base) {
        Ok(entries) => entries
            .flatten()
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with(&config.worktree.prefix)
            })
            .count(),
        Err(_) => 0,
    }
}
