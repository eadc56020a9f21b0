//! GitHub implementation of the host adapter, built on octocrab.

use std::collections::BTreeSet;
use std::path::PathBuf;

use async_trait::async_trait;
use octocrab::Octocrab;
use tracing::{debug, info};

use crate::config::HostConfig;
use crate::defects::{
    Defect, DefectContext, DefectKind, DefectOrigin, DefectPriority, DefectState,
};
use crate::errors::FixwrightError;
use crate::worktree::run_git_in;

use super::{DefectFilter, HostApi, Publication, PublicationRequest};

const COMPONENT_LABEL_PREFIX: &str = "component:";
/// Coarse cap on paths pulled out of a defect body.
const MAX_BODY_FILES: usize = 10;

#[derive(Debug)]
pub struct GitHubHost {
    octocrab: Octocrab,
    owner: String,
    repo: String,
    /// Where `git push` runs from when publishing.
    repo_root: PathBuf,
}

impl GitHubHost {
    pub fn new(config: &HostConfig, repo_root: impl Into<PathBuf>) -> Result<Self, FixwrightError> {
        let token = config
            .token
            .clone()
            .ok_or_else(|| FixwrightError::ApiAuthFailed {
                service: "github".to_string(),
                message: "no token configured (set host.token or FIXWRIGHT_HOST_TOKEN)"
                    .to_string(),
            })?;

        let mut builder = Octocrab::builder().personal_token(token);
        if let Some(base) = &config.api_base_url {
            builder = builder
                .base_uri(base.clone())
                .map_err(|e| FixwrightError::ApiError {
                    service: "github".to_string(),
                    message: format!("invalid api_base_url: {e}"),
                })?;
        }
        let octocrab = builder.build().map_err(|e| FixwrightError::ApiError {
            service: "github".to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            octocrab,
            owner: config.owner.clone(),
            repo: config.repo.clone(),
            repo_root: repo_root.into(),
        })
    }

    fn map_api_error(e: octocrab::Error) -> FixwrightError {
        let text = e.to_string();
        let lowered = text.to_ascii_lowercase();
        if lowered.contains("rate limit") {
            FixwrightError::ApiRateLimited {
                service: "github".to_string(),
            }
        } else if lowered.contains("401") || lowered.contains("unauthorized") {
            FixwrightError::ApiAuthFailed {
                service: "github".to_string(),
                message: text,
            }
        } else if lowered.contains("404") || lowered.contains("not found") {
            FixwrightError::ApiNotFound {
                service: "github".to_string(),
                resource: text,
            }
        } else {
            FixwrightError::ApiError {
                service: "github".to_string(),
                message: text,
            }
        }
    }

    /// Map a GitHub issue onto the defect model. Kind, priority, and
    /// component come from labels; related files are a coarse scan of
    /// backticked paths in the body.
    fn issue_to_defect(issue: &octocrab::models::issues::Issue) -> Defect {
        let labels: BTreeSet<String> = issue.labels.iter().map(|l| l.name.clone()).collect();
        let label_list: Vec<&str> = labels.iter().map(String::as_str).collect();

        let kind = labels
            .iter()
            .find_map(|l| DefectKind::from_label(l))
            .unwrap_or(DefectKind::Bug);
        let priority = DefectPriority::from_labels(&label_list);
        let component = labels
            .iter()
            .find_map(|l| l.strip_prefix(COMPONENT_LABEL_PREFIX))
            .map(str::to_string);

        let body = issue.body.clone().unwrap_or_default();
        let state = match issue.state {
            octocrab::models::IssueState::Closed => DefectState::Closed,
            _ => DefectState::Open,
        };

        Defect {
            id: issue.number,
            title: issue.title.clone(),
            state,
            kind,
            context: DefectContext {
                component,
                priority,
                related_files: extract_paths(&body),
                related_symbols: Vec::new(),
                origin: DefectOrigin::Host,
            },
            labels,
            body,
            created_at: issue.created_at,
            updated_at: issue.updated_at,
            url: Some(issue.html_url.to_string()),
            parent_id: None,
            child_ids: Vec::new(),
        }
    }
}

/// Backticked tokens that look like repository paths.
fn extract_paths(body: &str) -> Vec<String> {
    let mut paths = Vec::new();
    let mut rest = body;
    while let Some(start) = rest.find('`') {
        let after = &rest[start + 1..];
        let Some(end) = after.find('`') else { break };
        let candidate = &after[..end];
        if candidate.contains('/')
            && candidate.contains('.')
            && !candidate.contains(char::is_whitespace)
            && !paths.iter().any(|p| p == candidate)
        {
            paths.push(candidate.to_string());
            if paths.len() >= MAX_BODY_FILES {
                break;
            }
        }
        rest = &after[end + 1..];
    }
    paths
}

#[async_trait]
impl HostApi for GitHubHost {
    async fn fetch_defects(&self, filter: &DefectFilter) -> Result<Vec<Defect>, FixwrightError> {
        debug!(owner = %self.owner, repo = %self.repo, "fetching open defects");
        let mut page = self
            .octocrab
            .issues(&self.owner, &self.repo)
            .list()
            .state(octocrab::params::State::Open)
            .per_page(100)
            .send()
            .await
            .map_err(Self::map_api_error)?;

        let mut defects = Vec::new();
        loop {
            for issue in &page.items {
                // Pull requests surface through the issues API too.
                if issue.pull_request.is_some() {
                    continue;
                }
                let defect = Self::issue_to_defect(issue);
                if filter.accepts(&defect) {
                    defects.push(defect);
                }
            }
            match self
                .octocrab
                .get_page(&page.next)
                .await
                .map_err(Self::map_api_error)?
            {
                Some(next) => page = next,
                None => break,
            }
        }
        info!(count = defects.len(), "fetched defects");
        Ok(defects)
    }

    async fn publish(&self, request: &PublicationRequest) -> Result<Publication, FixwrightError> {
        // Push first; opening a proposal for an unpushed branch cannot work.
        run_git_in(
            &self.repo_root,
            &["push", "origin", &request.head_branch],
        )
        .await
        .map_err(|message| FixwrightError::ApiError {
            service: "git-push".to_string(),
            message,
        })?;

        let pr = self
            .octocrab
            .pulls(&self.owner, &self.repo)
            .create(&request.title, &request.head_branch, &request.base_branch)
            .body(&request.body)
            .send()
            .await
            .map_err(Self::map_api_error)?;

        let url = pr
            .html_url
            .as_ref()
            .map(|u| u.to_string())
            .unwrap_or_else(|| {
                format!(
                    "https://github.com/{}/{}/pull/{}",
                    self.owner, self.repo, pr.number
                )
            });
        info!(number = pr.number, url = %url, "publication opened");
        Ok(Publication {
            number: pr.number,
            url,
        })
    }

    async fn comment_defect(&self, defect_id: u64, body: &str) -> Result<(), FixwrightError> {
        self.octocrab
            .issues(&self.owner, &self.repo)
            .create_comment(defect_id, body)
            .await
            .map(|_| ())
            .map_err(Self::map_api_error)
    }

    async fn add_label(&self, defect_id: u64, label: &str) -> Result<(), FixwrightError> {
        self.octocrab
            .issues(&self.owner, &self.repo)
            .add_labels(defect_id, &[label.to_string()])
            .await
            .map(|_| ())
            .map_err(Self::map_api_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_paths_finds_backticked_files() {
        let body = "Crash in `src/auth/session.rs` when `token` expires, see `lib/util.ts`.";
        let paths = extract_paths(body);
        assert_eq!(paths, vec!["src/auth/session.rs", "lib/util.ts"]);
    }

    #[test]
    fn extract_paths_ignores_non_paths() {
        assert!(extract_paths("run `cargo test` first").is_empty());
        assert!(extract_paths("no code at all").is_empty());
    }
}
