//! Code-hosting adapter: defects in, change proposals out.
//!
//! The trait is the seam the pipeline and orchestrator depend on; the
//! octocrab-backed implementation lives behind it so tests and the dry-run
//! simulator can substitute a stub.

mod github;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::defects::Defect;
use crate::errors::FixwrightError;

pub use github::GitHubHost;

/// Filter for the defect fetch.
#[derive(Debug, Clone, Default)]
pub struct DefectFilter {
    /// Only defects carrying this label.
    pub require_label: Option<String>,
    /// Never defects carrying this label.
    pub skip_label: Option<String>,
    /// Restrict to these ids (empty = no restriction).
    pub ids: Vec<u64>,
}

impl DefectFilter {
    pub fn accepts(&self, defect: &Defect) -> bool {
        if let Some(label) = &self.require_label {
            if !defect.labels.contains(label) {
                return false;
            }
        }
        if let Some(label) = &self.skip_label {
            if defect.labels.contains(label) {
                return false;
            }
        }
        self.ids.is_empty() || self.ids.contains(&defect.id)
    }
}

/// An opened change proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Publication {
    pub number: u64,
    pub url: String,
}

/// Everything needed to open a change proposal.
#[derive(Debug, Clone)]
pub struct PublicationRequest {
    pub title: String,
    pub head_branch: String,
    pub base_branch: String,
    pub body: String,
    pub issue_ids: Vec<u64>,
}

/// Narrow host interface used by the core.
#[async_trait]
pub trait HostApi: Send + Sync {
    /// Fetch open defects matching the filter.
    async fn fetch_defects(&self, filter: &DefectFilter) -> Result<Vec<Defect>, FixwrightError>;

    /// Push the head branch and open the change proposal.
    async fn publish(&self, request: &PublicationRequest) -> Result<Publication, FixwrightError>;

    /// Annotate a defect with a comment; used by the update-sources stage.
    async fn comment_defect(&self, defect_id: u64, body: &str) -> Result<(), FixwrightError>;

    /// Add a label to a defect.
    async fn add_label(&self, defect_id: u64, label: &str) -> Result<(), FixwrightError>;
}
