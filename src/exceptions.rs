//! Exception-tracker ingestion: recent unresolved exception groups become
//! defects with origin `exception-tracker`, so crash clusters flow through
//! the same remediation path as tracked issues.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::ExceptionsConfig;
use crate::defects::{
    Defect, DefectContext, DefectKind, DefectOrigin, DefectPriority, DefectState,
};
use crate::errors::FixwrightError;

/// Exception ids live in their own range so they never collide with host
/// defect numbers.
const EXCEPTION_ID_BASE: u64 = 1_000_000_000;

#[derive(Debug, Deserialize)]
struct ExceptionGroup {
    id: String,
    title: String,
    #[serde(default)]
    culprit: Option<String>,
    #[serde(default)]
    count: u64,
    #[serde(rename = "lastSeen")]
    last_seen: DateTime<Utc>,
    #[serde(rename = "firstSeen")]
    first_seen: DateTime<Utc>,
    #[serde(default)]
    permalink: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExceptionsClient {
    http: reqwest::Client,
    base_url: String,
    organization: String,
    project: String,
}

impl ExceptionsClient {
    pub fn new(config: &ExceptionsConfig) -> Result<Self, FixwrightError> {
        // The DSN doubles as endpoint + credential, the way exception
        // trackers hand them out.
        let base_url = config
            .dsn
            .rsplit_once('@')
            .map(|(_, host)| format!("https://{host}"))
            .ok_or_else(|| FixwrightError::ConfigParse("exceptions.dsn is malformed".into()))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            organization: config.organization.clone(),
            project: config.project.clone(),
        })
    }

    #[cfg(test)]
    fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self
    }

    /// Fetch recent unresolved groups and convert them to defects.
    pub async fn fetch_defects(&self, limit: usize) -> Result<Vec<Defect>, FixwrightError> {
        let url = format!(
            "{}/api/0/projects/{}/{}/issues/",
            self.base_url, self.organization, self.project
        );
        debug!(url = %url, "fetching unresolved exception groups");
        let response = self
            .http
            .get(&url)
            .query(&[("query", "is:unresolved"), ("limit", &limit.to_string())])
            .send()
            .await
            .map_err(|e| FixwrightError::ApiError {
                service: "exceptions".to_string(),
                message: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(FixwrightError::ApiError {
                service: "exceptions".to_string(),
                message: format!("HTTP {}", response.status()),
            });
        }
        let groups: Vec<ExceptionGroup> =
            response
                .json()
                .await
                .map_err(|e| FixwrightError::ApiError {
                    service: "exceptions".to_string(),
                    message: format!("decode: {e}"),
                })?;

        let defects: Vec<Defect> = groups.iter().map(group_to_defect).collect();
        info!(count = defects.len(), "ingested exception groups as defects");
        Ok(defects)
    }
}

fn group_to_defect(group: &ExceptionGroup) -> Defect {
    // Derive a stable numeric id from the group id.
    let mut hash: u64 = 1469598103934665603;
    for byte in group.id.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(1099511628211);
    }
    let id = EXCEPTION_ID_BASE + (hash % EXCEPTION_ID_BASE);

    // Frequent crashes are urgent by definition.
    let priority = if group.count >= 100 {
        DefectPriority::Critical
    } else if group.count >= 10 {
        DefectPriority::High
    } else {
        DefectPriority::Medium
    };

    let component = group
        .culprit
        .as_deref()
        .and_then(|c| c.split("::").next())
        .and_then(|c| c.split('/').next())
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());

    Defect {
        id,
        title: group.title.clone(),
        body: format!(
            "Exception group `{}` seen {} time(s).\nCulprit: {}\n",
            group.id,
            group.count,
            group.culprit.as_deref().unwrap_or("unknown")
        ),
        state: DefectState::Open,
        kind: DefectKind::Bug,
        labels: std::iter::once("exception".to_string()).collect(),
        context: DefectContext {
            component,
            priority,
            related_files: Vec::new(),
            related_symbols: group.culprit.iter().map(|c| c.to_string()).collect(),
            origin: DefectOrigin::ExceptionTracker,
        },
        created_at: group.first_seen,
        updated_at: group.last_seen,
        url: group.permalink.clone(),
        parent_id: None,
        child_ids: Vec::new(),
    }
}
