//! Task-tracker adapter: a thin REST client over the workspace/project/task
//! surface. The RPC tools and the triage command go through this; the core
//! pipeline does not depend on it.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::config::TrackerConfig;
use crate::errors::FixwrightError;

const DEFAULT_API_BASE: &str = "https://api.tracker.example.com/v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerTask {
    pub id: String,
    pub project_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub completed: bool,
}

/// Fields accepted when creating or updating a task.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct TrackerClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    workspace_id: String,
}

impl TrackerClient {
    pub fn new(config: &TrackerConfig) -> Result<Self, FixwrightError> {
        let token = config
            .token
            .clone()
            .ok_or_else(|| FixwrightError::ApiAuthFailed {
                service: "tracker".to_string(),
                message: "no token configured (set tracker.token or FIXWRIGHT_TRACKER_TOKEN)"
                    .to_string(),
            })?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: config
                .api_base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            token,
            workspace_id: config.workspace_id.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/workspaces/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.workspace_id,
            path
        )
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, FixwrightError> {
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(FixwrightError::ApiAuthFailed {
                    service: "tracker".to_string(),
                    message: format!("HTTP {}", response.status()),
                })
            }
            StatusCode::NOT_FOUND => Err(FixwrightError::ApiNotFound {
                service: "tracker".to_string(),
                resource: response.url().path().to_string(),
            }),
            StatusCode::TOO_MANY_REQUESTS => Err(FixwrightError::ApiRateLimited {
                service: "tracker".to_string(),
            }),
            status => Err(FixwrightError::ApiError {
                service: "tracker".to_string(),
                message: format!("HTTP {status}"),
            }),
        }
    }

    pub async fn list_tasks(&self, project_id: &str) -> Result<Vec<TrackerTask>, FixwrightError> {
        debug!(project_id, "listing tracker tasks");
        let response = self
            .http
            .get(self.url(&format!("projects/{project_id}/tasks")))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| FixwrightError::ApiError {
                service: "tracker".to_string(),
                message: e.to_string(),
            })?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| FixwrightError::ApiError {
                service: "tracker".to_string(),
                message: format!("decode: {e}"),
            })
    }

    pub async fn get_task(&self, task_id: &str) -> Result<TrackerTask, FixwrightError> {
        let response = self
            .http
            .get(self.url(&format!("tasks/{task_id}")))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| FixwrightError::ApiError {
                service: "tracker".to_string(),
                message: e.to_string(),
            })?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| FixwrightError::ApiError {
                service: "tracker".to_string(),
                message: format!("decode: {e}"),
            })
    }

    pub async fn create_task(
        &self,
        project_id: &str,
        patch: &TaskPatch,
    ) -> Result<TrackerTask, FixwrightError> {
        let response = self
            .http
            .post(self.url(&format!("projects/{project_id}/tasks")))
            .bearer_auth(&self.token)
            .json(patch)
            .send()
            .await
            .map_err(|e| FixwrightError::ApiError {
                service: "tracker".to_string(),
                message: e.to_string(),
            })?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| FixwrightError::ApiError {
                service: "tracker".to_string(),
                message: format!("decode: {e}"),
            })
    }

    pub async fn update_task(
        &self,
        task_id: &str,
        patch: &TaskPatch,
    ) -> Result<TrackerTask, FixwrightError> {
        let response = self
            .http
            .patch(self.url(&format!("tasks/{task_id}")))
            .bearer_auth(&self.token)
            .json(patch)
            .send()
            .await
            .map_err(|e| FixwrightError::ApiError {
                service: "tracker".to_string(),
                message: e.to_string(),
            })?;
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| FixwrightError::ApiError {
                service: "tracker".to_string(),
                message: format!("decode: {e}"),
            })
    }

    /// Move a task to a named section (triage/done columns).
    pub async fn move_to_section(
        &self,
        task_id: &str,
        section: &str,
    ) -> Result<TrackerTask, FixwrightError> {
        self.update_task(
            task_id,
            &TaskPatch {
                section: Some(section.to_string()),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn comment(&self, task_id: &str, body: &str) -> Result<(), FixwrightError> {
        let response = self
            .http
            .post(self.url(&format!("tasks/{task_id}/comments")))
            .bearer_auth(&self.token)
            .json(&json!({ "body": body }))
            .send()
            .await
            .map_err(|e| FixwrightError::ApiError {
                service: "tracker".to_string(),
                message: e.to_string(),
            })?;
        Self::check(response).await.map(|_| ())
    }
}
