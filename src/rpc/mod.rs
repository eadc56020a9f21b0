//! Stdio RPC surface.
//!
//! When the binary starts without a subcommand on a non-TTY stdin it speaks
//! a line-delimited JSON request/response protocol. Each named tool is an
//! entry in a registry mapping tool name to (input schema, handler); unknown
//! names come back as typed errors rather than broken streams.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::host::{HostApi, PublicationRequest};
use crate::tracker::{TaskPatch, TrackerClient};

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub id: Value,
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub id: Value,
    pub content: Value,
    pub is_error: bool,
}

impl RpcResponse {
    fn ok(id: Value, content: Value) -> Self {
        Self {
            id,
            content,
            is_error: false,
        }
    }

    fn error(id: Value, message: impl Into<String>) -> Self {
        Self {
            id,
            content: json!({ "message": message.into() }),
            is_error: true,
        }
    }
}

/// Shared dependencies available to tool handlers.
pub struct RpcState {
    pub tracker: Option<TrackerClient>,
    pub host: Option<Arc<dyn HostApi>>,
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>;
type Handler = Arc<dyn Fn(Arc<RpcState>, Value) -> HandlerFuture + Send + Sync>;

pub struct ToolDef {
    pub description: &'static str,
    pub schema: Value,
    handler: Handler,
}

/// Registry mapping tool name to (schema, handler).
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, ToolDef>,
    state: Arc<RpcState>,
}

fn tracker_of(state: &RpcState) -> Result<TrackerClient, String> {
    state
        .tracker
        .clone()
        .ok_or_else(|| "tracker is not configured (add a [tracker] section)".to_string())
}

fn string_arg(arguments: &Value, key: &str) -> Result<String, String> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("missing required argument '{key}'"))
}

impl ToolRegistry {
    pub fn new(state: RpcState) -> Self {
        let mut registry = Self {
            tools: BTreeMap::new(),
            state: Arc::new(state),
        };
        registry.register_defaults();
        registry
    }

    fn register(&mut self, name: &'static str, tool: ToolDef) {
        self.tools.insert(name, tool);
    }

    fn register_defaults(&mut self) {
        self.register(
            "list_defects",
            ToolDef {
                description: "List tracker tasks for a project",
                schema: json!({
                    "type": "object",
                    "properties": { "project_id": { "type": "string" } },
                    "required": ["project_id"]
                }),
                handler: Arc::new(|state, arguments| {
                    Box::pin(async move {
                        let tracker = tracker_of(&state)?;
                        let project_id = string_arg(&arguments, "project_id")?;
                        let tasks = tracker
                            .list_tasks(&project_id)
                            .await
                            .map_err(|e| e.to_string())?;
                        serde_json::to_value(tasks).map_err(|e| e.to_string())
                    })
                }),
            },
        );

        self.register(
            "get_defect",
            ToolDef {
                description: "Fetch one tracker task by id",
                schema: json!({
                    "type": "object",
                    "properties": { "task_id": { "type": "string" } },
                    "required": ["task_id"]
                }),
                handler: Arc::new(|state, arguments| {
                    Box::pin(async move {
                        let tracker = tracker_of(&state)?;
                        let task_id = string_arg(&arguments, "task_id")?;
                        let task = tracker.get_task(&task_id).await.map_err(|e| e.to_string())?;
                        serde_json::to_value(task).map_err(|e| e.to_string())
                    })
                }),
            },
        );

        self.register(
            "create_defect",
            ToolDef {
                description: "Create a tracker task",
                schema: json!({
                    "type": "object",
                    "properties": {
                        "project_id": { "type": "string" },
                        "title": { "type": "string" },
                        "description": { "type": "string" }
                    },
                    "required": ["project_id", "title"]
                }),
                handler: Arc::new(|state, arguments| {
                    Box::pin(async move {
                        let tracker = tracker_of(&state)?;
                        let project_id = string_arg(&arguments, "project_id")?;
                        let patch = TaskPatch {
                            title: Some(string_arg(&arguments, "title")?),
                            description: arguments
                                .get("description")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                            ..Default::default()
                        };
                        let task = tracker
                            .create_task(&project_id, &patch)
                            .await
                            .map_err(|e| e.to_string())?;
                        serde_json::to_value(task).map_err(|e| e.to_string())
                    })
                }),
            },
        );

        self.register(
            "update_defect",
            ToolDef {
                description: "Update fields on a tracker task",
                schema: json!({
                    "type": "object",
                    "properties": {
                        "task_id": { "type": "string" },
                        "title": { "type": "string" },
                        "description": { "type": "string" },
                        "completed": { "type": "boolean" }
                    },
                    "required": ["task_id"]
                }),
                handler: Arc::new(|state, arguments| {
                    Box::pin(async move {
                        let tracker = tracker_of(&state)?;
                        let task_id = string_arg(&arguments, "task_id")?;
                        let patch = TaskPatch {
                            title: arguments
                                .get("title")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                            description: arguments
                                .get("description")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                            completed: arguments.get("completed").and_then(Value::as_bool),
                            ..Default::default()
                        };
                        let task = tracker
                            .update_task(&task_id, &patch)
                            .await
                            .map_err(|e| e.to_string())?;
                        serde_json::to_value(task).map_err(|e| e.to_string())
                    })
                }),
            },
        );

        self.register(
            "comment_defect",
            ToolDef {
                description: "Add a comment to a tracker task",
                schema: json!({
                    "type": "object",
                    "properties": {
                        "task_id": { "type": "string" },
                        "body": { "type": "string" }
                    },
                    "required": ["task_id", "body"]
                }),
                handler: Arc::new(|state, arguments| {
                    Box::pin(async move {
                        let tracker = tracker_of(&state)?;
                        let task_id = string_arg(&arguments, "task_id")?;
                        let body = string_arg(&arguments, "body")?;
                        tracker
                            .comment(&task_id, &body)
                            .await
                            .map_err(|e| e.to_string())?;
                        Ok(json!({ "ok": true }))
                    })
                }),
            },
        );

        self.register(
            "move_defect_section",
            ToolDef {
                description: "Move a tracker task to a section",
                schema: json!({
                    "type": "object",
                    "properties": {
                        "task_id": { "type": "string" },
                        "section": { "type": "string" }
                    },
                    "required": ["task_id", "section"]
                }),
                handler: Arc::new(|state, arguments| {
                    Box::pin(async move {
                        let tracker = tracker_of(&state)?;
                        let task_id = string_arg(&arguments, "task_id")?;
                        let section = string_arg(&arguments, "section")?;
                        let task = tracker
                            .move_to_section(&task_id, &section)
                            .await
                            .map_err(|e| e.to_string())?;
                        serde_json::to_value(task).map_err(|e| e.to_string())
                    })
                }),
            },
        );

        self.register(
            "create_publication",
            ToolDef {
                description: "Open a change proposal on the code host",
                schema: json!({
                    "type": "object",
                    "properties": {
                        "title": { "type": "string" },
                        "head_branch": { "type": "string" },
                        "base_branch": { "type": "string" },
                        "body": { "type": "string" }
                    },
                    "required": ["title", "head_branch", "base_branch"]
                }),
                handler: Arc::new(|state, arguments| {
                    Box::pin(async move {
                        let host = state
                            .host
                            .clone()
                            .ok_or_else(|| "host is not configured".to_string())?;
                        let request = PublicationRequest {
                            title: string_arg(&arguments, "title")?,
                            head_branch: string_arg(&arguments, "head_branch")?,
                            base_branch: string_arg(&arguments, "base_branch")?,
                            body: arguments
                                .get("body")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            issue_ids: Vec::new(),
                        };
                        let publication =
                            host.publish(&request).await.map_err(|e| e.to_string())?;
                        serde_json::to_value(publication).map_err(|e| e.to_string())
                    })
                }),
            },
        );

        self.register(
            "list_tools",
            ToolDef {
                description: "Describe the tool catalog",
                schema: json!({ "type": "object", "properties": {} }),
                handler: Arc::new(|_, _| Box::pin(async { Ok(Value::Null) })),
            },
        );
    }

    fn catalog(&self) -> Value {
        let tools: Vec<Value> = self
            .tools
            .iter()
            .map(|(name, tool)| {
                json!({
                    "name": name,
                    "description": tool.description,
                    "input_schema": tool.schema,
                })
            })
            .collect();
        json!({ "tools": tools })
    }

    /// Dispatch one request; never panics outward.
    pub async fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        debug!(tool = %request.tool, "rpc dispatch");
        if request.tool == "list_tools" {
            return RpcResponse::ok(request.id, self.catalog());
        }
        let Some(tool) = self.tools.get(request.tool.as_str()) else {
            return RpcResponse::error(
                request.id,
                format!("unknown tool '{}'", request.tool),
            );
        };
        match (tool.handler)(Arc::clone(&self.state), request.arguments).await {
            Ok(content) => RpcResponse::ok(request.id, content),
            Err(message) => RpcResponse::error(request.id, message),
        }
    }

    pub fn tool_names(&self) -> Vec<&'static str> {
        self.tools.keys().copied().collect()
    }
}

/// Serve line-delimited JSON requests on stdin until EOF.
pub async fn serve_stdio(registry: ToolRegistry) -> anyhow::Result<()> {
    info!(tools = registry.tools.len(), "stdio RPC server ready");
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(request) => registry.dispatch(request).await,
            Err(e) => {
                warn!(error = %e, "malformed rpc request");
                RpcResponse::error(Value::Null, format!("malformed request: {e}"))
            }
        };
        let mut payload = serde_json::to_vec(&response)?;
        payload.push(b'\n');
        stdout.write_all(&payload).await?;
        stdout.flush().await?;
    }
    info!("stdin closed, rpc server stopping");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ToolRegistry {
        ToolRegistry::new(RpcState {
            tracker: None,
            host: None,
        })
    }

    #[tokio::test]
    async fn unknown_tool_is_a_typed_error() {
        let response = registry()
            .dispatch(RpcRequest {
                id: json!(1),
                tool: "explode".to_string(),
                arguments: Value::Null,
            })
            .await;
        assert!(response.is_error);
        assert!(response.content["message"]
            .as_str()
            .unwrap()
            .contains("unknown tool"));
    }

    #[tokio::test]
    async fn catalog_lists_every_tool_with_schema() {
        let registry = registry();
        let response = registry
            .dispatch(RpcRequest {
                id: json!("cat"),
                tool: "list_tools".to_string(),
                arguments: Value::Null,
            })
            .await;
        assert!(!response.is_error);
        let tools = response.content["tools"].as_array().unwrap();
        assert_eq!(tools.len(), registry.tool_names().len());
        for tool in tools {
            assert!(tool["input_schema"].is_object());
        }
    }

    #[tokio::test]
    async fn missing_tracker_reports_configuration_error() {
        let response = registry()
            .dispatch(RpcRequest {
                id: json!(2),
                tool: "list_defects".to_string(),
                arguments: json!({ "project_id": "p1" }),
            })
            .await;
        assert!(response.is_error);
        assert!(response.content["message"]
            .as_str()
            .unwrap()
            .contains("tracker is not configured"));
    }

    #[tokio::test]
    async fn missing_argument_is_reported_by_name() {
        let response = registry()
            .dispatch(RpcRequest {
                id: json!(3),
                tool: "create_publication".to_string(),
                arguments: json!({ "title": "x" }),
            })
            .await;
        assert!(response.is_error);
        assert!(response.content["message"]
            .as_str()
            .unwrap()
            .contains("head_branch")
            || response.content["message"]
                .as_str()
                .unwrap()
                .contains("host"));
    }
}
