use std::collections::BTreeSet;
use std::sync::Arc;

use mc_core::ErrorKind;
use mc_engine::engine::{ProgressStatus, PullOutcome, TaskDraft};
use mc_engine::{CoordinationEngine, EngineError};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

// ---------------------------------------------------------------------------
// Error envelope
// ---------------------------------------------------------------------------

/// A tool-surface failure, rendered on the wire as
/// `{"error": {"kind", "message", "details"?}}`.
#[derive(Debug)]
pub struct ToolFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<Value>,
}

impl ToolFailure {
    pub fn envelope(&self) -> Value {
        let mut error = json!({
            "kind": self.kind,
            "message": self.message,
        });
        if let Some(details) = &self.details {
            error["details"] = details.clone();
        }
        json!({ "error": error })
    }
}

impl From<EngineError> for ToolFailure {
    fn from(e: EngineError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
            details: None,
        }
    }
}

fn invalid(message: impl Into<String>) -> ToolFailure {
    ToolFailure {
        kind: ErrorKind::InvalidInput,
        message: message.into(),
        details: None,
    }
}

pub type ToolResult = std::result::Result<Value, ToolFailure>;

// ---------------------------------------------------------------------------
// Request shapes — field names are the stable wire surface
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RegisterAgentParams {
    agent_id: String,
    role: String,
    #[serde(default)]
    skills: Vec<String>,
    #[serde(default)]
    capacity: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct AgentParams {
    agent_id: String,
}

#[derive(Debug, Deserialize)]
struct ReportProgressParams {
    agent_id: String,
    task_id: String,
    status: ProgressStatus,
    #[serde(default)]
    progress: u8,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ReportBlockerParams {
    agent_id: String,
    task_id: String,
    description: String,
    #[serde(default = "default_severity")]
    severity: String,
}

fn default_severity() -> String {
    "medium".into()
}

#[derive(Debug, Deserialize)]
struct TaskParams {
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct LogDecisionParams {
    task_id: String,
    agent_id: String,
    summary: String,
    #[serde(default)]
    rationale: String,
    #[serde(default)]
    alternatives_considered: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LogArtifactParams {
    task_id: String,
    agent_id: String,
    path: String,
    kind: String,
    #[serde(default)]
    summary: String,
}

#[derive(Debug, Deserialize)]
struct CreateProjectParams {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    options: CreateProjectOptions,
}

#[derive(Debug, Default, Deserialize)]
struct CreateProjectOptions {
    #[serde(default)]
    tasks: Vec<TaskDraft>,
}

#[derive(Debug, Deserialize)]
struct SelectProjectParams {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

// ---------------------------------------------------------------------------
// ToolRouter
// ---------------------------------------------------------------------------

/// Dispatches tool calls by name to the coordination engine. The router is
/// transport-independent; the HTTP layer (and any future MCP framing) sits
/// on top of it.
#[derive(Clone)]
pub struct ToolRouter {
    engine: Arc<CoordinationEngine>,
}

impl ToolRouter {
    pub fn new(engine: Arc<CoordinationEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<CoordinationEngine> {
        &self.engine
    }

    pub async fn handle(&self, tool: &str, params: Value) -> ToolResult {
        debug!(tool, "tool call");
        match tool {
            "register_agent" => self.register_agent(params).await,
            "unregister_agent" => self.unregister_agent(params).await,
            "heartbeat" => self.heartbeat(params).await,
            "request_next_task" => self.request_next_task(params).await,
            "report_task_progress" => self.report_task_progress(params).await,
            "report_blocker" => self.report_blocker(params).await,
            "get_task_context" => self.get_task_context(params).await,
            "log_decision" => self.log_decision(params).await,
            "log_artifact" => self.log_artifact(params).await,
            "create_project" => self.create_project(params).await,
            "select_project" => self.select_project(params).await,
            "diagnose" => self.diagnose().await,
            other => Err(invalid(format!("unknown tool '{}'", other))),
        }
    }

    async fn register_agent(&self, params: Value) -> ToolResult {
        let p: RegisterAgentParams = parse(params)?;
        let skills: BTreeSet<String> = p.skills.into_iter().collect();
        let worker = self
            .engine
            .register_agent(&p.agent_id, &p.role, skills, p.capacity)
            .await?;
        Ok(json!({ "registered": true, "agent_id": worker.agent_id, "capacity": worker.capacity }))
    }

    async fn unregister_agent(&self, params: Value) -> ToolResult {
        let p: AgentParams = parse(params)?;
        self.engine.unregister_agent(&p.agent_id).await?;
        Ok(json!({ "unregistered": true }))
    }

    async fn heartbeat(&self, params: Value) -> ToolResult {
        let p: AgentParams = parse(params)?;
        self.engine.heartbeat(&p.agent_id).await?;
        Ok(json!({ "ok": true }))
    }

    async fn request_next_task(&self, params: Value) -> ToolResult {
        let p: AgentParams = parse(params)?;
        let outcome = self.engine.request_next_task(&p.agent_id).await?;
        match outcome {
            PullOutcome::Assigned(assignment) => Ok(json!({
                "task": assignment.work,
                "lease": assignment.lease,
                "context": assignment.context,
                "instructions": assignment.instructions,
            })),
            PullOutcome::NoTask { reason } => Ok(json!({ "task": Value::Null, "reason": reason })),
        }
    }

    async fn report_task_progress(&self, params: Value) -> ToolResult {
        let p: ReportProgressParams = parse(params)?;
        self.engine
            .report_task_progress(&p.agent_id, &p.task_id, p.status, p.progress, &p.message)
            .await?;
        Ok(json!({ "ok": true }))
    }

    async fn report_blocker(&self, params: Value) -> ToolResult {
        let p: ReportBlockerParams = parse(params)?;
        self.engine
            .report_blocker(&p.agent_id, &p.task_id, &p.description, &p.severity)
            .await?;
        Ok(json!({ "ok": true }))
    }

    async fn get_task_context(&self, params: Value) -> ToolResult {
        let p: TaskParams = parse(params)?;
        let context = self.engine.get_task_context(&p.task_id).await?;
        Ok(serde_json::to_value(context).map_err(|e| invalid(e.to_string()))?)
    }

    async fn log_decision(&self, params: Value) -> ToolResult {
        let p: LogDecisionParams = parse(params)?;
        let id = self
            .engine
            .log_decision(
                &p.task_id,
                &p.agent_id,
                &p.summary,
                &p.rationale,
                p.alternatives_considered,
            )
            .await?;
        Ok(json!({ "id": id }))
    }

    async fn log_artifact(&self, params: Value) -> ToolResult {
        let p: LogArtifactParams = parse(params)?;
        let id = self
            .engine
            .log_artifact(&p.task_id, &p.agent_id, &p.path, &p.kind, &p.summary)
            .await?;
        Ok(json!({ "id": id }))
    }

    async fn create_project(&self, params: Value) -> ToolResult {
        let p: CreateProjectParams = parse(params)?;
        let outcome = self
            .engine
            .create_project(&p.name, &p.description, p.options.tasks)
            .await?;
        Ok(serde_json::to_value(outcome).map_err(|e| invalid(e.to_string()))?)
    }

    async fn select_project(&self, params: Value) -> ToolResult {
        let p: SelectProjectParams = parse(params)?;
        let selector = p
            .id
            .or(p.name)
            .ok_or_else(|| invalid("either 'id' or 'name' is required"))?;
        let project = self.engine.select_project(&selector).await?;
        Ok(json!({ "selected": project.id, "name": project.name }))
    }

    async fn diagnose(&self) -> ToolResult {
        let snapshot = self.engine.diagnose().await?;
        Ok(serde_json::to_value(snapshot).map_err(|e| invalid(e.to_string()))?)
    }
}

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ToolFailure> {
    serde_json::from_value(params).map_err(|e| invalid(format!("bad parameters: {}", e)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
