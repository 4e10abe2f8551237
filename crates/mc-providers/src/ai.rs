use async_trait::async_trait;
use mc_core::types::{SharedConventions, Task, TaskContext, WorkerStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::ProviderError;

// ---------------------------------------------------------------------------
// Dependency inference wire types
// ---------------------------------------------------------------------------

/// The slice of a task the inference prompt needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskBrief {
    pub id: String,
    pub name: String,
    pub description: String,
}

impl TaskBrief {
    pub fn from_task(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            name: task.name.clone(),
            description: task.description.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyQuery {
    pub task_a: TaskBrief,
    pub task_b: TaskBrief,
}

/// Direction of an inferred dependency between the pair `(task_a, task_b)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// `task_a` depends on `task_b`.
    FirstOnSecond,
    /// `task_b` depends on `task_a`.
    SecondOnFirst,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceVerdict {
    pub direction: Direction,
    pub confidence: f64,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Decomposition wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecompositionRequest {
    pub task: TaskBrief,
    pub estimated_hours: f64,
    pub project_labels: Vec<String>,
    pub existing_task_names: Vec<String>,
    pub tech_stack: Vec<String>,
    pub max_subtasks: usize,
}

/// A subtask as proposed by the AI. Dependencies name sibling subtasks by
/// their `name`; the subtask manager resolves them to ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedSubtask {
    pub name: String,
    pub description: String,
    pub estimated_hours: f64,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub file_artifacts: Vec<String>,
    #[serde(default)]
    pub provides: String,
    #[serde(default)]
    pub requires: String,
    pub order: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecompositionResponse {
    pub subtasks: Vec<ProposedSubtask>,
    #[serde(default)]
    pub shared_conventions: SharedConventions,
}

// ---------------------------------------------------------------------------
// AIProvider
// ---------------------------------------------------------------------------

/// Capability set for the LLM used by decomposition, dependency inference,
/// and instruction generation. Local state falls back gracefully when a
/// call fails: inference drops to patterns only, instructions drop to the
/// deterministic template.
#[async_trait]
pub trait AIProvider: Send + Sync {
    async fn infer_dependencies(
        &self,
        pairs: &[DependencyQuery],
    ) -> Result<Vec<InferenceVerdict>, ProviderError>;

    async fn decompose(
        &self,
        request: DecompositionRequest,
    ) -> Result<DecompositionResponse, ProviderError>;

    async fn generate_instructions(
        &self,
        task: &Task,
        context: &TaskContext,
        agent: &WorkerStatus,
    ) -> Result<String, ProviderError>;

    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// StubAi — returns an error for every call
// ---------------------------------------------------------------------------

/// Placeholder provider that always reports itself unavailable. Used when
/// no AI is configured; every caller has a pattern-only or template
/// fallback.
#[derive(Debug, Clone, Default)]
pub struct StubAi;

#[async_trait]
impl AIProvider for StubAi {
    async fn infer_dependencies(
        &self,
        _pairs: &[DependencyQuery],
    ) -> Result<Vec<InferenceVerdict>, ProviderError> {
        Err(ProviderError::NotConfigured("ai provider".into()))
    }

    async fn decompose(
        &self,
        _request: DecompositionRequest,
    ) -> Result<DecompositionResponse, ProviderError> {
        Err(ProviderError::NotConfigured("ai provider".into()))
    }

    async fn generate_instructions(
        &self,
        _task: &Task,
        _context: &TaskContext,
        _agent: &WorkerStatus,
    ) -> Result<String, ProviderError> {
        Err(ProviderError::NotConfigured("ai provider".into()))
    }

    fn name(&self) -> &str {
        "stub"
    }
}

// ---------------------------------------------------------------------------
// ScriptedAi — canned responses for tests and local dry runs
// ---------------------------------------------------------------------------

/// Provider that replays queued responses. Each `decompose` call consumes
/// one queued decomposition; inference verdicts are replayed per batch.
#[derive(Default)]
pub struct ScriptedAi {
    decompositions: Mutex<Vec<DecompositionResponse>>,
    verdicts: Mutex<Vec<Vec<InferenceVerdict>>>,
    instructions: Mutex<Option<String>>,
}

impl ScriptedAi {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn queue_decomposition(&self, response: DecompositionResponse) {
        self.decompositions.lock().await.push(response);
    }

    pub async fn queue_verdicts(&self, verdicts: Vec<InferenceVerdict>) {
        self.verdicts.lock().await.push(verdicts);
    }

    pub async fn set_instructions(&self, text: impl Into<String>) {
        *self.instructions.lock().await = Some(text.into());
    }
}

#[async_trait]
impl AIProvider for ScriptedAi {
    async fn infer_dependencies(
        &self,
        pairs: &[DependencyQuery],
    ) -> Result<Vec<InferenceVerdict>, ProviderError> {
        let mut queued = self.verdicts.lock().await;
        if queued.is_empty() {
            // No script: report no relationship for every pair.
            return Ok(pairs
                .iter()
                .map(|_| InferenceVerdict {
                    direction: Direction::None,
                    confidence: 0.0,
                    reason: "unscripted".into(),
                })
                .collect());
        }
        Ok(queued.remove(0))
    }

    async fn decompose(
        &self,
        _request: DecompositionRequest,
    ) -> Result<DecompositionResponse, ProviderError> {
        let mut queued = self.decompositions.lock().await;
        if queued.is_empty() {
            return Err(ProviderError::Unavailable("no scripted decomposition".into()));
        }
        Ok(queued.remove(0))
    }

    async fn generate_instructions(
        &self,
        task: &Task,
        _context: &TaskContext,
        _agent: &WorkerStatus,
    ) -> Result<String, ProviderError> {
        match self.instructions.lock().await.clone() {
            Some(text) => Ok(text),
            None => Ok(format!("## {}\n\n{}", task.name, task.description)),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
