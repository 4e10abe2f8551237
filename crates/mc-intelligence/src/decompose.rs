use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mc_core::config::DecompositionOptions;
use mc_core::types::{SharedConventions, Subtask, Task, INTEGRATION_ORDER};
use mc_providers::{with_deadline, AIProvider, DecompositionRequest, TaskBrief};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::IntelligenceError;

/// Distinct component indicators the description must mention before a task
/// is considered decomposable.
const COMPONENT_VOCABULARY: &[&str] = &[
    "api", "database", "db", "model", "ui", "frontend", "backend", "auth", "endpoint", "schema",
    "migration", "service", "cache", "queue", "storage", "pipeline",
];

/// Labels that exempt a task from decomposition regardless of size.
const EXCLUDED_LABELS: &[&str] = &["bugfix", "hotfix", "refactor", "deployment", "documentation"];

const MIN_COMPONENT_INDICATORS: usize = 3;

/// Hour budget of the auto-generated integration subtask.
const INTEGRATION_HOURS: f64 = 1.0;

// ---------------------------------------------------------------------------
// should_decompose
// ---------------------------------------------------------------------------

/// A task is decomposed iff it is big enough, its description names at
/// least three distinct components, and it is not an excluded kind of work.
pub fn should_decompose(task: &Task, options: &DecompositionOptions) -> bool {
    if task.estimated_hours < options.min_hours {
        return false;
    }
    if EXCLUDED_LABELS.iter().any(|l| task.has_label(l)) {
        return false;
    }
    component_indicators(&task.description) >= MIN_COMPONENT_INDICATORS
}

fn component_indicators(description: &str) -> usize {
    let lower = description.to_lowercase();
    let words: std::collections::HashSet<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    COMPONENT_VOCABULARY.iter().filter(|v| words.contains(**v)).count()
}

// ---------------------------------------------------------------------------
// DecomposedSet
// ---------------------------------------------------------------------------

/// The persisted result of one decomposition, including the metadata that
/// goes under the parent's key in the `subtasks` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecomposedSet {
    pub parent_task_id: String,
    pub subtasks: Vec<Subtask>,
    pub shared_conventions: SharedConventions,
    pub decomposed_at: DateTime<Utc>,
    pub decomposed_by: String,
}

impl DecomposedSet {
    pub fn integration_subtask(&self) -> Option<&Subtask> {
        self.subtasks.iter().find(|s| s.is_integration())
    }
}

pub fn integration_description(parent_name: &str) -> String {
    format!(
        "Integrate the work of every '{}' subtask, resolve interface mismatches, and verify the combined result end to end.",
        parent_name
    )
}

// ---------------------------------------------------------------------------
// Decomposer
// ---------------------------------------------------------------------------

/// Requests an AI breakdown of an oversized task and normalizes the
/// response: sibling name references become ids, orders are made unique,
/// and the integration subtask is appended last.
pub struct Decomposer {
    ai: Arc<dyn AIProvider>,
    options: DecompositionOptions,
    ai_deadline: Duration,
}

impl Decomposer {
    pub fn new(ai: Arc<dyn AIProvider>, options: DecompositionOptions, ai_deadline: Duration) -> Self {
        Self { ai, options, ai_deadline }
    }

    pub fn options(&self) -> &DecompositionOptions {
        &self.options
    }

    pub fn should_decompose(&self, task: &Task) -> bool {
        should_decompose(task, &self.options)
    }

    /// Decompose `task` into subtasks. `project_labels` and
    /// `existing_task_names` give the model project context.
    pub async fn decompose(
        &self,
        task: &Task,
        project_labels: Vec<String>,
        existing_task_names: Vec<String>,
    ) -> Result<DecomposedSet, IntelligenceError> {
        let request = DecompositionRequest {
            task: TaskBrief::from_task(task),
            estimated_hours: task.estimated_hours,
            project_labels,
            existing_task_names,
            tech_stack: task.labels.iter().cloned().collect(),
            max_subtasks: self.options.max_subtasks,
        };

        let response = with_deadline(self.ai_deadline, self.ai.decompose(request)).await?;
        if response.subtasks.is_empty() {
            return Err(IntelligenceError::InvalidResponse(
                "decomposition returned no subtasks".into(),
            ));
        }

        let mut proposed = response.subtasks;
        proposed.truncate(self.options.max_subtasks);
        proposed.sort_by_key(|s| s.order);

        // First pass: materialize subtasks and record name -> id.
        let mut name_to_id: HashMap<String, String> = HashMap::new();
        let mut subtasks: Vec<Subtask> = Vec::with_capacity(proposed.len() + 1);
        for p in &proposed {
            let mut st = Subtask::new(&task.id, &p.name, p.order.min(INTEGRATION_ORDER - 1));
            st.description = p.description.clone();
            st.estimated_hours = p.estimated_hours;
            st.provides = p.provides.clone();
            st.requires = p.requires.clone();
            st.file_artifacts = p.file_artifacts.clone();
            name_to_id.insert(p.name.clone(), st.id.clone());
            subtasks.push(st);
        }

        // Second pass: resolve sibling dependencies by name.
        for (st, p) in subtasks.iter_mut().zip(&proposed) {
            for dep_name in &p.dependencies {
                match name_to_id.get(dep_name) {
                    Some(id) if *id != st.id => st.dependencies.push(id.clone()),
                    Some(_) => {}
                    None => {
                        warn!(
                            parent = %task.id,
                            subtask = %st.name,
                            dependency = %dep_name,
                            "dropping dependency on unknown sibling"
                        );
                    }
                }
            }
        }

        // The integration subtask always closes the set, depending on every
        // sibling.
        let mut integration = Subtask::new(&task.id, format!("Integrate: {}", task.name), INTEGRATION_ORDER);
        integration.description = integration_description(&task.name);
        integration.estimated_hours = INTEGRATION_HOURS;
        integration.dependencies = subtasks.iter().map(|s| s.id.clone()).collect();
        integration.requires = "all sibling subtasks complete".into();
        integration.provides = format!("integrated implementation of '{}'", task.name);
        subtasks.push(integration);

        info!(
            task_id = %task.id,
            subtasks = subtasks.len(),
            "task decomposed"
        );

        Ok(DecomposedSet {
            parent_task_id: task.id.clone(),
            subtasks,
            shared_conventions: response.shared_conventions,
            decomposed_at: Utc::now(),
            decomposed_by: "ai".into(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
