use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use mc_core::collections;
use mc_core::types::{
    Artifact, Decision, DependencySummary, DependentSummary, SharedConventions, SiblingSummary,
    Subtask, Task, TaskContext, TaskStatus,
};
use mc_core::Persistence;
use mc_graph::DependencyGraph;

use crate::Result;

// ---------------------------------------------------------------------------
// ContextBuilder
// ---------------------------------------------------------------------------

/// Materializes [`TaskContext`] views on demand. Nothing here is persisted;
/// the view is recomputed for every request so it always reflects current
/// task status.
pub struct ContextBuilder {
    persistence: Arc<dyn Persistence>,
    max_depth: usize,
}

impl ContextBuilder {
    pub fn new(persistence: Arc<dyn Persistence>, max_depth: usize) -> Self {
        Self {
            persistence,
            max_depth: max_depth.max(1),
        }
    }

    /// Build the context for a top-level task against the project's task
    /// set.
    pub async fn build(&self, task: &Task, all_tasks: &[Task]) -> Result<TaskContext> {
        let by_id: HashMap<&str, &Task> = all_tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        let graph = DependencyGraph::from_tasks(all_tasks);

        let dependencies_with_status = task
            .dependencies
            .iter()
            .filter_map(|dep| by_id.get(dep.as_str()))
            .map(|dep| DependencySummary {
                task_id: dep.id.clone(),
                name: dep.name.clone(),
                status: dep.status,
                summary: one_line(dep),
            })
            .collect();

        let dependent_tasks = graph
            .dependents_of(&task.id)
            .into_iter()
            .filter_map(|id| by_id.get(id.as_str()))
            .map(|dep| DependentSummary {
                task_id: dep.id.clone(),
                name: dep.name.clone(),
                status: dep.status,
            })
            .collect();

        // Transitive dependency closure, cut defensively at max_depth even
        // though validated graphs are acyclic.
        let closure = self.dependency_closure(task, &by_id);

        let related_decisions = self.decisions_for(&task.id, &closure).await?;
        let completed: HashSet<&str> = closure
            .iter()
            .filter(|id| {
                by_id
                    .get(id.as_str())
                    .map(|t| t.status == TaskStatus::Done)
                    .unwrap_or(false)
            })
            .map(|s| s.as_str())
            .collect();
        let related_artifacts = self.artifacts_from(&completed).await?;

        Ok(TaskContext {
            task: task.clone(),
            dependencies_with_status,
            dependent_tasks,
            related_decisions,
            related_artifacts,
            shared_conventions: None,
            sibling_subtasks: None,
        })
    }

    /// Build the context handed out with a subtask assignment: the parent's
    /// context enriched with shared conventions and every sibling's
    /// `provides`.
    pub async fn build_for_subtask(
        &self,
        subtask: &Subtask,
        parent: &Task,
        siblings: &[Subtask],
        conventions: Option<SharedConventions>,
        all_tasks: &[Task],
    ) -> Result<TaskContext> {
        let mut context = self.build(parent, all_tasks).await?;
        context.shared_conventions = conventions;
        context.sibling_subtasks = Some(
            siblings
                .iter()
                .filter(|s| s.id != subtask.id)
                .map(|s| SiblingSummary {
                    subtask_id: s.id.clone(),
                    name: s.name.clone(),
                    provides: s.provides.clone(),
                    status: s.status,
                })
                .collect(),
        );
        Ok(context)
    }

    /// Ids in the dependency closure of `task`, breadth-first, bounded by
    /// `max_depth` levels.
    fn dependency_closure(&self, task: &Task, by_id: &HashMap<&str, &Task>) -> HashSet<String> {
        let mut closure: HashSet<String> = HashSet::new();
        let mut frontier: Vec<&str> = task.dependencies.iter().map(|s| s.as_str()).collect();
        for _ in 0..self.max_depth {
            if frontier.is_empty() {
                break;
            }
            let mut next = Vec::new();
            for id in frontier.drain(..) {
                if !closure.insert(id.to_string()) {
                    continue;
                }
                if let Some(dep) = by_id.get(id) {
                    next.extend(dep.dependencies.iter().map(|s| s.as_str()));
                }
            }
            frontier = next;
        }
        closure
    }

    async fn decisions_for(
        &self,
        task_id: &str,
        dependency_closure: &HashSet<String>,
    ) -> Result<Vec<Decision>> {
        let interesting = |value: &serde_json::Value| {
            value
                .get("task_id")
                .and_then(|v| v.as_str())
                .map(|id| id == task_id || dependency_closure.contains(id))
                .unwrap_or(false)
        };
        let rows = self
            .persistence
            .query(collections::DECISIONS, Some(&interesting), 0, usize::MAX)
            .await?;
        let mut decisions = Vec::with_capacity(rows.len());
        for (_, value) in rows {
            decisions.push(serde_json::from_value(value)?);
        }
        Ok(decisions)
    }

    async fn artifacts_from(&self, completed_deps: &HashSet<&str>) -> Result<Vec<Artifact>> {
        if completed_deps.is_empty() {
            return Ok(Vec::new());
        }
        let interesting = |value: &serde_json::Value| {
            value
                .get("task_id")
                .and_then(|v| v.as_str())
                .map(|id| completed_deps.contains(id))
                .unwrap_or(false)
        };
        let rows = self
            .persistence
            .query(collections::ARTIFACTS, Some(&interesting), 0, usize::MAX)
            .await?;
        let mut artifacts = Vec::with_capacity(rows.len());
        for (_, value) in rows {
            artifacts.push(serde_json::from_value(value)?);
        }
        Ok(artifacts)
    }
}

/// One-line description of a task for dependency summaries.
fn one_line(task: &Task) -> String {
    let line = task.description.lines().next().unwrap_or("").trim();
    if line.is_empty() {
        task.name.clone()
    } else if line.chars().count() > 120 {
        let truncated: String = line.chars().take(119).collect();
        format!("{}…", truncated)
    } else {
        line.to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
