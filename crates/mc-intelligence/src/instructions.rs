use std::time::Duration;

use mc_core::types::{Task, TaskContext, TaskStatus, WorkerStatus};
use mc_providers::{with_deadline, AIProvider};
use tracing::debug;

/// Produce the assignment instructions handed to an agent with its task.
///
/// Tries the AI provider first; on any failure falls back to the
/// deterministic template so `request_next_task` never fails for lack of
/// prose.
pub async fn generate(
    ai: &dyn AIProvider,
    task: &Task,
    context: &TaskContext,
    agent: &WorkerStatus,
    deadline: Duration,
) -> String {
    match with_deadline(deadline, ai.generate_instructions(task, context, agent)).await {
        Ok(text) if !text.trim().is_empty() => text,
        Ok(_) | Err(_) => {
            debug!(task_id = %task.id, "using template instructions");
            fallback_template(task, context)
        }
    }
}

/// Deterministic markdown instructions assembled from the task and its
/// materialized context.
pub fn fallback_template(task: &Task, context: &TaskContext) -> String {
    let mut out = String::new();
    out.push_str(&format!("## Task: {}\n\n", task.name));
    if !task.description.is_empty() {
        out.push_str(&task.description);
        out.push_str("\n\n");
    }

    if !context.dependencies_with_status.is_empty() {
        out.push_str("### Builds on\n");
        for dep in &context.dependencies_with_status {
            let marker = match dep.status {
                TaskStatus::Done => "done",
                TaskStatus::InProgress => "in progress",
                TaskStatus::Todo => "todo",
                TaskStatus::Blocked => "blocked",
            };
            out.push_str(&format!("- {} ({}): {}\n", dep.name, marker, dep.summary));
        }
        out.push('\n');
    }

    if let Some(conventions) = &context.shared_conventions {
        if !conventions.is_empty() {
            out.push_str("### Conventions\n");
            if let Some(base) = &conventions.base_path {
                out.push_str(&format!("- base path: {}\n", base));
            }
            if let Some(format) = &conventions.response_format {
                out.push_str(&format!("- response format: {}\n", format));
            }
            if let Some(naming) = &conventions.naming_convention {
                out.push_str(&format!("- naming: {}\n", naming));
            }
            out.push('\n');
        }
    }

    if let Some(siblings) = &context.sibling_subtasks {
        if !siblings.is_empty() {
            out.push_str("### Sibling subtasks provide\n");
            for sibling in siblings {
                out.push_str(&format!("- {}: {}\n", sibling.name, sibling.provides));
            }
            out.push('\n');
        }
    }

    if !context.related_decisions.is_empty() {
        out.push_str("### Recorded decisions\n");
        for decision in &context.related_decisions {
            out.push_str(&format!("- {}\n", decision.summary));
        }
        out.push('\n');
    }

    out.push_str("Report progress with `report_task_progress`; raise blockers with `report_blocker`.\n");
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use mc_core::types::{DependencySummary, SharedConventions, SiblingSummary};
    use mc_providers::{ScriptedAi, StubAi};

    fn context(task: &Task) -> TaskContext {
        TaskContext {
            task: task.clone(),
            dependencies_with_status: vec![DependencySummary {
                task_id: "d1".into(),
                name: "DB schema".into(),
                status: TaskStatus::Done,
                summary: "schema migrated".into(),
            }],
            dependent_tasks: vec![],
            related_decisions: vec![],
            related_artifacts: vec![],
            shared_conventions: Some(SharedConventions {
                base_path: Some("src/api".into()),
                response_format: None,
                naming_convention: None,
            }),
            sibling_subtasks: Some(vec![SiblingSummary {
                subtask_id: "s1".into(),
                name: "Design API".into(),
                provides: "endpoint contract".into(),
                status: TaskStatus::Done,
            }]),
        }
    }

    #[tokio::test]
    async fn ai_text_wins_when_available() {
        let ai = ScriptedAi::new();
        ai.set_instructions("follow the plan").await;
        let task = Task::new("t", "p1");
        let agent = WorkerStatus::new("a1", "coder");
        let text = generate(&ai, &task, &context(&task), &agent, Duration::from_secs(1)).await;
        assert_eq!(text, "follow the plan");
    }

    #[tokio::test]
    async fn outage_falls_back_to_template() {
        let task = Task::new("Build endpoint", "p1");
        let agent = WorkerStatus::new("a1", "coder");
        let text = generate(&StubAi, &task, &context(&task), &agent, Duration::from_secs(1)).await;
        assert!(text.contains("## Task: Build endpoint"));
        assert!(text.contains("DB schema (done)"));
        assert!(text.contains("base path: src/api"));
        assert!(text.contains("Design API: endpoint contract"));
    }

    #[test]
    fn template_is_deterministic() {
        let task = Task::new("t", "p1");
        let ctx = context(&task);
        assert_eq!(fallback_template(&task, &ctx), fallback_template(&task, &ctx));
    }
}
