//! Rollup: completing the last subtask completes the parent in the same
//! handler, emits the parent's completion after the subtask's, and frees
//! the parent's dependents.

mod common;

use common::{empty_project, harness, put_task, skills, task};
use mc_core::types::{SharedConventions, TaskStatus};
use mc_engine::engine::{ProgressStatus, PullOutcome, PulledWork};
use mc_providers::{DecompositionResponse, ProposedSubtask};

fn proposed(name: &str, order: u32, deps: &[&str]) -> ProposedSubtask {
    ProposedSubtask {
        name: name.into(),
        description: format!("{} work", name),
        estimated_hours: 1.0,
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        file_artifacts: vec![],
        provides: String::new(),
        requires: String::new(),
        order,
    }
}

#[tokio::test]
async fn completing_every_subtask_completes_the_parent() {
    let h = harness().await;
    let project_id = empty_project(&h, "rollup").await;

    let mut pt = task("pt", "Build portal", &project_id, TaskStatus::Todo, &[]);
    pt.estimated_hours = 5.0;
    pt.description = "api plus database plus ui".into();
    put_task(&h, &pt).await;

    // A dependent that becomes eligible only after the parent is done.
    put_task(&h, &task("after", "after", &project_id, TaskStatus::Todo, &["pt"])).await;

    h.ai.queue_decomposition(DecompositionResponse {
        subtasks: vec![
            proposed("s1", 1, &[]),
            proposed("s2", 2, &["s1"]),
            proposed("s3", 3, &["s1"]),
        ],
        shared_conventions: SharedConventions::default(),
    })
    .await;

    h.engine
        .register_agent("a1", "coder", skills(&[]), Some(4))
        .await
        .unwrap();

    // Work through every subtask, integration last.
    let mut completed_names = Vec::new();
    for _ in 0..4 {
        let PullOutcome::Assigned(assignment) = h.engine.request_next_task("a1").await.unwrap()
        else {
            panic!("expected a subtask assignment");
        };
        let PulledWork::Subtask { subtask, .. } = &assignment.work else {
            panic!("expected subtask work");
        };
        completed_names.push(subtask.name.clone());
        h.engine
            .report_task_progress("a1", &subtask.id, ProgressStatus::Completed, 100, "done")
            .await
            .unwrap();
    }
    assert_eq!(completed_names[0], "s1");
    assert!(completed_names[3].starts_with("Integrate"));

    // Parent rolled up to done in the same completion handler.
    let tasks = h.engine.project_tasks(&project_id).await.unwrap();
    let parent = tasks.iter().find(|t| t.id == "pt").unwrap();
    assert_eq!(parent.status, TaskStatus::Done);
    assert!(parent.actual_hours >= 0.0);

    // One parent completion event, emitted after the final subtask's.
    let completions: Vec<_> = h
        .engine
        .recent_events(200)
        .await
        .into_iter()
        .filter(|e| e.event_type == "task.completed")
        .collect();
    let parent_completions: Vec<_> = completions
        .iter()
        .filter(|e| e.data["task_id"] == "pt")
        .collect();
    assert_eq!(parent_completions.len(), 1);
    let last_two: Vec<_> = completions.iter().rev().take(2).collect();
    assert_eq!(last_two[0].data["task_id"], "pt");
    assert_eq!(last_two[1].data["subtask"], true);

    // The dependent is now pullable.
    let PullOutcome::Assigned(assignment) = h.engine.request_next_task("a1").await.unwrap() else {
        panic!("dependent should be eligible after rollup");
    };
    assert_eq!(assignment.work.work_id(), "after");
}

#[tokio::test]
async fn partial_completion_leaves_the_parent_open() {
    let h = harness().await;
    let project_id = empty_project(&h, "partial").await;

    let mut pt = task("pt", "Build thing", &project_id, TaskStatus::Todo, &[]);
    pt.estimated_hours = 4.5;
    pt.description = "api database ui".into();
    put_task(&h, &pt).await;

    h.ai.queue_decomposition(DecompositionResponse {
        subtasks: vec![proposed("s1", 1, &[]), proposed("s2", 2, &[])],
        shared_conventions: SharedConventions::default(),
    })
    .await;

    h.engine
        .register_agent("a1", "coder", skills(&[]), Some(4))
        .await
        .unwrap();

    let PullOutcome::Assigned(assignment) = h.engine.request_next_task("a1").await.unwrap() else {
        panic!("expected assignment");
    };
    h.engine
        .report_task_progress("a1", assignment.work.work_id(), ProgressStatus::Completed, 100, "")
        .await
        .unwrap();

    let tasks = h.engine.project_tasks(&project_id).await.unwrap();
    let parent = tasks.iter().find(|t| t.id == "pt").unwrap();
    assert_ne!(parent.status, TaskStatus::Done);
}

#[tokio::test]
async fn blocked_subtask_returns_to_the_pool_on_report() {
    let h = harness().await;
    let project_id = empty_project(&h, "blocked").await;

    let mut pt = task("pt", "Build thing", &project_id, TaskStatus::Todo, &[]);
    pt.estimated_hours = 4.5;
    pt.description = "api database ui".into();
    put_task(&h, &pt).await;

    h.ai.queue_decomposition(DecompositionResponse {
        subtasks: vec![proposed("s1", 1, &[])],
        shared_conventions: SharedConventions::default(),
    })
    .await;

    h.engine
        .register_agent("a1", "coder", skills(&[]), None)
        .await
        .unwrap();
    let PullOutcome::Assigned(assignment) = h.engine.request_next_task("a1").await.unwrap() else {
        panic!("expected assignment");
    };
    let work_id = assignment.work.work_id().to_string();

    h.engine
        .report_blocker("a1", &work_id, "missing credentials", "high")
        .await
        .unwrap();

    let blocked = h
        .engine
        .recent_events(50)
        .await
        .into_iter()
        .any(|e| e.event_type == "blocker.reported");
    assert!(blocked);

    // The lease is gone, so the agent can pull again (nothing available:
    // the only subtask is blocked).
    let outcome = h.engine.request_next_task("a1").await.unwrap();
    assert!(matches!(outcome, PullOutcome::NoTask { .. }));
}
