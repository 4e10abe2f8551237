//! Persist-then-reload round trips for every domain entity, over both
//! backends.

use chrono::Utc;
use mc_core::collections;
use mc_core::persist::{FileStore, Persistence, PersistenceExt, SqliteStore};
use mc_core::types::{
    ActiveProjectPointer, Artifact, Decision, Lease, Outcome, ProjectConfig, Subtask, Task,
    TaskStatus, WorkerStatus,
};

async fn roundtrip_entities(store: &dyn Persistence) {
    let mut task = Task::new("implement auth", "p1");
    task.labels.insert("auth".into());
    task.add_dependency("t-schema");
    store
        .store_typed(collections::TASKS, &task.id, &task)
        .await
        .unwrap();
    let loaded: Task = store
        .retrieve_typed(collections::TASKS, &task.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.name, task.name);
    assert_eq!(loaded.dependencies, task.dependencies);
    assert_eq!(loaded.labels, task.labels);
    assert_eq!(loaded.status, TaskStatus::Todo);

    let subtask = Subtask::new(&task.id, "Design API", 1);
    store
        .store_typed(collections::SUBTASKS, &subtask.id, &subtask)
        .await
        .unwrap();
    let loaded: Subtask = store
        .retrieve_typed(collections::SUBTASKS, &subtask.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.parent_task_id, task.id);
    assert_eq!(loaded.order, 1);

    let lease = Lease::new(&task.id, "agent-1", 1800);
    store
        .store_typed(collections::LEASES, &lease.task_id, &lease)
        .await
        .unwrap();
    let loaded: Lease = store
        .retrieve_typed(collections::LEASES, &lease.task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.id, lease.id);
    assert_eq!(loaded.agent_id, "agent-1");

    let decision = Decision::new(&task.id, "agent-1", "use jwt sessions");
    store
        .store_typed(collections::DECISIONS, &decision.id, &decision)
        .await
        .unwrap();
    let artifact = Artifact::new(&task.id, "agent-1", "src/auth/jwt.rs", "source");
    store
        .store_typed(collections::ARTIFACTS, &artifact.id, &artifact)
        .await
        .unwrap();

    let outcome = Outcome {
        agent_id: "agent-1".into(),
        task_id: task.id.clone(),
        success: true,
        actual_hours: 2.5,
        blocker_kinds: vec![],
        labels: task.labels.clone(),
        completed_at: Utc::now(),
    };
    store
        .store_typed(collections::OUTCOMES, &format!("{}:{}", outcome.agent_id, outcome.task_id), &outcome)
        .await
        .unwrap();

    let worker = WorkerStatus::new("agent-1", "coder");
    store
        .store_typed("workers", &worker.agent_id, &worker)
        .await
        .unwrap();

    let project = ProjectConfig::new("alpha", "memory");
    store
        .store_typed(collections::PROJECTS, &project.id, &project)
        .await
        .unwrap();
    let pointer = ActiveProjectPointer {
        project_id: project.id.clone(),
    };
    store
        .store_typed(collections::PROJECTS, collections::ACTIVE_PROJECT_KEY, &pointer)
        .await
        .unwrap();
    let loaded: ActiveProjectPointer = store
        .retrieve_typed(collections::PROJECTS, collections::ACTIVE_PROJECT_KEY)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded, pointer);
}

#[tokio::test]
async fn file_backend_roundtrips_all_entities() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path());
    roundtrip_entities(&store).await;
}

#[tokio::test]
async fn sqlite_backend_roundtrips_all_entities() {
    let store = SqliteStore::open_in_memory().await.unwrap();
    roundtrip_entities(&store).await;
}
