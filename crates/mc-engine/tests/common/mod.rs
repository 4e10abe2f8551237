//! Shared harness for engine scenario tests.
#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use mc_core::collections;
use mc_core::config::Config;
use mc_core::types::{Task, TaskStatus};
use mc_core::{FileStore, Persistence, PersistenceExt};
use mc_engine::CoordinationEngine;
use mc_providers::{InMemoryKanban, ScriptedAi};

pub struct Harness {
    pub engine: Arc<CoordinationEngine>,
    pub board: Arc<InMemoryKanban>,
    pub ai: Arc<ScriptedAi>,
    pub persistence: Arc<dyn Persistence>,
    pub dir: tempfile::TempDir,
}

pub async fn harness() -> Harness {
    harness_with(Config::default()).await
}

pub async fn harness_with(config: Config) -> Harness {
    let dir = tempfile::tempdir().expect("create temp dir");
    harness_in(config, dir).await
}

pub async fn harness_in(config: Config, dir: tempfile::TempDir) -> Harness {
    let persistence: Arc<dyn Persistence> = Arc::new(FileStore::new(dir.path()));
    let board = Arc::new(InMemoryKanban::new());
    let ai = Arc::new(ScriptedAi::new());
    let engine = CoordinationEngine::new(
        config,
        persistence.clone(),
        board.clone(),
        ai.clone(),
    )
    .await
    .expect("engine boots");
    Harness {
        engine,
        board,
        ai,
        persistence,
        dir,
    }
}

/// Create an empty, auto-selected project and return its id.
pub async fn empty_project(h: &Harness, name: &str) -> String {
    let outcome = h
        .engine
        .create_project(name, "", Vec::new())
        .await
        .expect("create project");
    assert!(outcome.active);
    outcome.project_id
}

/// Store a task row directly, bypassing the board (test seeding).
pub async fn put_task(h: &Harness, task: &Task) {
    h.persistence
        .store_typed(collections::TASKS, &task.id, task)
        .await
        .expect("store task");
}

pub fn task(id: &str, name: &str, project_id: &str, status: TaskStatus, deps: &[&str]) -> Task {
    let mut t = Task::new(name, project_id);
    t.id = id.to_string();
    t.status = status;
    for d in deps {
        t.add_dependency(*d);
    }
    t
}

pub fn skills(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}
