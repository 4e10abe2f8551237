use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use mc_core::collections;
use mc_core::types::{Event, ProjectConfig, Task};
use mc_core::{Persistence, PersistenceExt};
use mc_bus::EventBus;
use mc_providers::{with_deadline, with_retry, KanbanProvider, RetryPolicy};
use serde_json::json;
use tracing::{info, warn};

use crate::events;
use crate::leases::LeaseManager;
use crate::registry::ProjectRegistry;
use crate::{EngineError, Result};

// ---------------------------------------------------------------------------
// SyncReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub projects_added: usize,
    pub tasks_added: usize,
    pub tasks_updated: usize,
    pub tasks_removed: usize,
}

// ---------------------------------------------------------------------------
// SyncController
// ---------------------------------------------------------------------------

/// Reconciles board state with the local view.
///
/// The board is authoritative for task existence and ownership labels;
/// Marcus-local state is authoritative for lease and subtask
/// relationships. Runtime callers always pass `preserve_active = true`;
/// the `false` path exists for the initial-activation flow exercised by
/// tests.
pub struct SyncController {
    persistence: Arc<dyn Persistence>,
    registry: Arc<ProjectRegistry>,
    leases: Arc<LeaseManager>,
    provider: Arc<dyn KanbanProvider>,
    bus: EventBus,
    retry: RetryPolicy,
    board_deadline: Duration,
}

impl SyncController {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        registry: Arc<ProjectRegistry>,
        leases: Arc<LeaseManager>,
        provider: Arc<dyn KanbanProvider>,
        bus: EventBus,
        retry: RetryPolicy,
        board_deadline: Duration,
    ) -> Self {
        Self {
            persistence,
            registry,
            leases,
            provider,
            bus,
            retry,
            board_deadline,
        }
    }

    /// Pull the provider's project list, adding unseen projects (deduped by
    /// provider key). A newly discovered project is auto-selected, exactly
    /// like a created one; with `preserve_active` the pointer snapshot
    /// taken before the sync is restored afterwards iff its target still
    /// exists.
    pub async fn discover_projects(
        &self,
        auto_sync: bool,
        preserve_active: bool,
    ) -> Result<(Vec<ProjectConfig>, SyncReport)> {
        let snapshot = if preserve_active {
            self.registry.snapshot_active().await
        } else {
            None
        };

        let provider = self.provider.clone();
        let deadline = self.board_deadline;
        let remote = with_retry(self.retry, "list_projects", || {
            let provider = provider.clone();
            async move { with_deadline(deadline, provider.list_projects()).await }
        })
        .await
        .map_err(EngineError::Board)?;

        let mut report = SyncReport::default();
        let mut discovered = Vec::new();
        let mut seen_keys: HashSet<String> = HashSet::new();

        for project in remote {
            // Provider listings can repeat a project; dedupe by key.
            if !seen_keys.insert(project.key.clone()) {
                continue;
            }
            match self.registry.find_by_provider_key(&project.key).await {
                Some(existing) => discovered.push(existing),
                None => {
                    let mut config = ProjectConfig::new(&project.name, self.provider.name());
                    config.provider_config = json!({ "key": project.key });
                    let id = config.id.clone();
                    self.registry.add_project(config.clone()).await?;
                    // Newly discovered projects auto-select, like created
                    // ones; preservation below undoes this when requested.
                    self.registry.select_project(&id).await?;
                    report.projects_added += 1;
                    discovered.push(config);
                }
            }
        }

        if auto_sync {
            for project in &discovered {
                match self.refresh_tasks(&project.id).await {
                    Ok(task_report) => {
                        report.tasks_added += task_report.tasks_added;
                        report.tasks_updated += task_report.tasks_updated;
                        report.tasks_removed += task_report.tasks_removed;
                    }
                    Err(e) => {
                        warn!(project_id = %project.id, error = %e, "task refresh failed during discovery");
                    }
                }
            }
        }

        if preserve_active {
            self.registry.restore_active(snapshot).await?;
        }

        self.bus
            .publish(
                Event::new(
                    events::PROJECT_SYNCED,
                    "sync_controller",
                    json!({
                        "projects_added": report.projects_added,
                        "tasks_added": report.tasks_added,
                        "tasks_updated": report.tasks_updated,
                        "tasks_removed": report.tasks_removed,
                    }),
                ),
                false,
            )
            .await;

        Ok((discovered, report))
    }

    /// Refresh the local task view of one project from the board.
    ///
    /// Board tasks are upserted locally; local tasks the board no longer
    /// lists are removed. For a task under a live lease the local status
    /// and assignee win over the board's view.
    pub async fn refresh_tasks(&self, project_id: &str) -> Result<SyncReport> {
        let project = self
            .registry
            .get(project_id)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("project {}", project_id)))?;
        let board_key = project
            .provider_config
            .get("key")
            .and_then(|v| v.as_str())
            .unwrap_or(project_id)
            .to_string();

        let provider = self.provider.clone();
        let deadline = self.board_deadline;
        let key = board_key.clone();
        let board_tasks = with_retry(self.retry, "list_tasks", || {
            let provider = provider.clone();
            let key = key.clone();
            async move { with_deadline(deadline, provider.list_tasks(&key)).await }
        })
        .await
        .map_err(EngineError::Board)?;

        let local_tasks: Vec<Task> = self.project_tasks(project_id).await?;
        let local_by_id: HashMap<&str, &Task> = local_tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        let board_ids: HashSet<&str> = board_tasks.iter().map(|t| t.id.as_str()).collect();

        let mut report = SyncReport::default();

        for board_task in &board_tasks {
            let mut incoming = board_task.clone();
            incoming.project_id = project_id.to_string();

            match local_by_id.get(incoming.id.as_str()) {
                None => {
                    self.persistence
                        .store_typed(collections::TASKS, &incoming.id, &incoming)
                        .await?;
                    report.tasks_added += 1;
                }
                Some(local) => {
                    // Leased tasks keep their local status/assignee; Marcus
                    // is the authority on leases.
                    let leased = self
                        .leases
                        .get(&incoming.id)
                        .await?
                        .map(|l| l.status.is_live())
                        .unwrap_or(false);
                    if leased {
                        incoming.status = local.status;
                        incoming.assigned_to = local.assigned_to.clone();
                    }
                    incoming.stall_count = local.stall_count;
                    incoming.priority_escalated = local.priority_escalated;
                    self.persistence
                        .store_typed(collections::TASKS, &incoming.id, &incoming)
                        .await?;
                    report.tasks_updated += 1;
                }
            }
        }

        // The board owns existence: drop local tasks it no longer lists.
        for local in &local_tasks {
            if !board_ids.contains(local.id.as_str()) {
                if let Some(lease) = self.leases.get(&local.id).await? {
                    if lease.status.is_live() {
                        self.leases.release(&local.id, None).await?;
                    }
                }
                self.persistence.delete(collections::TASKS, &local.id).await?;
                report.tasks_removed += 1;
            }
        }

        info!(
            project_id,
            added = report.tasks_added,
            updated = report.tasks_updated,
            removed = report.tasks_removed,
            "task view refreshed"
        );
        Ok(report)
    }

    async fn project_tasks(&self, project_id: &str) -> Result<Vec<Task>> {
        let scoped = |value: &serde_json::Value| {
            value.get("project_id").and_then(|v| v.as_str()) == Some(project_id)
        };
        let rows = self
            .persistence
            .query(collections::TASKS, Some(&scoped), 0, usize::MAX)
            .await?;
        let mut tasks = Vec::with_capacity(rows.len());
        for (_, value) in rows {
            tasks.push(serde_json::from_value(value)?);
        }
        Ok(tasks)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use mc_core::config::LeaseConfig;
    use mc_core::FileStore;
    use mc_providers::InMemoryKanban;

    struct Fixture {
        controller: SyncController,
        registry: Arc<ProjectRegistry>,
        board: Arc<InMemoryKanban>,
        persistence: Arc<dyn Persistence>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let persistence: Arc<dyn Persistence> = Arc::new(FileStore::new(dir.path()));
        let registry = Arc::new(ProjectRegistry::load(persistence.clone()).await.unwrap());
        let leases = Arc::new(LeaseManager::new(persistence.clone(), LeaseConfig::default()));
        let board = Arc::new(InMemoryKanban::new());
        let controller = SyncController::new(
            persistence.clone(),
            registry.clone(),
            leases,
            board.clone(),
            EventBus::new(),
            RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(2), 2),
            Duration::from_secs(10),
        );
        Fixture {
            controller,
            registry,
            board,
            persistence,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn first_discovered_project_becomes_active() {
        let f = fixture().await;
        f.board.add_project("key-1", "Alpha").await;

        let (projects, report) = f.controller.discover_projects(false, true).await.unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(report.projects_added, 1);
        // No previous active: preservation restores nothing, so the new
        // project stays selected.
        assert_eq!(f.registry.active_project_id().await, Some(projects[0].id.clone()));
    }

    #[tokio::test]
    async fn preserve_active_keeps_the_pointer() {
        let f = fixture().await;
        f.board.add_project("key-1", "P1").await;
        let (projects, _) = f.controller.discover_projects(false, true).await.unwrap();
        let p1 = projects[0].id.clone();

        f.board.add_project("key-2", "P2").await;
        let (projects, report) = f.controller.discover_projects(false, true).await.unwrap();
        assert_eq!(projects.len(), 2);
        assert_eq!(report.projects_added, 1);
        assert_eq!(f.registry.active_project_id().await, Some(p1));
    }

    #[tokio::test]
    async fn without_preservation_the_newcomer_wins() {
        let f = fixture().await;
        f.board.add_project("key-1", "P1").await;
        let (projects, _) = f.controller.discover_projects(false, true).await.unwrap();
        let p1 = projects[0].id.clone();

        f.board.add_project("key-0", "P0").await;
        let (_, _) = f.controller.discover_projects(false, false).await.unwrap();
        let active = f.registry.active_project_id().await.unwrap();
        assert_ne!(active, p1);
        let p0 = f.registry.find_by_provider_key("key-0").await.unwrap();
        assert_eq!(active, p0.id);
    }

    #[tokio::test]
    async fn rediscovery_dedupes_by_provider_key() {
        let f = fixture().await;
        f.board.add_project("key-1", "Alpha").await;
        f.controller.discover_projects(false, true).await.unwrap();
        let (projects, report) = f.controller.discover_projects(false, true).await.unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(report.projects_added, 0);
        assert_eq!(f.registry.list().await.len(), 1);
    }

    #[tokio::test]
    async fn refresh_upserts_and_removes() {
        let f = fixture().await;
        f.board.add_project("key-1", "Alpha").await;
        let (projects, _) = f.controller.discover_projects(false, true).await.unwrap();
        let project_id = projects[0].id.clone();

        let t1 = f
            .board
            .create_task("key-1", mc_providers::NewTask { name: "one".into(), ..Default::default() })
            .await
            .unwrap();
        let t2 = f
            .board
            .create_task("key-1", mc_providers::NewTask { name: "two".into(), ..Default::default() })
            .await
            .unwrap();

        let report = f.controller.refresh_tasks(&project_id).await.unwrap();
        assert_eq!(report.tasks_added, 2);

        // Remove one from the board by re-seeding only the survivor.
        let survivors = f.board.list_tasks("key-1").await.unwrap();
        let keep = survivors.into_iter().find(|t| t.id == t1).unwrap();
        let fresh_board = InMemoryKanban::new();
        fresh_board.add_project("key-1", "Alpha").await;
        fresh_board.seed_task("key-1", keep).await;

        let controller2 = SyncController::new(
            f.persistence.clone(),
            f.registry.clone(),
            Arc::new(LeaseManager::new(f.persistence.clone(), LeaseConfig::default())),
            Arc::new(fresh_board),
            EventBus::new(),
            RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(2), 2),
            Duration::from_secs(10),
        );
        let report = controller2.refresh_tasks(&project_id).await.unwrap();
        assert_eq!(report.tasks_updated, 1);
        assert_eq!(report.tasks_removed, 1);

        let remaining = controller2.project_tasks(&project_id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, t1);
        assert!(!remaining.iter().any(|t| t.id == t2));
    }

    #[tokio::test]
    async fn leased_tasks_keep_local_status() {
        let f = fixture().await;
        f.board.add_project("key-1", "Alpha").await;
        let (projects, _) = f.controller.discover_projects(false, true).await.unwrap();
        let project_id = projects[0].id.clone();
        let task_id = f
            .board
            .create_task("key-1", mc_providers::NewTask { name: "held".into(), ..Default::default() })
            .await
            .unwrap();
        f.controller.refresh_tasks(&project_id).await.unwrap();

        // Lease it locally and mark it in progress.
        let leases = LeaseManager::new(f.persistence.clone(), LeaseConfig::default());
        leases.issue(&task_id, "a1").await.unwrap();
        let mut local: Task = f
            .persistence
            .retrieve_typed(collections::TASKS, &task_id)
            .await
            .unwrap()
            .unwrap();
        local.status = mc_core::types::TaskStatus::InProgress;
        local.assigned_to = Some("a1".into());
        f.persistence
            .store_typed(collections::TASKS, &task_id, &local)
            .await
            .unwrap();

        // The board still says todo/unassigned; a refresh must not clobber.
        f.controller.refresh_tasks(&project_id).await.unwrap();
        let after: Task = f
            .persistence
            .retrieve_typed(collections::TASKS, &task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.status, mc_core::types::TaskStatus::InProgress);
        assert_eq!(after.assigned_to.as_deref(), Some("a1"));
    }
}
