use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use mc_core::collections;
use mc_core::types::{ActiveProjectPointer, ProjectConfig};
use mc_core::{Persistence, PersistenceExt};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{EngineError, Result};

// ---------------------------------------------------------------------------
// ProjectRegistry
// ---------------------------------------------------------------------------

struct RegistryState {
    projects: HashMap<String, ProjectConfig>,
    active: Option<String>,
}

/// Tracks known projects and the single active-project pointer.
///
/// Invariant: zero or one project is active. The pointer is persisted under
/// the distinguished `projects/active_project` key, and always written
/// strictly after the project row it targets, so a crash between the two
/// writes leaves a dangling project rather than a dangling pointer.
pub struct ProjectRegistry {
    persistence: Arc<dyn Persistence>,
    state: Mutex<RegistryState>,
}

impl ProjectRegistry {
    /// Restore the registry from persistence. A pointer naming a project
    /// that no longer exists is discarded.
    pub async fn load(persistence: Arc<dyn Persistence>) -> Result<Self> {
        let rows = persistence
            .query(collections::PROJECTS, None, 0, usize::MAX)
            .await?;

        let mut projects = HashMap::new();
        let mut active = None;
        for (key, value) in rows {
            if key == collections::ACTIVE_PROJECT_KEY {
                let pointer: ActiveProjectPointer = serde_json::from_value(value)?;
                active = Some(pointer.project_id);
            } else {
                let project: ProjectConfig = serde_json::from_value(value)?;
                projects.insert(project.id.clone(), project);
            }
        }

        if let Some(id) = &active {
            if !projects.contains_key(id) {
                warn!(project_id = %id, "active pointer names a missing project; clearing");
                active = None;
            }
        }

        info!(projects = projects.len(), active = ?active, "project registry restored");
        Ok(Self {
            persistence,
            state: Mutex::new(RegistryState { projects, active }),
        })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn active_project(&self) -> Option<ProjectConfig> {
        let state = self.state.lock().await;
        state
            .active
            .as_ref()
            .and_then(|id| state.projects.get(id).cloned())
    }

    pub async fn active_project_id(&self) -> Option<String> {
        self.state.lock().await.active.clone()
    }

    pub async fn get(&self, id: &str) -> Option<ProjectConfig> {
        self.state.lock().await.projects.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<ProjectConfig> {
        let state = self.state.lock().await;
        let mut projects: Vec<ProjectConfig> = state.projects.values().cloned().collect();
        projects.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        projects
    }

    /// Find a project by provider key stored in its provider_config.
    pub async fn find_by_provider_key(&self, key: &str) -> Option<ProjectConfig> {
        let state = self.state.lock().await;
        state
            .projects
            .values()
            .find(|p| p.provider_config.get("key").and_then(|v| v.as_str()) == Some(key))
            .cloned()
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Persist a new project. The first project ever added becomes active;
    /// otherwise the active pointer is untouched.
    pub async fn add_project(&self, project: ProjectConfig) -> Result<()> {
        let mut state = self.state.lock().await;
        self.persistence
            .store_typed(collections::PROJECTS, &project.id, &project)
            .await?;
        let first = state.projects.is_empty();
        let id = project.id.clone();
        state.projects.insert(id.clone(), project);
        if first && state.active.is_none() {
            self.write_pointer(&mut state, id).await?;
        }
        Ok(())
    }

    /// Select a project by id, making it active and bumping `last_used`.
    pub async fn select_project(&self, id: &str) -> Result<ProjectConfig> {
        let mut state = self.state.lock().await;
        let Some(project) = state.projects.get_mut(id) else {
            return Err(EngineError::NotFound(format!("project {}", id)));
        };
        project.last_used = Utc::now();
        let snapshot = project.clone();
        self.persistence
            .store_typed(collections::PROJECTS, id, &snapshot)
            .await?;
        self.write_pointer(&mut state, id.to_string()).await?;
        info!(project_id = %id, name = %snapshot.name, "project selected");
        Ok(snapshot)
    }

    /// Select by name. Multiple projects with the same name is `Ambiguous`.
    pub async fn select_by_name(&self, name: &str) -> Result<ProjectConfig> {
        let id = {
            let state = self.state.lock().await;
            let matches: Vec<&ProjectConfig> =
                state.projects.values().filter(|p| p.name == name).collect();
            match matches.len() {
                0 => return Err(EngineError::NotFound(format!("project named '{}'", name))),
                1 => matches[0].id.clone(),
                n => {
                    return Err(EngineError::Ambiguous(format!(
                        "{} projects named '{}'",
                        n, name
                    )))
                }
            }
        };
        self.select_project(&id).await
    }

    /// Delete a project. When the active project is deleted, the
    /// most-recently-used survivor takes over; with no survivors the
    /// registry goes to no-active.
    pub async fn delete_project(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.projects.remove(id).is_none() {
            return Err(EngineError::NotFound(format!("project {}", id)));
        }
        self.persistence.delete(collections::PROJECTS, id).await?;

        if state.active.as_deref() == Some(id) {
            // Deterministic: most-recently-used; ties broken by id.
            let next = state
                .projects
                .values()
                .max_by(|a, b| a.last_used.cmp(&b.last_used).then(b.id.cmp(&a.id)))
                .map(|p| p.id.clone());
            match next {
                Some(next_id) => self.write_pointer(&mut state, next_id).await?,
                None => self.clear_pointer(&mut state).await?,
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sync preservation
    // -----------------------------------------------------------------------

    /// Snapshot the active id before a provider sync.
    pub async fn snapshot_active(&self) -> Option<String> {
        self.active_project_id().await
    }

    /// Restore a snapshot taken by [`snapshot_active`], iff the target
    /// still exists after the sync.
    pub async fn restore_active(&self, snapshot: Option<String>) -> Result<()> {
        let mut state = self.state.lock().await;
        match snapshot {
            Some(id) if state.projects.contains_key(&id) => {
                if state.active.as_deref() != Some(id.as_str()) {
                    self.write_pointer(&mut state, id).await?;
                }
                Ok(())
            }
            Some(id) => {
                warn!(project_id = %id, "snapshotted active project vanished during sync");
                Ok(())
            }
            None => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Pointer writes
    // -----------------------------------------------------------------------

    async fn write_pointer(&self, state: &mut RegistryState, id: String) -> Result<()> {
        debug_assert!(state.projects.contains_key(&id), "pointer target must exist");
        self.persistence
            .store_typed(
                collections::PROJECTS,
                collections::ACTIVE_PROJECT_KEY,
                &ActiveProjectPointer {
                    project_id: id.clone(),
                },
            )
            .await?;
        state.active = Some(id);
        Ok(())
    }

    async fn clear_pointer(&self, state: &mut RegistryState) -> Result<()> {
        self.persistence
            .delete(collections::PROJECTS, collections::ACTIVE_PROJECT_KEY)
            .await?;
        state.active = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use mc_core::FileStore;

    async fn registry() -> (ProjectRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Persistence> = Arc::new(FileStore::new(dir.path()));
        (ProjectRegistry::load(store).await.unwrap(), dir)
    }

    fn project(name: &str) -> ProjectConfig {
        ProjectConfig::new(name, "memory")
    }

    #[tokio::test]
    async fn first_project_becomes_active() {
        let (reg, _dir) = registry().await;
        let p = project("alpha");
        let id = p.id.clone();
        reg.add_project(p).await.unwrap();
        assert_eq!(reg.active_project_id().await, Some(id));
    }

    #[tokio::test]
    async fn second_project_does_not_steal_active() {
        let (reg, _dir) = registry().await;
        let first = project("alpha");
        let first_id = first.id.clone();
        reg.add_project(first).await.unwrap();
        reg.add_project(project("beta")).await.unwrap();
        assert_eq!(reg.active_project_id().await, Some(first_id));
    }

    #[tokio::test]
    async fn select_switches_active_and_bumps_last_used() {
        let (reg, _dir) = registry().await;
        let a = project("alpha");
        let b = project("beta");
        let b_id = b.id.clone();
        reg.add_project(a).await.unwrap();
        reg.add_project(b).await.unwrap();

        let before = reg.get(&b_id).await.unwrap().last_used;
        let selected = reg.select_project(&b_id).await.unwrap();
        assert_eq!(reg.active_project_id().await, Some(b_id));
        assert!(selected.last_used >= before);
    }

    #[tokio::test]
    async fn select_by_name_ambiguity() {
        let (reg, _dir) = registry().await;
        reg.add_project(project("dup")).await.unwrap();
        reg.add_project(project("dup")).await.unwrap();
        let err = reg.select_by_name("dup").await.unwrap_err();
        assert!(matches!(err, EngineError::Ambiguous(_)));

        let err = reg.select_by_name("missing").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn active_pointer_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Persistence> = Arc::new(FileStore::new(dir.path()));
        let selected_id = {
            let reg = ProjectRegistry::load(store.clone()).await.unwrap();
            reg.add_project(project("alpha")).await.unwrap();
            let b = project("beta");
            let id = b.id.clone();
            reg.add_project(b).await.unwrap();
            reg.select_project(&id).await.unwrap();
            id
        };

        let store2: Arc<dyn Persistence> = Arc::new(FileStore::new(dir.path()));
        let reg = ProjectRegistry::load(store2).await.unwrap();
        assert_eq!(reg.active_project_id().await, Some(selected_id));
    }

    #[tokio::test]
    async fn deleting_active_project_picks_most_recently_used() {
        let (reg, _dir) = registry().await;
        let a = project("alpha");
        let b = project("beta");
        let c = project("gamma");
        let (a_id, b_id, c_id) = (a.id.clone(), b.id.clone(), c.id.clone());
        reg.add_project(a).await.unwrap();
        reg.add_project(b).await.unwrap();
        reg.add_project(c).await.unwrap();

        // Use beta, then gamma, then switch back to alpha and delete it.
        reg.select_project(&b_id).await.unwrap();
        reg.select_project(&c_id).await.unwrap();
        reg.select_project(&a_id).await.unwrap();
        reg.delete_project(&a_id).await.unwrap();

        // gamma was used more recently than beta.
        assert_eq!(reg.active_project_id().await, Some(c_id));
    }

    #[tokio::test]
    async fn deleting_last_project_clears_active() {
        let (reg, _dir) = registry().await;
        let p = project("only");
        let id = p.id.clone();
        reg.add_project(p).await.unwrap();
        reg.delete_project(&id).await.unwrap();
        assert_eq!(reg.active_project_id().await, None);
        assert!(reg.active_project().await.is_none());
    }

    #[tokio::test]
    async fn restore_active_skips_vanished_projects() {
        let (reg, _dir) = registry().await;
        let a = project("alpha");
        let a_id = a.id.clone();
        reg.add_project(a).await.unwrap();

        let snapshot = reg.snapshot_active().await;
        assert_eq!(snapshot, Some(a_id.clone()));

        reg.delete_project(&a_id).await.unwrap();
        reg.restore_active(snapshot).await.unwrap();
        assert_eq!(reg.active_project_id().await, None);
    }

    #[tokio::test]
    async fn dangling_pointer_is_discarded_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Persistence> = Arc::new(FileStore::new(dir.path()));
        store
            .store_typed(
                collections::PROJECTS,
                collections::ACTIVE_PROJECT_KEY,
                &ActiveProjectPointer {
                    project_id: "ghost".into(),
                },
            )
            .await
            .unwrap();

        let reg = ProjectRegistry::load(store).await.unwrap();
        assert_eq!(reg.active_project_id().await, None);
    }

    #[tokio::test]
    async fn find_by_provider_key() {
        let (reg, _dir) = registry().await;
        let mut p = project("remote");
        p.provider_config = serde_json::json!({ "key": "board-7" });
        reg.add_project(p).await.unwrap();

        assert!(reg.find_by_provider_key("board-7").await.is_some());
        assert!(reg.find_by_provider_key("board-8").await.is_none());
    }
}
