use std::collections::HashMap;

use async_trait::async_trait;
use mc_core::types::{Priority, Task, TaskStatus};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::ProviderError;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A project as the board reports it. `key` is the provider's stable
/// identifier and the deduplication key during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteProject {
    pub key: String,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub name: String,
    pub description: String,
    pub labels: Vec<String>,
    pub priority: Option<Priority>,
}

/// Partial update applied to a board task. All fields are optional; the
/// whole patch is idempotent on `(task_id, field-set)`.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub add_labels: Vec<String>,
    pub remove_labels: Vec<String>,
    /// `Some(None)` clears the assignee; `None` leaves it untouched.
    pub assigned_to: Option<Option<String>>,
}

// ---------------------------------------------------------------------------
// KanbanProvider
// ---------------------------------------------------------------------------

/// Capability set the sync controller consumes. The board is authoritative
/// for task existence and ownership labels; all write methods must be
/// idempotent so the controller can replay them after transient failures.
#[async_trait]
pub trait KanbanProvider: Send + Sync {
    async fn list_projects(&self) -> Result<Vec<RemoteProject>, ProviderError>;

    async fn list_tasks(&self, project_key: &str) -> Result<Vec<Task>, ProviderError>;

    /// Returns the provider-assigned task id.
    async fn create_task(&self, project_key: &str, task: NewTask) -> Result<String, ProviderError>;

    async fn update_task(&self, task_id: &str, patch: TaskPatch) -> Result<(), ProviderError>;

    async fn add_comment(&self, task_id: &str, text: &str) -> Result<(), ProviderError>;

    async fn create_checklist_item(
        &self,
        task_id: &str,
        text: &str,
        done: bool,
    ) -> Result<(), ProviderError>;

    /// Human-readable provider name (e.g. "planka", "linear", "github").
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// InMemoryKanban
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct BoardState {
    projects: Vec<RemoteProject>,
    /// project key -> tasks, in creation order.
    tasks: HashMap<String, Vec<Task>>,
    comments: HashMap<String, Vec<String>>,
    checklist: HashMap<String, Vec<(String, bool)>>,
}

/// In-process board used by tests and the local provider mode. Fully
/// implements the capability set with the same idempotence guarantees a
/// remote board is expected to give.
pub struct InMemoryKanban {
    state: Mutex<BoardState>,
}

impl InMemoryKanban {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BoardState::default()),
        }
    }

    pub async fn add_project(&self, key: impl Into<String>, name: impl Into<String>) {
        let mut state = self.state.lock().await;
        let key = key.into();
        if !state.projects.iter().any(|p| p.key == key) {
            state.projects.push(RemoteProject { key: key.clone(), name: name.into() });
            state.tasks.entry(key).or_default();
        }
    }

    /// Seed an existing task directly (test setup).
    pub async fn seed_task(&self, project_key: &str, task: Task) {
        let mut state = self.state.lock().await;
        state.tasks.entry(project_key.to_string()).or_default().push(task);
    }

    pub async fn comments_for(&self, task_id: &str) -> Vec<String> {
        self.state
            .lock()
            .await
            .comments
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn checklist_for(&self, task_id: &str) -> Vec<(String, bool)> {
        self.state
            .lock()
            .await
            .checklist
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for InMemoryKanban {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KanbanProvider for InMemoryKanban {
    async fn list_projects(&self) -> Result<Vec<RemoteProject>, ProviderError> {
        Ok(self.state.lock().await.projects.clone())
    }

    async fn list_tasks(&self, project_key: &str) -> Result<Vec<Task>, ProviderError> {
        let state = self.state.lock().await;
        state
            .tasks
            .get(project_key)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("project {}", project_key)))
    }

    async fn create_task(&self, project_key: &str, new: NewTask) -> Result<String, ProviderError> {
        let mut state = self.state.lock().await;
        if !state.projects.iter().any(|p| p.key == project_key) {
            return Err(ProviderError::NotFound(format!("project {}", project_key)));
        }
        let mut task = Task::new(new.name, project_key);
        task.id = Uuid::new_v4().to_string();
        task.description = new.description;
        task.labels = new.labels.into_iter().collect();
        if let Some(priority) = new.priority {
            task.priority = priority;
        }
        let id = task.id.clone();
        state.tasks.entry(project_key.to_string()).or_default().push(task);
        Ok(id)
    }

    async fn update_task(&self, task_id: &str, patch: TaskPatch) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        for tasks in state.tasks.values_mut() {
            if let Some(task) = tasks.iter_mut().find(|t| t.id == task_id) {
                if let Some(status) = patch.status {
                    task.status = status;
                }
                for label in &patch.add_labels {
                    task.labels.insert(label.clone());
                }
                for label in &patch.remove_labels {
                    task.labels.remove(label);
                }
                if let Some(assignee) = patch.assigned_to.clone() {
                    task.assigned_to = assignee;
                }
                task.touch();
                return Ok(());
            }
        }
        Err(ProviderError::NotFound(format!("task {}", task_id)))
    }

    async fn add_comment(&self, task_id: &str, text: &str) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        state
            .comments
            .entry(task_id.to_string())
            .or_default()
            .push(text.to_string());
        Ok(())
    }

    async fn create_checklist_item(
        &self,
        task_id: &str,
        text: &str,
        done: bool,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.lock().await;
        let items = state.checklist.entry(task_id.to_string()).or_default();
        // Idempotent on (task_id, text): re-creating an item updates it.
        if let Some(existing) = items.iter_mut().find(|(t, _)| t == text) {
            existing.1 = done;
        } else {
            items.push((text.to_string(), done));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
