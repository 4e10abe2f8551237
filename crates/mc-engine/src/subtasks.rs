use std::sync::Arc;

use chrono::{DateTime, Utc};
use mc_core::collections;
use mc_core::types::{SharedConventions, Subtask, TaskStatus};
use mc_core::{Persistence, PersistenceExt};
use mc_intelligence::DecomposedSet;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{EngineError, Result};

// ---------------------------------------------------------------------------
// Persistence shapes
// ---------------------------------------------------------------------------

/// Index row stored under `parent_{parent_id}` in the `subtasks`
/// collection; individual subtasks live under their own ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ParentIndex {
    subtask_ids: Vec<String>,
    shared_conventions: SharedConventions,
    decomposed_at: DateTime<Utc>,
    decomposed_by: String,
}

fn parent_key(parent_id: &str) -> String {
    format!("parent_{}", parent_id)
}

// ---------------------------------------------------------------------------
// RollupResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RollupResult {
    pub parent_task_id: String,
    pub completion_percent: u8,
    /// True exactly when every sibling (integration included) is done.
    pub parent_done: bool,
}

// ---------------------------------------------------------------------------
// SubtaskManager
// ---------------------------------------------------------------------------

/// Tracks subtask/parent relationships and rolls subtask completion up
/// into the parent. Subtasks exist only through decomposition (C7); the
/// board never sees them as first-class cards.
pub struct SubtaskManager {
    persistence: Arc<dyn Persistence>,
}

impl SubtaskManager {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Persist a fresh decomposition: every subtask row, then the parent
    /// index. The index write lands last so a crash mid-way leaves no
    /// half-visible decomposition.
    pub async fn store_decomposition(&self, set: &DecomposedSet) -> Result<()> {
        for subtask in &set.subtasks {
            self.persistence
                .store_typed(collections::SUBTASKS, &subtask.id, subtask)
                .await?;
        }
        let index = ParentIndex {
            subtask_ids: set.subtasks.iter().map(|s| s.id.clone()).collect(),
            shared_conventions: set.shared_conventions.clone(),
            decomposed_at: set.decomposed_at,
            decomposed_by: set.decomposed_by.clone(),
        };
        self.persistence
            .store_typed(collections::SUBTASKS, &parent_key(&set.parent_task_id), &index)
            .await?;
        info!(
            parent = %set.parent_task_id,
            subtasks = index.subtask_ids.len(),
            "decomposition stored"
        );
        Ok(())
    }

    pub async fn has_decomposition(&self, parent_id: &str) -> Result<bool> {
        Ok(self
            .persistence
            .retrieve(collections::SUBTASKS, &parent_key(parent_id))
            .await?
            .is_some())
    }

    async fn index_for(&self, parent_id: &str) -> Result<Option<ParentIndex>> {
        Ok(self
            .persistence
            .retrieve_typed(collections::SUBTASKS, &parent_key(parent_id))
            .await?)
    }

    /// All subtasks of a parent, ordered by `order` then id.
    pub async fn subtasks_for(&self, parent_id: &str) -> Result<Vec<Subtask>> {
        let Some(index) = self.index_for(parent_id).await? else {
            return Ok(Vec::new());
        };
        let mut subtasks = Vec::with_capacity(index.subtask_ids.len());
        for id in &index.subtask_ids {
            if let Some(subtask) = self
                .persistence
                .retrieve_typed::<Subtask>(collections::SUBTASKS, id)
                .await?
            {
                subtasks.push(subtask);
            }
        }
        subtasks.sort_by(|a, b| a.order.cmp(&b.order).then(a.id.cmp(&b.id)));
        Ok(subtasks)
    }

    pub async fn conventions_for(&self, parent_id: &str) -> Result<Option<SharedConventions>> {
        Ok(self.index_for(parent_id).await?.map(|i| i.shared_conventions))
    }

    pub async fn get(&self, subtask_id: &str) -> Result<Option<Subtask>> {
        Ok(self
            .persistence
            .retrieve_typed(collections::SUBTASKS, subtask_id)
            .await?)
    }

    pub async fn save(&self, subtask: &Subtask) -> Result<()> {
        self.persistence
            .store_typed(collections::SUBTASKS, &subtask.id, subtask)
            .await?;
        Ok(())
    }

    /// Subtasks of the given parents that are still open (not done), with
    /// their parent id. Used by the scheduler's subtask-first candidate
    /// pass.
    pub async fn open_subtasks_for(&self, parent_ids: &[String]) -> Result<Vec<Subtask>> {
        let mut open = Vec::new();
        for parent_id in parent_ids {
            for subtask in self.subtasks_for(parent_id).await? {
                if subtask.status != TaskStatus::Done {
                    open.push(subtask);
                }
            }
        }
        Ok(open)
    }

    /// Percentage of a parent's subtasks that are done.
    pub async fn completion_percent(&self, parent_id: &str) -> Result<u8> {
        let subtasks = self.subtasks_for(parent_id).await?;
        if subtasks.is_empty() {
            return Ok(0);
        }
        let done = subtasks.iter().filter(|s| s.status == TaskStatus::Done).count();
        Ok(((done * 100) / subtasks.len()) as u8)
    }

    /// Recompute the parent's completion after `subtask_id` changed.
    /// `parent_done` is true iff every sibling is done; the caller then
    /// transitions the parent and emits `task.completed`.
    pub async fn rollup(&self, subtask_id: &str) -> Result<RollupResult> {
        let subtask = self
            .get(subtask_id)
            .await?
            .ok_or_else(|| EngineError::UnknownTask(subtask_id.to_string()))?;
        let siblings = self.subtasks_for(&subtask.parent_task_id).await?;
        let done = siblings.iter().filter(|s| s.status == TaskStatus::Done).count();
        let percent = if siblings.is_empty() {
            0
        } else {
            ((done * 100) / siblings.len()) as u8
        };
        Ok(RollupResult {
            parent_task_id: subtask.parent_task_id,
            completion_percent: percent,
            parent_done: !siblings.is_empty() && done == siblings.len(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
