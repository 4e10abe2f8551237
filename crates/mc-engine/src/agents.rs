use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mc_core::types::WorkerStatus;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{EngineError, Result};

// ---------------------------------------------------------------------------
// WorkerRegistry
// ---------------------------------------------------------------------------

/// In-memory registry of connected agents.
///
/// Workers are created by `register_agent`, refreshed by progress reports
/// and heartbeats, and invalidated when silent past the idle TTL.
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerStatus>>,
    idle_ttl: Duration,
    default_capacity: u32,
}

impl WorkerRegistry {
    pub fn new(idle_ttl: Duration, default_capacity: u32) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            idle_ttl,
            default_capacity,
        }
    }

    pub async fn register(
        &self,
        agent_id: &str,
        role: &str,
        skills: BTreeSet<String>,
        capacity: Option<u32>,
    ) -> Result<WorkerStatus> {
        if agent_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("agent_id must not be empty".into()));
        }
        let mut workers = self.workers.write().await;
        if workers.contains_key(agent_id) {
            return Err(EngineError::AlreadyRegistered(agent_id.to_string()));
        }
        let mut worker = WorkerStatus::new(agent_id, role);
        worker.skills = skills;
        worker.capacity = capacity.unwrap_or(self.default_capacity).max(1);
        workers.insert(agent_id.to_string(), worker.clone());
        info!(agent_id, role, capacity = worker.capacity, "agent registered");
        Ok(worker)
    }

    /// Remove an agent. The caller releases its leases.
    pub async fn unregister(&self, agent_id: &str) -> Result<WorkerStatus> {
        let mut workers = self.workers.write().await;
        workers
            .remove(agent_id)
            .ok_or_else(|| EngineError::UnknownAgent(agent_id.to_string()))
    }

    pub async fn get(&self, agent_id: &str) -> Result<WorkerStatus> {
        let workers = self.workers.read().await;
        workers
            .get(agent_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownAgent(agent_id.to_string()))
    }

    pub async fn list(&self) -> Vec<WorkerStatus> {
        let workers = self.workers.read().await;
        let mut list: Vec<WorkerStatus> = workers.values().cloned().collect();
        list.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        list
    }

    pub async fn count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Refresh `last_seen`; implicit on every tool call from the agent.
    pub async fn heartbeat(&self, agent_id: &str) -> Result<()> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(agent_id)
            .ok_or_else(|| EngineError::UnknownAgent(agent_id.to_string()))?;
        worker.last_seen = Utc::now();
        Ok(())
    }

    pub async fn record_lease(&self, agent_id: &str, lease_id: &str) -> Result<()> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(agent_id)
            .ok_or_else(|| EngineError::UnknownAgent(agent_id.to_string()))?;
        if !worker.current_lease_ids.iter().any(|l| l == lease_id) {
            worker.current_lease_ids.push(lease_id.to_string());
        }
        worker.last_seen = Utc::now();
        Ok(())
    }

    /// Forget a lease; quiet when the agent has already disconnected.
    pub async fn drop_lease(&self, agent_id: &str, lease_id: &str) {
        let mut workers = self.workers.write().await;
        if let Some(worker) = workers.get_mut(agent_id) {
            worker.current_lease_ids.retain(|l| l != lease_id);
        }
    }

    pub async fn update_stats(&self, agent_id: &str, success_rate: f64, avg_duration_factor: f64) {
        let mut workers = self.workers.write().await;
        if let Some(worker) = workers.get_mut(agent_id) {
            worker.success_rate = success_rate;
            worker.avg_duration_factor = avg_duration_factor;
        }
    }

    /// Agents silent for longer than the idle TTL.
    pub async fn stale_agents(&self, now: DateTime<Utc>) -> Vec<WorkerStatus> {
        let ttl = chrono::Duration::from_std(self.idle_ttl).unwrap_or(chrono::Duration::zero());
        let workers = self.workers.read().await;
        let mut stale: Vec<WorkerStatus> = workers
            .values()
            .filter(|w| now - w.last_seen > ttl)
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        if !stale.is_empty() {
            debug!(count = stale.len(), "stale agents detected");
        }
        stale
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
