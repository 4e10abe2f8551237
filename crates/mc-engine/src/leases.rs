use std::sync::Arc;

use chrono::{DateTime, Utc};
use mc_core::collections;
use mc_core::config::LeaseConfig;
use mc_core::types::{Lease, LeaseStatus};
use mc_core::{Persistence, PersistenceExt};
use tracing::{info, warn};

use crate::{EngineError, Result};

// ---------------------------------------------------------------------------
// LeaseManager
// ---------------------------------------------------------------------------

/// A lease recovered from a stall by the monitor.
#[derive(Debug, Clone)]
pub struct RecoveredLease {
    pub task_id: String,
    pub previous_agent: String,
    pub lease_id: String,
}

/// Issues, renews, releases, and recovers task leases.
///
/// The lease record is the authority for task ownership. Records live in
/// the `leases` collection keyed by task id, which enforces at most one
/// lease record (and therefore at most one live lease) per task. Leases
/// are durable before the caller is acknowledged; board updates are
/// idempotent replays layered above.
pub struct LeaseManager {
    persistence: Arc<dyn Persistence>,
    config: LeaseConfig,
}

impl LeaseManager {
    pub fn new(persistence: Arc<dyn Persistence>, config: LeaseConfig) -> Self {
        Self { persistence, config }
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<Lease>> {
        Ok(self
            .persistence
            .retrieve_typed(collections::LEASES, task_id)
            .await?)
    }

    /// Issue a lease binding `task_id` to `agent_id`. Fails with `Conflict`
    /// when a live lease already exists. The write is durable before this
    /// returns; callers flip the task status only afterwards.
    pub async fn issue(&self, task_id: &str, agent_id: &str) -> Result<Lease> {
        if let Some(existing) = self.get(task_id).await? {
            if existing.status.is_live() {
                return Err(EngineError::Conflict(format!(
                    "task {} already leased to {}",
                    task_id, existing.agent_id
                )));
            }
        }
        let lease = Lease::new(task_id, agent_id, self.config.initial_ttl_secs as i64);
        self.persistence
            .store_typed(collections::LEASES, task_id, &lease)
            .await?;
        info!(task_id, agent_id, lease_id = %lease.id, "lease issued");
        Ok(lease)
    }

    /// Undo a lease issued inside a failed critical section.
    pub async fn rollback(&self, task_id: &str, lease_id: &str) -> Result<()> {
        if let Some(lease) = self.get(task_id).await? {
            if lease.id == lease_id {
                self.persistence.delete(collections::LEASES, task_id).await?;
                warn!(task_id, lease_id, "lease rolled back");
            }
        }
        Ok(())
    }

    /// Renew a lease, implicitly (progress report) or explicitly
    /// (heartbeat). Renewal extends the window up to the renewal budget and
    /// the hard cap; past either, the current expiry stands.
    pub async fn renew(&self, task_id: &str, agent_id: &str) -> Result<Lease> {
        let mut lease = self
            .get(task_id)
            .await?
            .ok_or_else(|| EngineError::StaleLease(format!("no lease for task {}", task_id)))?;

        if !lease.status.is_live() {
            return Err(EngineError::StaleLease(format!(
                "lease for task {} is {:?}",
                task_id, lease.status
            )));
        }
        if lease.agent_id != agent_id {
            return Err(EngineError::StaleLease(format!(
                "task {} is leased to {}",
                task_id, lease.agent_id
            )));
        }

        let now = Utc::now();
        lease.last_heartbeat = now;
        if lease.renewals < self.config.max_renewals {
            let hard_cap =
                lease.issued_at + chrono::Duration::seconds(self.config.hard_cap_secs as i64);
            let extended = now + chrono::Duration::seconds(self.config.initial_ttl_secs as i64);
            lease.expires_at = extended.min(hard_cap);
            lease.renewals += 1;
            lease.status = LeaseStatus::Renewed;
        }
        self.persistence
            .store_typed(collections::LEASES, task_id, &lease)
            .await?;
        Ok(lease)
    }

    /// Release a lease. `agent_id = None` releases unconditionally (used on
    /// disconnect and rollup).
    pub async fn release(&self, task_id: &str, agent_id: Option<&str>) -> Result<Lease> {
        let mut lease = self
            .get(task_id)
            .await?
            .ok_or_else(|| EngineError::StaleLease(format!("no lease for task {}", task_id)))?;
        if let Some(agent) = agent_id {
            if lease.agent_id != agent {
                return Err(EngineError::StaleLease(format!(
                    "task {} is leased to {}",
                    task_id, lease.agent_id
                )));
            }
        }
        lease.status = LeaseStatus::Released;
        self.persistence
            .store_typed(collections::LEASES, task_id, &lease)
            .await?;
        Ok(lease)
    }

    /// Live leases whose expiry has passed.
    pub async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<Lease>> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .filter(|l| l.is_expired(now))
            .collect())
    }

    /// Mark a stalled lease recovered, recording the previous owner so a
    /// late completion from it can still be honored.
    pub async fn recover(&self, lease: &Lease) -> Result<RecoveredLease> {
        let mut recovered = lease.clone();
        recovered.previous_agent = Some(lease.agent_id.clone());
        recovered.status = LeaseStatus::Recovered;
        self.persistence
            .store_typed(collections::LEASES, &lease.task_id, &recovered)
            .await?;
        info!(
            task_id = %lease.task_id,
            previous_agent = %lease.agent_id,
            "stalled lease recovered"
        );
        Ok(RecoveredLease {
            task_id: lease.task_id.clone(),
            previous_agent: lease.agent_id.clone(),
            lease_id: lease.id.clone(),
        })
    }

    pub async fn all(&self) -> Result<Vec<Lease>> {
        Ok(self
            .persistence
            .query_typed(collections::LEASES, 0, usize::MAX)
            .await?)
    }

    /// Number of live leases currently held by `agent_id`.
    pub async fn live_count_for(&self, agent_id: &str) -> Result<usize> {
        Ok(self
            .all()
            .await?
            .iter()
            .filter(|l| l.status.is_live() && l.agent_id == agent_id)
            .count())
    }

    /// Live leases held by `agent_id`.
    pub async fn live_for(&self, agent_id: &str) -> Result<Vec<Lease>> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .filter(|l| l.status.is_live() && l.agent_id == agent_id)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use mc_core::FileStore;

    fn fast_config() -> LeaseConfig {
        LeaseConfig {
            initial_ttl_secs: 60,
            max_renewals: 2,
            hard_cap_secs: 150,
            tick_secs: 1,
        }
    }

    async fn manager() -> (LeaseManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Persistence> = Arc::new(FileStore::new(dir.path()));
        (LeaseManager::new(store, fast_config()), dir)
    }

    #[tokio::test]
    async fn issue_then_get() {
        let (mgr, _dir) = manager().await;
        let lease = mgr.issue("t1", "a1").await.unwrap();
        assert_eq!(lease.status, LeaseStatus::Active);
        assert_eq!(lease.renewals, 0);

        let loaded = mgr.get("t1").await.unwrap().unwrap();
        assert_eq!(loaded.id, lease.id);
    }

    #[tokio::test]
    async fn at_most_one_live_lease_per_task() {
        let (mgr, _dir) = manager().await;
        mgr.issue("t1", "a1").await.unwrap();
        let err = mgr.issue("t1", "a2").await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn released_lease_can_be_reissued() {
        let (mgr, _dir) = manager().await;
        mgr.issue("t1", "a1").await.unwrap();
        mgr.release("t1", Some("a1")).await.unwrap();
        let lease = mgr.issue("t1", "a2").await.unwrap();
        assert_eq!(lease.agent_id, "a2");
    }

    #[tokio::test]
    async fn renewal_extends_and_counts() {
        let (mgr, _dir) = manager().await;
        let issued = mgr.issue("t1", "a1").await.unwrap();
        let renewed = mgr.renew("t1", "a1").await.unwrap();
        assert_eq!(renewed.renewals, 1);
        assert_eq!(renewed.status, LeaseStatus::Renewed);
        assert!(renewed.expires_at >= issued.expires_at);
    }

    #[tokio::test]
    async fn renewal_respects_hard_cap_and_budget() {
        let (mgr, _dir) = manager().await;
        let issued = mgr.issue("t1", "a1").await.unwrap();
        let hard_cap = issued.issued_at + chrono::Duration::seconds(150);

        let r1 = mgr.renew("t1", "a1").await.unwrap();
        assert!(r1.expires_at <= hard_cap);
        let r2 = mgr.renew("t1", "a1").await.unwrap();
        assert_eq!(r2.renewals, 2);

        // Budget exhausted: heartbeat is recorded but expiry stops moving.
        let r3 = mgr.renew("t1", "a1").await.unwrap();
        assert_eq!(r3.renewals, 2);
        assert_eq!(r3.expires_at, r2.expires_at);
    }

    #[tokio::test]
    async fn renewal_by_wrong_agent_is_stale() {
        let (mgr, _dir) = manager().await;
        mgr.issue("t1", "a1").await.unwrap();
        let err = mgr.renew("t1", "a2").await.unwrap_err();
        assert!(matches!(err, EngineError::StaleLease(_)));
    }

    #[tokio::test]
    async fn expiry_and_recovery() {
        let (mgr, _dir) = manager().await;
        let lease = mgr.issue("t1", "a1").await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(120);
        let expired = mgr.expired(later).await.unwrap();
        assert_eq!(expired.len(), 1);

        let recovered = mgr.recover(&lease).await.unwrap();
        assert_eq!(recovered.previous_agent, "a1");

        let stored = mgr.get("t1").await.unwrap().unwrap();
        assert_eq!(stored.status, LeaseStatus::Recovered);
        assert_eq!(stored.previous_agent.as_deref(), Some("a1"));

        // Recovered leases are not live, so they no longer expire.
        assert!(mgr.expired(later).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rollback_deletes_only_matching_lease() {
        let (mgr, _dir) = manager().await;
        let lease = mgr.issue("t1", "a1").await.unwrap();
        mgr.rollback("t1", "some-other-id").await.unwrap();
        assert!(mgr.get("t1").await.unwrap().is_some());

        mgr.rollback("t1", &lease.id).await.unwrap();
        assert!(mgr.get("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn live_count_per_agent() {
        let (mgr, _dir) = manager().await;
        mgr.issue("t1", "a1").await.unwrap();
        mgr.issue("t2", "a1").await.unwrap();
        mgr.issue("t3", "a2").await.unwrap();
        mgr.release("t2", Some("a1")).await.unwrap();

        assert_eq!(mgr.live_count_for("a1").await.unwrap(), 1);
        assert_eq!(mgr.live_count_for("a2").await.unwrap(), 1);
        assert_eq!(mgr.live_for("a1").await.unwrap()[0].task_id, "t1");
    }
}
