use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use mc_core::config::Config;
use mc_engine::CoordinationEngine;
use tracing::{error, info, warn};

use crate::api::api_router;
use crate::shutdown::ShutdownSignal;
use crate::tools::ToolRouter;

/// Configuration for daemon loop intervals.
#[derive(Debug, Clone)]
pub struct DaemonIntervals {
    /// Lease monitor cadence.
    pub lease_tick_secs: u64,
    /// Board sync cadence.
    pub sync_secs: u64,
    /// Idle-agent patrol cadence.
    pub agent_patrol_secs: u64,
}

impl Default for DaemonIntervals {
    fn default() -> Self {
        Self {
            lease_tick_secs: 30,
            sync_secs: 300,
            agent_patrol_secs: 60,
        }
    }
}

/// The Marcus background daemon: serves the tool surface over HTTP and
/// runs the lease monitor, board sync, and idle-agent patrol loops on
/// configurable intervals. Shuts down cooperatively on signal.
pub struct Daemon {
    config: Config,
    engine: Arc<CoordinationEngine>,
    intervals: DaemonIntervals,
    shutdown: ShutdownSignal,
}

impl Daemon {
    pub fn new(config: Config, engine: Arc<CoordinationEngine>) -> Self {
        let intervals = DaemonIntervals {
            lease_tick_secs: config.lease.tick_secs,
            sync_secs: config.sync.interval_secs,
            ..DaemonIntervals::default()
        };
        Self {
            config,
            engine,
            intervals,
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn set_intervals(&mut self, intervals: DaemonIntervals) {
        self.intervals = intervals;
    }

    /// Handle for triggering shutdown from another task (signal handler,
    /// tests).
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn engine(&self) -> &Arc<CoordinationEngine> {
        &self.engine
    }

    /// Run the daemon until shutdown (blocking).
    pub async fn run(&self) -> Result<()> {
        let bind_addr = format!("{}:{}", self.config.daemon.host, self.config.daemon.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("binding {}", bind_addr))?;
        self.run_with_listener(listener).await
    }

    /// Run with a pre-bound listener; port 0 gives dynamic allocation.
    pub async fn run_with_listener(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let bind_addr = listener.local_addr()?;
        let router = api_router(ToolRouter::new(self.engine.clone()));
        let api_handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!(error = %e, "API server error");
            }
        });
        info!(%bind_addr, "tool surface listening");

        self.run_loops().await;

        api_handle.abort();
        info!("daemon stopped");
        Ok(())
    }

    /// The background loop shared by tests and `run`: lease recovery,
    /// board sync (always with `preserve_active = true`), and idle-agent
    /// patrol.
    pub async fn run_loops(&self) {
        let mut lease_interval =
            tokio::time::interval(Duration::from_secs(self.intervals.lease_tick_secs.max(1)));
        let mut sync_interval =
            tokio::time::interval(Duration::from_secs(self.intervals.sync_secs.max(1)));
        let mut patrol_interval =
            tokio::time::interval(Duration::from_secs(self.intervals.agent_patrol_secs.max(1)));

        // Consume the first immediate tick so loops don't all fire at t=0.
        lease_interval.tick().await;
        sync_interval.tick().await;
        patrol_interval.tick().await;

        let mut shutdown_rx = self.shutdown.subscribe();

        info!(
            lease_tick_secs = self.intervals.lease_tick_secs,
            sync_secs = self.intervals.sync_secs,
            agent_patrol_secs = self.intervals.agent_patrol_secs,
            "daemon loops starting"
        );

        loop {
            tokio::select! {
                _ = lease_interval.tick() => {
                    match self.engine.run_lease_tick(Utc::now()).await {
                        Ok(0) => {}
                        Ok(recovered) => info!(recovered, "stalled leases recovered"),
                        Err(e) => error!(error = %e, "lease tick failed"),
                    }
                }
                _ = sync_interval.tick() => {
                    match self.engine.discover_projects(true, true).await {
                        Ok((_, report)) => {
                            if report.projects_added + report.tasks_added + report.tasks_updated > 0 {
                                info!(
                                    projects_added = report.projects_added,
                                    tasks_added = report.tasks_added,
                                    tasks_updated = report.tasks_updated,
                                    "board sync completed"
                                );
                            }
                        }
                        Err(e) => warn!(error = %e, "board sync failed"),
                    }
                }
                _ = patrol_interval.tick() => {
                    match self.engine.run_agent_idle_tick(Utc::now()).await {
                        Ok(0) => {}
                        Ok(dropped) => warn!(dropped, "idle agents disconnected"),
                        Err(e) => error!(error = %e, "agent patrol failed"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received, stopping background loops");
                    break;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
