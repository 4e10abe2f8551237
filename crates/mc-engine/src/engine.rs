use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mc_bus::EventBus;
use mc_core::collections;
use mc_core::config::Config;
use mc_core::types::{
    Artifact, Decision, Event, Lease, LeaseStatus, Priority, ProjectConfig, Subtask, Task,
    TaskContext, TaskStatus, WorkerStatus, NEEDS_REVIEW_LABEL,
};
use mc_core::{Persistence, PersistenceExt};
use mc_intelligence::{instructions, Decomposer, HybridInferer, OutcomeLearner, Prediction};
use mc_providers::{AIProvider, KanbanProvider, NewTask, RetryPolicy, TaskPatch};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::agents::WorkerRegistry;
use crate::context::ContextBuilder;
use crate::events;
use crate::gridlock::GridlockDetector;
use crate::leases::LeaseManager;
use crate::registry::ProjectRegistry;
use crate::scheduler::{self, Candidate};
use crate::subtasks::SubtaskManager;
use crate::sync::{SyncController, SyncReport};
use crate::{EngineError, Result};

// ---------------------------------------------------------------------------
// Public result types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum PulledWork {
    Task { task: Task },
    Subtask { subtask: Subtask, parent: Task },
}

impl PulledWork {
    pub fn work_id(&self) -> &str {
        match self {
            PulledWork::Task { task } => &task.id,
            PulledWork::Subtask { subtask, .. } => &subtask.id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub work: PulledWork,
    pub lease: Lease,
    pub context: TaskContext,
    pub instructions: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoTaskReason {
    AtCapacity,
    NoCandidates,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum PullOutcome {
    Assigned(Box<Assignment>),
    NoTask { reason: NoTaskReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    InProgress,
    Completed,
    Blocked,
}

/// Task sketch accepted by `create_project`; dependencies reference sibling
/// drafts by name and are resolved to ids during creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskDraft {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub estimated_hours: f64,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProjectOutcome {
    pub project_id: String,
    pub success: bool,
    pub active: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub active_project: Option<String>,
    pub projects: usize,
    pub workers: usize,
    pub tasks_todo: usize,
    pub tasks_in_progress: usize,
    pub tasks_done: usize,
    pub tasks_blocked: usize,
    pub live_leases: usize,
    pub refusals_in_window: usize,
    pub last_gridlock_alert: Option<DateTime<Utc>>,
    pub event_log_degraded: bool,
    pub uptime_secs: i64,
}

// ---------------------------------------------------------------------------
// PostLockEffects
// ---------------------------------------------------------------------------

/// Work queued while the project mutex is held and dispatched only after
/// it is released: event publications (in emission order) and idempotent
/// board replays. The mutex itself covers nothing beyond in-memory work
/// and the engine's own persistence writes.
#[derive(Default)]
struct PostLockEffects {
    events: Vec<(Event, bool)>,
    board: Vec<(String, TaskPatch)>,
}

impl PostLockEffects {
    fn event(&mut self, event: Event, wait_for_handlers: bool) {
        self.events.push((event, wait_for_handlers));
    }

    fn board(&mut self, task_id: &str, patch: TaskPatch) {
        self.board.push((task_id.to_string(), patch));
    }
}

// ---------------------------------------------------------------------------
// CoordinationEngine
// ---------------------------------------------------------------------------

/// The coordination engine behind the tool surface.
///
/// Three distinguished singletons (event bus, persistence, project
/// registry) are passed explicitly through construction; there is no
/// ambient state. State mutation is serialized per project by a mutex from
/// `project_locks`; the lock is held only across in-memory work and the
/// lease/status write pair, never across provider or AI calls.
pub struct CoordinationEngine {
    config: Config,
    persistence: Arc<dyn Persistence>,
    bus: EventBus,
    registry: Arc<ProjectRegistry>,
    workers: WorkerRegistry,
    leases: Arc<LeaseManager>,
    subtasks: SubtaskManager,
    context: ContextBuilder,
    gridlock: GridlockDetector,
    learner: Mutex<OutcomeLearner>,
    inferer: HybridInferer,
    decomposer: Decomposer,
    board: Arc<dyn KanbanProvider>,
    ai: Arc<dyn AIProvider>,
    sync: SyncController,
    project_locks: DashMap<String, Arc<Mutex<()>>>,
    started_at: DateTime<Utc>,
}

impl CoordinationEngine {
    pub async fn new(
        config: Config,
        persistence: Arc<dyn Persistence>,
        board: Arc<dyn KanbanProvider>,
        ai: Arc<dyn AIProvider>,
    ) -> Result<Arc<Self>> {
        let bus = if config.features.events.enabled && config.features.events.options.persistence {
            EventBus::with_persistence(config.features.events.options.history_limit, persistence.clone())
        } else {
            EventBus::with_limit(config.features.events.options.history_limit)
        };

        let registry = Arc::new(ProjectRegistry::load(persistence.clone()).await?);
        let leases = Arc::new(LeaseManager::new(persistence.clone(), config.lease.clone()));

        let outcomes = persistence
            .query_typed(collections::OUTCOMES, 0, usize::MAX)
            .await?;
        let learner = OutcomeLearner::from_outcomes(config.features.memory.options.clone(), outcomes);

        let retry = RetryPolicy::new(
            Duration::from_millis(config.sync.retry_initial_ms),
            Duration::from_millis(config.sync.retry_max_ms),
            config.sync.retry_attempts,
        );
        let sync = SyncController::new(
            persistence.clone(),
            registry.clone(),
            leases.clone(),
            board.clone(),
            bus.clone(),
            retry,
            Duration::from_millis(config.timeouts.board_ms),
        );

        let inferer = HybridInferer::new(
            ai.clone(),
            config.inference.clone(),
            Duration::from_millis(config.timeouts.ai_infer_ms),
        );
        let decomposer = Decomposer::new(
            ai.clone(),
            config.features.decomposition.options.clone(),
            Duration::from_millis(config.timeouts.ai_decompose_ms),
        );

        Ok(Arc::new(Self {
            workers: WorkerRegistry::new(
                Duration::from_secs(config.agents.idle_ttl_secs),
                config.agents.default_capacity,
            ),
            subtasks: SubtaskManager::new(persistence.clone()),
            context: ContextBuilder::new(
                persistence.clone(),
                config.features.context.options.max_depth,
            ),
            gridlock: GridlockDetector::new(config.gridlock.clone()),
            learner: Mutex::new(learner),
            inferer,
            decomposer,
            sync,
            bus,
            registry,
            leases,
            board,
            ai,
            persistence,
            config,
            project_locks: DashMap::new(),
            started_at: Utc::now(),
        }))
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<ProjectRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn project_lock(&self, project_id: &str) -> Arc<Mutex<()>> {
        self.project_locks
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // -----------------------------------------------------------------------
    // Agent lifecycle
    // -----------------------------------------------------------------------

    pub async fn register_agent(
        &self,
        agent_id: &str,
        role: &str,
        skills: BTreeSet<String>,
        capacity: Option<u32>,
    ) -> Result<WorkerStatus> {
        let worker = self.workers.register(agent_id, role, skills, capacity).await?;
        self.bus
            .publish(
                Event::new(
                    events::AGENT_REGISTERED,
                    "engine",
                    json!({ "agent_id": agent_id, "role": role }),
                ),
                false,
            )
            .await;
        Ok(worker)
    }

    /// Explicit disconnect: every live lease the agent holds is released
    /// immediately and its work returns to the pool.
    pub async fn unregister_agent(&self, agent_id: &str) -> Result<()> {
        let worker = self.workers.unregister(agent_id).await?;
        for lease in self.leases.live_for(agent_id).await? {
            self.leases.release(&lease.task_id, None).await?;
            self.reset_work_to_todo(&lease.task_id).await?;
            self.bus
                .publish(
                    Event::new(
                        events::LEASE_RELEASED,
                        "engine",
                        json!({ "task_id": lease.task_id, "agent_id": agent_id, "cause": "disconnect" }),
                    ),
                    true,
                )
                .await;
        }
        info!(agent_id, leases = worker.current_lease_ids.len(), "agent disconnected");
        self.bus
            .publish(
                Event::new(events::AGENT_UNREGISTERED, "engine", json!({ "agent_id": agent_id })),
                false,
            )
            .await;
        Ok(())
    }

    /// Explicit heartbeat RPC: refreshes the worker and renews its leases.
    pub async fn heartbeat(&self, agent_id: &str) -> Result<()> {
        self.workers.heartbeat(agent_id).await?;
        for lease in self.leases.live_for(agent_id).await? {
            let renewed = self.leases.renew(&lease.task_id, agent_id).await?;
            self.bus
                .publish(
                    Event::new(
                        events::LEASE_RENEWED,
                        "engine",
                        json!({
                            "task_id": renewed.task_id,
                            "agent_id": agent_id,
                            "renewals": renewed.renewals,
                            "expires_at": renewed.expires_at,
                        }),
                    ),
                    false,
                )
                .await;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // The pull: request_next_task
    // -----------------------------------------------------------------------

    pub async fn request_next_task(&self, agent_id: &str) -> Result<PullOutcome> {
        let worker = self.workers.get(agent_id).await?;
        self.workers.heartbeat(agent_id).await?;

        // Capacity is checked against live leases, not the worker's own
        // bookkeeping: the lease record is the authority.
        if self.leases.live_count_for(agent_id).await? >= worker.capacity as usize {
            return Ok(PullOutcome::NoTask {
                reason: NoTaskReason::AtCapacity,
            });
        }

        let project = self
            .registry
            .active_project()
            .await
            .ok_or(EngineError::NoActiveProject)?;

        // Decomposition runs before the critical section; it is AI-bound
        // I/O and must not hold the project mutex.
        if self.config.features.decomposition.enabled {
            self.decompose_eligible(&project.id).await?;
        }

        let lock = self.project_lock(&project.id);
        let guard = lock.lock().await;

        let tasks = self.project_tasks(&project.id).await?;
        let (subtask_pairs, decomposed) = self.open_subtask_pairs(&tasks).await?;

        let learner = self.learner.lock().await;
        let memory_enabled = self.config.features.memory.enabled;
        let predict = |task: &Task| -> Prediction {
            if memory_enabled {
                learner.predict(agent_id, task)
            } else {
                Prediction {
                    success_probability: 0.7,
                    estimated_hours: task.estimated_hours,
                    confidence: 0.0,
                }
            }
        };

        let candidate = scheduler::select(
            &tasks,
            &subtask_pairs,
            &decomposed,
            &worker,
            &self.config.scheduler,
            None,
            predict,
            Utc::now(),
        );
        drop(learner);

        let Some(candidate) = candidate else {
            drop(guard);
            return self.refuse_pull(agent_id, &tasks).await;
        };

        // Lease first, durable, then the status flip; a failure after the
        // lease write rolls the lease back so no partial assignment leaks.
        // The mutex covers only this sequenced write pair.
        let work_id = candidate.work_id().to_string();
        let lease = self.leases.issue(&work_id, agent_id).await?;
        if let Err(e) = self.mark_in_progress(&candidate, agent_id).await {
            self.leases.rollback(&work_id, &lease.id).await?;
            return Err(e);
        }
        self.workers.record_lease(agent_id, &lease.id).await?;
        drop(guard);

        self.bus
            .publish(
                Event::new(
                    events::LEASE_ISSUED,
                    "engine",
                    json!({
                        "task_id": work_id,
                        "agent_id": agent_id,
                        "lease_id": lease.id,
                        "expires_at": lease.expires_at,
                    }),
                ),
                true,
            )
            .await;
        self.bus
            .publish(
                Event::new(
                    events::TASK_ASSIGNED,
                    "engine",
                    json!({ "task_id": work_id, "agent_id": agent_id }),
                ),
                true,
            )
            .await;

        // Enrichment and the idempotent board replay also happen outside
        // the critical section.
        let assignment = self
            .build_assignment(candidate, lease, &tasks, &worker)
            .await?;
        self.replay_board_update(
            assignment.work.work_id(),
            TaskPatch {
                status: Some(TaskStatus::InProgress),
                assigned_to: Some(Some(agent_id.to_string())),
                ..Default::default()
            },
        )
        .await;

        Ok(PullOutcome::Assigned(Box::new(assignment)))
    }

    async fn refuse_pull(&self, agent_id: &str, tasks: &[Task]) -> Result<PullOutcome> {
        let now = Utc::now();
        self.gridlock.record_refusal(agent_id, now).await;
        if let Some(diagnosis) = self.gridlock.check(tasks, now).await {
            self.bus
                .publish(
                    Event::new(
                        events::GRIDLOCK_DETECTED,
                        "gridlock_detector",
                        serde_json::to_value(&diagnosis).unwrap_or_default(),
                    ),
                    true,
                )
                .await;
        }
        Ok(PullOutcome::NoTask {
            reason: NoTaskReason::NoCandidates,
        })
    }

    /// Decompose every eligible todo task that has no decomposition yet.
    async fn decompose_eligible(&self, project_id: &str) -> Result<()> {
        let tasks = self.project_tasks(project_id).await?;
        let all_names: Vec<String> = tasks.iter().map(|t| t.name.clone()).collect();
        let project_labels: Vec<String> = tasks
            .iter()
            .flat_map(|t| t.labels.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        for task in tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Todo && self.decomposer.should_decompose(t))
        {
            if self.subtasks.has_decomposition(&task.id).await? {
                continue;
            }
            match self
                .decomposer
                .decompose(task, project_labels.clone(), all_names.clone())
                .await
            {
                Ok(set) => {
                    self.subtasks.store_decomposition(&set).await?;
                    self.bus
                        .publish(
                            Event::new(
                                events::TASK_DECOMPOSED,
                                "engine",
                                json!({
                                    "task_id": task.id,
                                    "subtasks": set.subtasks.len(),
                                }),
                            ),
                            true,
                        )
                        .await;
                }
                Err(e) => {
                    // The task stays assignable whole; decomposition is an
                    // optimization, not a gate.
                    warn!(task_id = %task.id, error = %e, "decomposition failed");
                }
            }
        }
        Ok(())
    }

    /// Subtask/parent pairs for every decomposed, undone parent, plus the
    /// set of decomposed parent ids.
    async fn open_subtask_pairs(
        &self,
        tasks: &[Task],
    ) -> Result<(Vec<(Subtask, Task)>, HashSet<String>)> {
        let mut pairs = Vec::new();
        let mut decomposed = HashSet::new();
        for task in tasks.iter().filter(|t| t.status != TaskStatus::Done) {
            if !self.subtasks.has_decomposition(&task.id).await? {
                continue;
            }
            decomposed.insert(task.id.clone());
            for subtask in self.subtasks.subtasks_for(&task.id).await? {
                pairs.push((subtask, task.clone()));
            }
        }
        Ok((pairs, decomposed))
    }

    async fn mark_in_progress(&self, candidate: &Candidate, agent_id: &str) -> Result<()> {
        match candidate {
            Candidate::Task(task) => {
                let mut task = task.clone();
                task.status = TaskStatus::InProgress;
                task.assigned_to = Some(agent_id.to_string());
                task.touch();
                self.save_task(&task).await
            }
            Candidate::Subtask { subtask, .. } => {
                let mut subtask = subtask.clone();
                subtask.status = TaskStatus::InProgress;
                subtask.assigned_to = Some(agent_id.to_string());
                subtask.updated_at = Utc::now();
                self.subtasks.save(&subtask).await
            }
        }
    }

    async fn build_assignment(
        &self,
        candidate: Candidate,
        lease: Lease,
        tasks: &[Task],
        worker: &WorkerStatus,
    ) -> Result<Assignment> {
        let context_enabled = self.config.features.context.enabled;
        let (work, context) = match candidate {
            Candidate::Task(mut task) => {
                task.status = TaskStatus::InProgress;
                task.assigned_to = Some(worker.agent_id.clone());
                let context = if context_enabled {
                    self.context.build(&task, tasks).await?
                } else {
                    bare_context(&task)
                };
                (PulledWork::Task { task }, context)
            }
            Candidate::Subtask { mut subtask, parent } => {
                subtask.status = TaskStatus::InProgress;
                subtask.assigned_to = Some(worker.agent_id.clone());
                let context = if context_enabled {
                    let siblings = self.subtasks.subtasks_for(&parent.id).await?;
                    let conventions = self.subtasks.conventions_for(&parent.id).await?;
                    self.context
                        .build_for_subtask(&subtask, &parent, &siblings, conventions, tasks)
                        .await?
                } else {
                    bare_context(&parent)
                };
                (PulledWork::Subtask { subtask, parent }, context)
            }
        };

        let scoring_task = match &work {
            PulledWork::Task { task } => task.clone(),
            PulledWork::Subtask { parent, .. } => parent.clone(),
        };
        let instructions = instructions::generate(
            self.ai.as_ref(),
            &scoring_task,
            &context,
            worker,
            Duration::from_millis(self.config.timeouts.ai_decompose_ms),
        )
        .await;

        Ok(Assignment {
            work,
            lease,
            context,
            instructions,
        })
    }

    // -----------------------------------------------------------------------
    // Progress reporting
    // -----------------------------------------------------------------------

    pub async fn report_task_progress(
        &self,
        agent_id: &str,
        task_id: &str,
        status: ProgressStatus,
        progress: u8,
        message: &str,
    ) -> Result<()> {
        if progress > 100 {
            return Err(EngineError::InvalidInput("progress must be in [0, 100]".into()));
        }
        self.workers.heartbeat(agent_id).await?;

        let project_id = self.project_of_work(task_id).await?;
        let lock = self.project_lock(&project_id);
        let guard = lock.lock().await;

        let lease = self.authorize_report(agent_id, task_id, status).await?;

        let mut effects = PostLockEffects::default();
        match status {
            ProgressStatus::InProgress => {
                self.leases.renew(task_id, agent_id).await?;
                effects.event(
                    Event::new(
                        events::TASK_PROGRESS,
                        "engine",
                        json!({
                            "task_id": task_id,
                            "agent_id": agent_id,
                            "progress": progress,
                            "message": message,
                        }),
                    ),
                    false,
                );
            }
            ProgressStatus::Completed => {
                self.complete_work(agent_id, task_id, &lease, &mut effects)
                    .await?;
            }
            ProgressStatus::Blocked => {
                self.block_work(agent_id, task_id, message, &mut effects).await?;
            }
        }
        drop(guard);

        self.dispatch_effects(effects).await;
        Ok(())
    }

    pub async fn report_blocker(
        &self,
        agent_id: &str,
        task_id: &str,
        description: &str,
        severity: &str,
    ) -> Result<()> {
        self.workers.heartbeat(agent_id).await?;
        let project_id = self.project_of_work(task_id).await?;
        let lock = self.project_lock(&project_id);
        let guard = lock.lock().await;

        if let Some(lease) = self.leases.get(task_id).await? {
            if lease.status.is_live() && lease.agent_id != agent_id {
                return Err(EngineError::StaleLease(format!(
                    "task {} is leased to {}",
                    task_id, lease.agent_id
                )));
            }
        }

        let mut effects = PostLockEffects::default();
        self.block_work(agent_id, task_id, description, &mut effects).await?;
        self.record_outcome(agent_id, task_id, false, 0.0, vec![severity.to_string()])
            .await?;
        effects.event(
            Event::new(
                events::BLOCKER_REPORTED,
                "engine",
                json!({
                    "task_id": task_id,
                    "agent_id": agent_id,
                    "description": description,
                    "severity": severity,
                }),
            ),
            true,
        );
        drop(guard);

        self.dispatch_effects(effects).await;
        Ok(())
    }

    /// Dispatch effects queued under a project mutex: events first, in
    /// emission order, then the board replays.
    async fn dispatch_effects(&self, effects: PostLockEffects) {
        for (event, wait_for_handlers) in effects.events {
            self.bus.publish(event, wait_for_handlers).await;
        }
        for (task_id, patch) in effects.board {
            self.replay_board_update(&task_id, patch).await;
        }
    }

    /// Decide whether `agent_id` may report on `task_id`. Live leases must
    /// match the agent. A recovered lease honors a late completion from
    /// its previous owner only while the task has not yet been returned to
    /// the pool (the crash window between the lease flip and the task
    /// reset); once the task is todo again the report is stale.
    async fn authorize_report(
        &self,
        agent_id: &str,
        task_id: &str,
        status: ProgressStatus,
    ) -> Result<Lease> {
        let lease = self
            .leases
            .get(task_id)
            .await?
            .ok_or_else(|| EngineError::StaleLease(format!("no lease for task {}", task_id)))?;

        match lease.status {
            LeaseStatus::Active | LeaseStatus::Renewed => {
                if lease.agent_id != agent_id {
                    return Err(EngineError::StaleLease(format!(
                        "task {} is leased to {}",
                        task_id, lease.agent_id
                    )));
                }
                Ok(lease)
            }
            LeaseStatus::Recovered
                if status == ProgressStatus::Completed
                    && lease.previous_agent.as_deref() == Some(agent_id)
                    && self.work_status(task_id).await? == TaskStatus::InProgress =>
            {
                Ok(lease)
            }
            _ => Err(EngineError::StaleLease(format!(
                "lease for task {} is {:?}",
                task_id,
                lease.status
            ))),
        }
    }

    async fn work_status(&self, work_id: &str) -> Result<TaskStatus> {
        if let Some(subtask) = self.subtasks.get(work_id).await? {
            return Ok(subtask.status);
        }
        let task = self
            .load_task(work_id)
            .await?
            .ok_or_else(|| EngineError::UnknownTask(work_id.to_string()))?;
        Ok(task.status)
    }

    /// In-lock phase of a completion: release the lease, persist the
    /// status flips and the rollup, and queue events/board replays for
    /// dispatch after the project mutex is released.
    async fn complete_work(
        &self,
        agent_id: &str,
        task_id: &str,
        lease: &Lease,
        effects: &mut PostLockEffects,
    ) -> Result<()> {
        let elapsed_hours =
            (Utc::now() - lease.issued_at).num_milliseconds().max(0) as f64 / 3_600_000.0;
        self.leases.release(task_id, None).await?;
        self.workers.drop_lease(agent_id, &lease.id).await;

        if let Some(mut subtask) = self.subtasks.get(task_id).await? {
            subtask.status = TaskStatus::Done;
            subtask.updated_at = Utc::now();
            self.subtasks.save(&subtask).await?;

            let parent = self
                .load_task(&subtask.parent_task_id)
                .await?
                .ok_or_else(|| EngineError::UnknownTask(subtask.parent_task_id.clone()))?;
            self.record_outcome(
                agent_id,
                task_id,
                true,
                elapsed_hours,
                Vec::new(),
            )
            .await?;

            effects.event(
                Event::new(
                    events::TASK_COMPLETED,
                    "engine",
                    json!({ "task_id": task_id, "agent_id": agent_id, "subtask": true }),
                ),
                true,
            );

            // Durable subtask completion above, then the rollup check.
            let rollup = self.subtasks.rollup(task_id).await?;
            let mut parent = parent;
            parent.actual_hours += elapsed_hours;
            if rollup.parent_done {
                parent.status = TaskStatus::Done;
            }
            parent.touch();
            self.save_task(&parent).await?;

            if rollup.parent_done {
                // The parent's completion event follows the subtask's.
                effects.event(
                    Event::new(
                        events::TASK_COMPLETED,
                        "engine",
                        json!({ "task_id": parent.id, "completion_percent": rollup.completion_percent }),
                    ),
                    true,
                );
                effects.board(
                    &parent.id,
                    TaskPatch {
                        status: Some(TaskStatus::Done),
                        ..Default::default()
                    },
                );
            }
            return Ok(());
        }

        let mut task = self
            .load_task(task_id)
            .await?
            .ok_or_else(|| EngineError::UnknownTask(task_id.to_string()))?;
        task.status = TaskStatus::Done;
        task.actual_hours = task.actual_hours.max(elapsed_hours);
        task.touch();
        self.save_task(&task).await?;

        self.record_outcome(agent_id, task_id, true, elapsed_hours, Vec::new())
            .await?;

        effects.event(
            Event::new(
                events::TASK_COMPLETED,
                "engine",
                json!({ "task_id": task_id, "agent_id": agent_id }),
            ),
            true,
        );
        effects.board(
            task_id,
            TaskPatch {
                status: Some(TaskStatus::Done),
                ..Default::default()
            },
        );
        Ok(())
    }

    /// In-lock phase of a blocked report: release the reporting agent's
    /// lease, persist the blocked status, and queue the event/board
    /// replay for dispatch after the project mutex is released.
    async fn block_work(
        &self,
        agent_id: &str,
        task_id: &str,
        reason: &str,
        effects: &mut PostLockEffects,
    ) -> Result<()> {
        if let Some(lease) = self.leases.get(task_id).await? {
            if lease.status.is_live() && lease.agent_id == agent_id {
                self.leases.release(task_id, Some(agent_id)).await?;
                self.workers.drop_lease(agent_id, &lease.id).await;
            }
        }

        if let Some(mut subtask) = self.subtasks.get(task_id).await? {
            subtask.status = TaskStatus::Blocked;
            subtask.assigned_to = None;
            subtask.updated_at = Utc::now();
            self.subtasks.save(&subtask).await?;
        } else {
            let mut task = self
                .load_task(task_id)
                .await?
                .ok_or_else(|| EngineError::UnknownTask(task_id.to_string()))?;
            task.status = TaskStatus::Blocked;
            task.assigned_to = None;
            task.touch();
            self.save_task(&task).await?;
            effects.board(
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::Blocked),
                    assigned_to: Some(None),
                    ..Default::default()
                },
            );
        }

        effects.event(
            Event::new(
                events::TASK_BLOCKED,
                "engine",
                json!({ "task_id": task_id, "agent_id": agent_id, "reason": reason }),
            ),
            true,
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lease monitor
    // -----------------------------------------------------------------------

    /// One pass of the stall monitor: every expired live lease is
    /// recovered and its task returned to the pool. Runs on the daemon's
    /// `lease.tick` interval.
    pub async fn run_lease_tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired = self.leases.expired(now).await?;
        let mut recovered = 0usize;
        for lease in expired {
            let recovery = self.leases.recover(&lease).await?;
            self.workers.drop_lease(&recovery.previous_agent, &recovery.lease_id).await;
            self.reset_work_to_todo(&recovery.task_id).await?;

            if let Some(mut task) = self.load_task(&recovery.task_id).await? {
                task.stall_count += 1;
                if task.stall_count >= 3 {
                    task.labels.insert(NEEDS_REVIEW_LABEL.to_string());
                    if !task.priority_escalated {
                        task.priority = task.priority.escalated();
                        task.priority_escalated = true;
                    }
                    self.replay_board_update(
                        &task.id,
                        TaskPatch {
                            add_labels: vec![NEEDS_REVIEW_LABEL.to_string()],
                            ..Default::default()
                        },
                    )
                    .await;
                }
                self.save_task(&task).await?;
            }

            self.bus
                .publish(
                    Event::new(
                        events::LEASE_RECOVERED,
                        "lease_monitor",
                        json!({
                            "task_id": recovery.task_id,
                            "previous_agent": recovery.previous_agent,
                            "lease_id": recovery.lease_id,
                        }),
                    ),
                    true,
                )
                .await;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Invalidate agents silent past the idle TTL, releasing their leases.
    pub async fn run_agent_idle_tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let stale = self.workers.stale_agents(now).await;
        let count = stale.len();
        for worker in stale {
            warn!(agent_id = %worker.agent_id, "agent idle past TTL; disconnecting");
            self.unregister_agent(&worker.agent_id).await?;
        }
        Ok(count)
    }

    async fn reset_work_to_todo(&self, work_id: &str) -> Result<()> {
        if let Some(mut subtask) = self.subtasks.get(work_id).await? {
            subtask.status = TaskStatus::Todo;
            subtask.assigned_to = None;
            subtask.updated_at = Utc::now();
            self.subtasks.save(&subtask).await?;
            return Ok(());
        }
        if let Some(mut task) = self.load_task(work_id).await? {
            task.status = TaskStatus::Todo;
            task.assigned_to = None;
            task.touch();
            self.save_task(&task).await?;
            self.replay_board_update(
                work_id,
                TaskPatch {
                    status: Some(TaskStatus::Todo),
                    assigned_to: Some(None),
                    ..Default::default()
                },
            )
            .await;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Context, decisions, artifacts
    // -----------------------------------------------------------------------

    pub async fn get_task_context(&self, task_id: &str) -> Result<TaskContext> {
        if let Some(subtask) = self.subtasks.get(task_id).await? {
            let parent = self
                .load_task(&subtask.parent_task_id)
                .await?
                .ok_or_else(|| EngineError::UnknownTask(subtask.parent_task_id.clone()))?;
            let tasks = self.project_tasks(&parent.project_id).await?;
            let siblings = self.subtasks.subtasks_for(&parent.id).await?;
            let conventions = self.subtasks.conventions_for(&parent.id).await?;
            return self
                .context
                .build_for_subtask(&subtask, &parent, &siblings, conventions, &tasks)
                .await;
        }

        let task = self
            .load_task(task_id)
            .await?
            .ok_or_else(|| EngineError::UnknownTask(task_id.to_string()))?;
        let tasks = self.project_tasks(&task.project_id).await?;
        self.context.build(&task, &tasks).await
    }

    pub async fn log_decision(
        &self,
        task_id: &str,
        agent_id: &str,
        summary: &str,
        rationale: &str,
        alternatives: Vec<String>,
    ) -> Result<String> {
        self.ensure_work_exists(task_id).await?;
        let mut decision = Decision::new(task_id, agent_id, summary);
        decision.rationale = rationale.to_string();
        decision.alternatives_considered = alternatives;
        self.persistence
            .store_typed(collections::DECISIONS, &decision.id, &decision)
            .await?;
        self.bus
            .publish(
                Event::new(
                    events::DECISION_LOGGED,
                    "engine",
                    json!({ "decision_id": decision.id, "task_id": task_id, "agent_id": agent_id }),
                ),
                false,
            )
            .await;
        Ok(decision.id)
    }

    pub async fn log_artifact(
        &self,
        task_id: &str,
        agent_id: &str,
        path: &str,
        kind: &str,
        summary: &str,
    ) -> Result<String> {
        self.ensure_work_exists(task_id).await?;
        let mut artifact = Artifact::new(task_id, agent_id, path, kind);
        artifact.summary = summary.to_string();
        self.persistence
            .store_typed(collections::ARTIFACTS, &artifact.id, &artifact)
            .await?;
        self.bus
            .publish(
                Event::new(
                    events::ARTIFACT_LOGGED,
                    "engine",
                    json!({ "artifact_id": artifact.id, "task_id": task_id, "path": path }),
                ),
                false,
            )
            .await;
        Ok(artifact.id)
    }

    // -----------------------------------------------------------------------
    // Projects
    // -----------------------------------------------------------------------

    /// Create a project from task drafts. The graph is repaired by the
    /// validator before anything reaches the board; the response carries
    /// one warning per repair.
    pub async fn create_project(
        &self,
        name: &str,
        _description: &str,
        drafts: Vec<TaskDraft>,
    ) -> Result<CreateProjectOutcome> {
        if name.trim().is_empty() {
            return Err(EngineError::InvalidInput("project name must not be empty".into()));
        }

        let mut project = ProjectConfig::new(name, self.board.name());
        project.provider_config = json!({ "key": project.id });
        let project_id = project.id.clone();

        // Drafts name their dependencies; resolve to ids.
        let mut tasks: Vec<Task> = Vec::with_capacity(drafts.len());
        let mut name_to_id = std::collections::HashMap::new();
        for draft in &drafts {
            if draft.name.trim().is_empty() {
                return Err(EngineError::InvalidInput("task name must not be empty".into()));
            }
            let mut task = Task::new(&draft.name, &project_id);
            task.description = draft.description.clone();
            task.labels = draft.labels.iter().cloned().collect();
            if let Some(priority) = draft.priority {
                task.priority = priority;
            }
            task.estimated_hours = draft.estimated_hours;
            name_to_id.insert(draft.name.clone(), task.id.clone());
            tasks.push(task);
        }
        for (task, draft) in tasks.iter_mut().zip(&drafts) {
            for dep_name in &draft.depends_on {
                // Unresolvable names become orphan references the
                // validator reports and removes.
                let dep = name_to_id
                    .get(dep_name)
                    .cloned()
                    .unwrap_or_else(|| dep_name.clone());
                task.add_dependency(dep);
            }
        }

        // Drafts with no declared ordering at all get the hybrid inferer's
        // edges; explicit dependencies are taken as authored.
        if !tasks.is_empty() && drafts.iter().all(|d| d.depends_on.is_empty()) {
            for edge in self.inferer.infer(&tasks).await {
                if let Some(task) = tasks.iter_mut().find(|t| t.id == edge.from) {
                    task.add_dependency(edge.to);
                }
            }
        }

        let outcome = mc_graph::validate(tasks)?;
        let warnings = outcome.warnings.clone();
        let mut tasks = outcome.tasks;

        self.registry.add_project(project.clone()).await?;
        self.registry.select_project(&project_id).await?;

        // Push to the board; provider-assigned ids replace local ones so
        // later syncs line up. A board failure degrades to local-only.
        let mut id_map = std::collections::HashMap::new();
        for task in &mut tasks {
            let created = self
                .board
                .create_task(
                    project
                        .provider_config
                        .get("key")
                        .and_then(|v| v.as_str())
                        .unwrap_or(&project_id),
                    NewTask {
                        name: task.name.clone(),
                        description: task.description.clone(),
                        labels: task.labels.iter().cloned().collect(),
                        priority: Some(task.priority),
                    },
                )
                .await;
            match created {
                Ok(board_id) => {
                    id_map.insert(task.id.clone(), board_id.clone());
                    task.id = board_id;
                }
                Err(e) => {
                    warn!(error = %e, "board rejected task creation; keeping local ids");
                    break;
                }
            }
        }
        for task in &mut tasks {
            for dep in &mut task.dependencies {
                if let Some(mapped) = id_map.get(dep) {
                    *dep = mapped.clone();
                }
            }
        }

        for task in &tasks {
            self.save_task(task).await?;
        }

        self.bus
            .publish(
                Event::new(
                    events::PROJECT_CREATED,
                    "engine",
                    json!({
                        "project_id": project_id,
                        "name": name,
                        "tasks": tasks.len(),
                        "warnings": warnings,
                    }),
                ),
                true,
            )
            .await;

        Ok(CreateProjectOutcome {
            project_id,
            success: true,
            active: true,
            warnings,
        })
    }

    pub async fn select_project(&self, selector: &str) -> Result<ProjectConfig> {
        let project = if self.registry.get(selector).await.is_some() {
            self.registry.select_project(selector).await?
        } else {
            self.registry.select_by_name(selector).await?
        };
        self.bus
            .publish(
                Event::new(
                    events::PROJECT_SELECTED,
                    "engine",
                    json!({ "project_id": project.id, "name": project.name }),
                ),
                false,
            )
            .await;
        Ok(project)
    }

    /// Delete a project and everything it owns: tasks, subtasks,
    /// decisions, artifacts, outcomes, and leases.
    pub async fn delete_project(&self, project_id: &str) -> Result<()> {
        let tasks = self.project_tasks(project_id).await?;
        for task in &tasks {
            for subtask in self.subtasks.subtasks_for(&task.id).await? {
                self.persistence
                    .delete(collections::SUBTASKS, &subtask.id)
                    .await?;
                self.persistence
                    .delete(collections::LEASES, &subtask.id)
                    .await?;
            }
            self.persistence
                .delete(collections::SUBTASKS, &format!("parent_{}", task.id))
                .await?;
            self.persistence.delete(collections::LEASES, &task.id).await?;
            self.delete_related(collections::DECISIONS, &task.id).await?;
            self.delete_related(collections::ARTIFACTS, &task.id).await?;
            self.delete_related(collections::OUTCOMES, &task.id).await?;
            self.persistence.delete(collections::TASKS, &task.id).await?;
        }
        self.registry.delete_project(project_id).await?;
        self.bus
            .publish(
                Event::new(
                    events::PROJECT_DELETED,
                    "engine",
                    json!({ "project_id": project_id, "tasks": tasks.len() }),
                ),
                false,
            )
            .await;
        Ok(())
    }

    async fn delete_related(&self, collection: &str, task_id: &str) -> Result<()> {
        let matching = |value: &serde_json::Value| {
            value.get("task_id").and_then(|v| v.as_str()) == Some(task_id)
        };
        let rows = self
            .persistence
            .query(collection, Some(&matching), 0, usize::MAX)
            .await?;
        for (key, _) in rows {
            self.persistence.delete(collection, &key).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sync passthrough
    // -----------------------------------------------------------------------

    pub async fn discover_projects(
        &self,
        auto_sync: bool,
        preserve_active: bool,
    ) -> Result<(Vec<ProjectConfig>, SyncReport)> {
        self.sync.discover_projects(auto_sync, preserve_active).await
    }

    pub async fn refresh_tasks(&self, project_id: &str) -> Result<SyncReport> {
        self.sync.refresh_tasks(project_id).await
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    pub async fn diagnose(&self) -> Result<HealthSnapshot> {
        let active = self.registry.active_project_id().await;
        let tasks = match &active {
            Some(project_id) => self.project_tasks(project_id).await?,
            None => Vec::new(),
        };
        let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();
        let live_leases = self
            .leases
            .all()
            .await?
            .iter()
            .filter(|l| l.status.is_live())
            .count();

        Ok(HealthSnapshot {
            active_project: active,
            projects: self.registry.list().await.len(),
            workers: self.workers.count().await,
            tasks_todo: count(TaskStatus::Todo),
            tasks_in_progress: count(TaskStatus::InProgress),
            tasks_done: count(TaskStatus::Done),
            tasks_blocked: count(TaskStatus::Blocked),
            live_leases,
            refusals_in_window: self.gridlock.refusals_in_window(Utc::now()).await,
            last_gridlock_alert: self.gridlock.last_alert().await,
            event_log_degraded: self.bus.is_degraded(),
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
        })
    }

    pub async fn recent_events(&self, limit: usize) -> Vec<Event> {
        self.bus.recent_events(limit).await
    }

    // -----------------------------------------------------------------------
    // Shared helpers
    // -----------------------------------------------------------------------

    async fn record_outcome(
        &self,
        agent_id: &str,
        task_id: &str,
        success: bool,
        actual_hours: f64,
        blocker_kinds: Vec<String>,
    ) -> Result<()> {
        if !self.config.features.memory.enabled {
            return Ok(());
        }
        let labels = if let Some(subtask) = self.subtasks.get(task_id).await? {
            self.load_task(&subtask.parent_task_id)
                .await?
                .map(|t| t.labels)
                .unwrap_or_default()
        } else {
            self.load_task(task_id)
                .await?
                .map(|t| t.labels)
                .unwrap_or_default()
        };

        let outcome = mc_core::types::Outcome {
            agent_id: agent_id.to_string(),
            task_id: task_id.to_string(),
            success,
            actual_hours,
            blocker_kinds,
            labels,
            completed_at: Utc::now(),
        };
        let key = format!("{}:{}:{}", agent_id, task_id, outcome.completed_at.timestamp_millis());
        self.persistence
            .store_typed(collections::OUTCOMES, &key, &outcome)
            .await?;

        let mut learner = self.learner.lock().await;
        learner.record(outcome);
        let success_rate = learner.success_rate(agent_id).unwrap_or(0.0);
        let avg_hours = learner.avg_hours(agent_id).unwrap_or(0.0);
        drop(learner);
        self.workers
            .update_stats(agent_id, success_rate, avg_hours)
            .await;
        Ok(())
    }

    async fn project_of_work(&self, work_id: &str) -> Result<String> {
        if let Some(subtask) = self.subtasks.get(work_id).await? {
            let parent = self
                .load_task(&subtask.parent_task_id)
                .await?
                .ok_or_else(|| EngineError::UnknownTask(subtask.parent_task_id.clone()))?;
            return Ok(parent.project_id);
        }
        let task = self
            .load_task(work_id)
            .await?
            .ok_or_else(|| EngineError::UnknownTask(work_id.to_string()))?;
        Ok(task.project_id)
    }

    async fn ensure_work_exists(&self, work_id: &str) -> Result<()> {
        self.project_of_work(work_id).await.map(|_| ())
    }

    async fn load_task(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self
            .persistence
            .retrieve_typed(collections::TASKS, task_id)
            .await?)
    }

    async fn save_task(&self, task: &Task) -> Result<()> {
        self.persistence
            .store_typed(collections::TASKS, &task.id, task)
            .await?;
        Ok(())
    }

    pub async fn project_tasks(&self, project_id: &str) -> Result<Vec<Task>> {
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

    /// Idempotent board replay, keyed by task id; a failure is logged and
    /// retried on the next sync rather than failing the caller.
    async fn replay_board_update(&self, task_id: &str, patch: TaskPatch) {
        if let Err(e) = self.board.update_task(task_id, patch).await {
            warn!(task_id, error = %e, "board update failed; will reconcile on next sync");
        }
    }
}

fn bare_context(task: &Task) -> TaskContext {
    TaskContext {
        task: task.clone(),
        dependencies_with_status: Vec::new(),
        dependent_tasks: Vec::new(),
        related_decisions: Vec::new(),
        related_artifacts: Vec::new(),
        shared_conventions: None,
        sibling_subtasks: None,
    }
}
