use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Done,
    Blocked,
}

impl TaskStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Todo, TaskStatus::InProgress)
                | (TaskStatus::Todo, TaskStatus::Blocked)
                | (TaskStatus::InProgress, TaskStatus::Done)
                | (TaskStatus::InProgress, TaskStatus::Blocked)
                | (TaskStatus::InProgress, TaskStatus::Todo)
                | (TaskStatus::Blocked, TaskStatus::Todo)
                | (TaskStatus::Blocked, TaskStatus::InProgress)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done)
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    /// Numeric rank used by the scheduler's scoring pass (higher wins).
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
            Priority::Urgent => 3,
        }
    }

    /// One step up, saturating at `Urgent`.
    pub fn escalated(&self) -> Priority {
        match self {
            Priority::Low => Priority::Medium,
            Priority::Medium => Priority::High,
            Priority::High => Priority::Urgent,
            Priority::Urgent => Priority::Urgent,
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Name that marks a task as the project's final milestone, in addition to
/// the `final` label.
pub const FINAL_TASK_NAME: &str = "PROJECT_SUCCESS";
pub const FINAL_LABEL: &str = "final";
pub const DESTRUCTIVE_LABEL: &str = "destructive";
pub const NEEDS_REVIEW_LABEL: &str = "needs-review";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub labels: BTreeSet<String>,
    /// Ordered, duplicate-free list of task ids this task depends on.
    pub dependencies: Vec<String>,
    pub estimated_hours: f64,
    pub actual_hours: f64,
    pub assigned_to: Option<String>,
    pub project_id: String,
    /// Times the task's lease has been recovered from a stall.
    #[serde(default)]
    pub stall_count: u32,
    /// Set once when the third stall escalates priority.
    #[serde(default)]
    pub priority_escalated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(name: impl Into<String>, project_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            status: TaskStatus::Todo,
            priority: Priority::Medium,
            labels: BTreeSet::new(),
            dependencies: Vec::new(),
            estimated_hours: 0.0,
            actual_hours: 0.0,
            assigned_to: None,
            project_id: project_id.into(),
            stall_count: 0,
            priority_escalated: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains(label)
    }

    /// A final task is named `PROJECT_SUCCESS` or carries the `final` label.
    pub fn is_final(&self) -> bool {
        self.name == FINAL_TASK_NAME || self.has_label(FINAL_LABEL)
    }

    /// Append a dependency, preserving order and uniqueness.
    pub fn add_dependency(&mut self, dep: impl Into<String>) {
        let dep = dep.into();
        if !self.dependencies.contains(&dep) {
            self.dependencies.push(dep);
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Subtask
// ---------------------------------------------------------------------------

/// Order value reserved for the auto-generated integration subtask. It is
/// always the highest order within a decomposition.
pub const INTEGRATION_ORDER: u32 = 99;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub parent_task_id: String,
    pub name: String,
    pub description: String,
    pub status: TaskStatus,
    pub order: u32,
    /// What this subtask makes available to its siblings.
    pub provides: String,
    /// What this subtask expects from earlier siblings.
    pub requires: String,
    pub file_artifacts: Vec<String>,
    /// Sibling subtask ids this subtask depends on.
    pub dependencies: Vec<String>,
    pub estimated_hours: f64,
    pub assigned_to: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subtask {
    pub fn new(parent_task_id: impl Into<String>, name: impl Into<String>, order: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            parent_task_id: parent_task_id.into(),
            name: name.into(),
            description: String::new(),
            status: TaskStatus::Todo,
            order,
            provides: String::new(),
            requires: String::new(),
            file_artifacts: Vec::new(),
            dependencies: Vec::new(),
            estimated_hours: 0.0,
            assigned_to: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_integration(&self) -> bool {
        self.order == INTEGRATION_ORDER
    }
}

// ---------------------------------------------------------------------------
// SharedConventions
// ---------------------------------------------------------------------------

/// Conventions extracted at decomposition time and visible to every subtask
/// of the same parent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedConventions {
    #[serde(default)]
    pub base_path: Option<String>,
    #[serde(default)]
    pub response_format: Option<String>,
    #[serde(default)]
    pub naming_convention: Option<String>,
}

impl SharedConventions {
    pub fn is_empty(&self) -> bool {
        self.base_path.is_none() && self.response_format.is_none() && self.naming_convention.is_none()
    }
}

// ---------------------------------------------------------------------------
// Decision / Artifact — immutable once stored
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub task_id: String,
    pub agent_id: String,
    pub summary: String,
    pub rationale: String,
    pub alternatives_considered: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl Decision {
    pub fn new(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            summary: summary.into(),
            rationale: String::new(),
            alternatives_considered: Vec::new(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub task_id: String,
    pub agent_id: String,
    pub path: String,
    pub kind: String,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
}

impl Artifact {
    pub fn new(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        path: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            path: path.into(),
            kind: kind.into(),
            summary: String::new(),
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkerStatus — agent profile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub agent_id: String,
    pub role: String,
    pub skills: BTreeSet<String>,
    /// Maximum number of concurrently held leases.
    pub capacity: u32,
    pub current_lease_ids: Vec<String>,
    pub success_rate: f64,
    pub avg_duration_factor: f64,
    pub last_seen: DateTime<Utc>,
}

impl WorkerStatus {
    pub fn new(agent_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            role: role.into(),
            skills: BTreeSet::new(),
            capacity: 1,
            current_lease_ids: Vec::new(),
            success_rate: 0.0,
            avg_duration_factor: 1.0,
            last_seen: Utc::now(),
        }
    }

    pub fn has_skill(&self, skill: &str) -> bool {
        self.skills.contains(skill)
    }

    pub fn at_capacity(&self) -> bool {
        self.current_lease_ids.len() as u32 >= self.capacity
    }
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    Active,
    Renewed,
    Recovered,
    Released,
}

impl LeaseStatus {
    /// Live leases hold ownership of their task.
    pub fn is_live(&self) -> bool {
        matches!(self, LeaseStatus::Active | LeaseStatus::Renewed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub id: String,
    pub task_id: String,
    pub agent_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub renewals: u32,
    pub last_heartbeat: DateTime<Utc>,
    pub status: LeaseStatus,
    /// The agent that held the lease before recovery. Only set on
    /// `Recovered` leases; a late completion is accepted only from it.
    #[serde(default)]
    pub previous_agent: Option<String>,
}

impl Lease {
    pub fn new(task_id: impl Into<String>, agent_id: impl Into<String>, ttl_secs: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            issued_at: now,
            expires_at: now + chrono::Duration::seconds(ttl_secs),
            renewals: 0,
            last_heartbeat: now,
            status: LeaseStatus::Active,
            previous_agent: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status.is_live() && now > self.expires_at
    }
}

// ---------------------------------------------------------------------------
// ProjectConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub id: String,
    pub name: String,
    /// Backend identifier: `planka`, `linear`, `github`, `memory`, ...
    pub provider: String,
    pub provider_config: serde_json::Value,
    pub last_used: DateTime<Utc>,
    pub tags: Vec<String>,
}

impl ProjectConfig {
    pub fn new(name: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            provider: provider.into(),
            provider_config: serde_json::Value::Null,
            last_used: Utc::now(),
            tags: Vec::new(),
        }
    }
}

/// Payload persisted under the distinguished `projects/active_project` key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveProjectPointer {
    pub project_id: String,
}

// ---------------------------------------------------------------------------
// Outcome — append-only learning record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub agent_id: String,
    pub task_id: String,
    pub success: bool,
    pub actual_hours: f64,
    pub blocker_kinds: Vec<String>,
    /// Labels of the task at completion time, kept for overlap filtering.
    #[serde(default)]
    pub labels: BTreeSet<String>,
    pub completed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub source: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            source: source.into(),
            data,
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// TaskContext — materialized view, never persisted
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencySummary {
    pub task_id: String,
    pub name: String,
    pub status: TaskStatus,
    /// One-line summary of the dependency.
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependentSummary {
    pub task_id: String,
    pub name: String,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiblingSummary {
    pub subtask_id: String,
    pub name: String,
    pub provides: String,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    pub task: Task,
    pub dependencies_with_status: Vec<DependencySummary>,
    pub dependent_tasks: Vec<DependentSummary>,
    pub related_decisions: Vec<Decision>,
    pub related_artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_conventions: Option<SharedConventions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sibling_subtasks: Option<Vec<SiblingSummary>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
