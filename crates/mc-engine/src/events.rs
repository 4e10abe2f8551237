//! Event types the engine publishes. Names are part of the observable
//! surface; subscribers and tests match on them.

pub const AGENT_REGISTERED: &str = "agent.registered";
pub const AGENT_UNREGISTERED: &str = "agent.unregistered";

pub const TASK_ASSIGNED: &str = "task.assigned";
pub const TASK_PROGRESS: &str = "task.progress";
pub const TASK_COMPLETED: &str = "task.completed";
pub const TASK_BLOCKED: &str = "task.blocked";

pub const BLOCKER_REPORTED: &str = "blocker.reported";

pub const LEASE_ISSUED: &str = "lease.issued";
pub const LEASE_RENEWED: &str = "lease.renewed";
pub const LEASE_RECOVERED: &str = "lease.recovered";
pub const LEASE_RELEASED: &str = "lease.released";

pub const GRIDLOCK_DETECTED: &str = "gridlock.detected";

pub const PROJECT_CREATED: &str = "project.created";
pub const PROJECT_SELECTED: &str = "project.selected";
pub const PROJECT_DELETED: &str = "project.deleted";
pub const PROJECT_SYNCED: &str = "project.synced";

pub const DECISION_LOGGED: &str = "decision.logged";
pub const ARTIFACT_LOGGED: &str = "artifact.logged";

pub const TASK_DECOMPOSED: &str = "task.decomposed";
