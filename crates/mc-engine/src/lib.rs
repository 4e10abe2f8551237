//! The coordination engine: project registry, worker registry, lease
//! manager, scheduler, gridlock detector, subtask manager, context store,
//! and board sync controller, wired together by [`CoordinationEngine`].

pub mod agents;
pub mod context;
pub mod engine;
pub mod events;
pub mod gridlock;
pub mod leases;
pub mod registry;
pub mod scheduler;
pub mod subtasks;
pub mod sync;

pub use agents::WorkerRegistry;
pub use context::ContextBuilder;
pub use engine::{Assignment, CoordinationEngine, CreateProjectOutcome, PullOutcome, PulledWork};
pub use gridlock::{GridlockDetector, GridlockDiagnosis};
pub use leases::{LeaseManager, RecoveredLease};
pub use registry::ProjectRegistry;
pub use scheduler::Candidate;
pub use subtasks::{RollupResult, SubtaskManager};
pub use sync::{SyncController, SyncReport};

use mc_core::{ErrorKind, PersistError};
use mc_graph::GraphError;
use mc_intelligence::IntelligenceError;
use mc_providers::ProviderError;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    #[error("unknown task: {0}")]
    UnknownTask(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("ambiguous: {0}")]
    Ambiguous(String),
    #[error("agent already registered: {0}")]
    AlreadyRegistered(String),
    #[error("no active project")]
    NoActiveProject,
    #[error("stale lease: {0}")]
    StaleLease(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("board provider: {0}")]
    Board(ProviderError),
    #[error(transparent)]
    Intelligence(#[from] IntelligenceError),
    #[error("shutting down")]
    Shutdown,
}

impl EngineError {
    /// The stable wire kind for the tool-surface error envelope.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidInput(_) => ErrorKind::InvalidInput,
            EngineError::UnknownAgent(_) => ErrorKind::UnknownAgent,
            EngineError::UnknownTask(_) => ErrorKind::UnknownTask,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Ambiguous(_) => ErrorKind::Ambiguous,
            EngineError::AlreadyRegistered(_) => ErrorKind::AlreadyRegistered,
            EngineError::NoActiveProject => ErrorKind::NoActiveProject,
            EngineError::StaleLease(_) => ErrorKind::StaleLease,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::Persist(e) => e.kind(),
            EngineError::Graph(e) => e.kind(),
            EngineError::Board(e) => e.board_kind(),
            EngineError::Intelligence(e) => e.kind(),
            EngineError::Shutdown => ErrorKind::Shutdown,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Persist(PersistError::Serde(e))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
