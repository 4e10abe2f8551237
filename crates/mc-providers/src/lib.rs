//! Capability sets for Marcus's external collaborators: the Kanban board
//! and the AI provider. Implementations are chosen at startup by
//! configuration; new backends are added by satisfying the capability set.

pub mod ai;
pub mod http;
pub mod kanban;
pub mod retry;

pub use ai::{
    AIProvider, DecompositionRequest, DecompositionResponse, DependencyQuery, Direction,
    InferenceVerdict, ProposedSubtask, ScriptedAi, StubAi, TaskBrief,
};
pub use http::HttpKanban;
pub use kanban::{InMemoryKanban, KanbanProvider, NewTask, RemoteProject, TaskPatch};
pub use retry::{with_deadline, with_retry, RetryPolicy};

use mc_core::ErrorKind;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider not configured: {0}")]
    NotConfigured(String),
    #[error("api error: {0}")]
    Api(String),
    #[error("rate limited – retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("request timed out")]
    Timeout,
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("entity not found: {0}")]
    NotFound(String),
}

impl ProviderError {
    /// Transient errors are worth a bounded retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Api(_)
                | ProviderError::RateLimited { .. }
                | ProviderError::Timeout
                | ProviderError::Unavailable(_)
        )
    }

    /// Wire kind for a board-provider failure.
    pub fn board_kind(&self) -> ErrorKind {
        match self {
            ProviderError::Timeout => ErrorKind::Timeout,
            ProviderError::NotFound(_) => ErrorKind::NotFound,
            _ => ErrorKind::ProviderUnavailable,
        }
    }

    /// Wire kind for an AI-provider failure.
    pub fn ai_kind(&self) -> ErrorKind {
        match self {
            ProviderError::Timeout => ErrorKind::Timeout,
            _ => ErrorKind::AiUnavailable,
        }
    }
}
