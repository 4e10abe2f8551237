use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ErrorKind — stable wire taxonomy
// ---------------------------------------------------------------------------

/// Every error that crosses the tool surface carries one of these kinds.
/// The string tags are part of the wire contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    UnknownAgent,
    UnknownTask,
    NotFound,
    Ambiguous,
    AlreadyRegistered,
    NoActiveProject,
    StaleLease,
    Conflict,
    StorageUnavailable,
    ProviderUnavailable,
    AiUnavailable,
    UnfixableGraph,
    Timeout,
    Shutdown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::UnknownAgent => "unknown_agent",
            ErrorKind::UnknownTask => "unknown_task",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Ambiguous => "ambiguous",
            ErrorKind::AlreadyRegistered => "already_registered",
            ErrorKind::NoActiveProject => "no_active_project",
            ErrorKind::StaleLease => "stale_lease",
            ErrorKind::Conflict => "conflict",
            ErrorKind::StorageUnavailable => "storage_unavailable",
            ErrorKind::ProviderUnavailable => "provider_unavailable",
            ErrorKind::AiUnavailable => "ai_unavailable",
            ErrorKind::UnfixableGraph => "unfixable_graph",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Shutdown => "shutdown",
        }
    }

    /// Retryable kinds are transient; the enclosing handler may retry up to
    /// its bounded budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Conflict
                | ErrorKind::StorageUnavailable
                | ErrorKind::ProviderUnavailable
                | ErrorKind::AiUnavailable
                | ErrorKind::Timeout
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// PersistError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("not found: {collection}/{key}")]
    NotFound { collection: String, key: String },
    #[error("conflict on {collection}/{key}: {reason}")]
    Conflict {
        collection: String,
        key: String,
        reason: String,
    },
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

impl PersistError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PersistError::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            PersistError::NotFound { .. } => ErrorKind::NotFound,
            PersistError::Conflict { .. } => ErrorKind::Conflict,
            PersistError::Serde(_) => ErrorKind::InvalidInput,
        }
    }
}

impl From<std::io::Error> for PersistError {
    fn from(e: std::io::Error) -> Self {
        PersistError::StorageUnavailable(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
