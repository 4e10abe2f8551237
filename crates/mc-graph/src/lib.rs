//! Dependency graph machinery: the graph value type, the auto-fix
//! validator, and the pattern rule catalog used by the hybrid inferer.

pub mod graph;
pub mod patterns;
pub mod validator;

pub use graph::DependencyGraph;
pub use patterns::{pattern_pass, AmbiguousPair, CandidateEdge, PatternOutcome};
pub use validator::{validate, validate_strict, ValidationOutcome};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// The validator exceeded its repair budget. Fatal for the current
    /// create/sync call; the server keeps running.
    #[error("task graph unfixable after {repairs} cycle repairs")]
    UnfixableGraph { repairs: usize },
    #[error("strict validation failed: {0}")]
    Strict(String),
}

impl GraphError {
    pub fn kind(&self) -> mc_core::ErrorKind {
        match self {
            GraphError::UnfixableGraph { .. } => mc_core::ErrorKind::UnfixableGraph,
            GraphError::Strict(_) => mc_core::ErrorKind::InvalidInput,
        }
    }
}
