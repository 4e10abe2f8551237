//! AI-adjacent intelligence: the hybrid dependency inferer, the task
//! decomposer, the outcome learner, and instruction generation.

pub mod decompose;
pub mod infer;
pub mod instructions;
pub mod memory;

pub use decompose::{should_decompose, DecomposedSet, Decomposer};
pub use infer::HybridInferer;
pub use memory::{OutcomeLearner, Prediction};

use mc_core::ErrorKind;
use mc_providers::ProviderError;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum IntelligenceError {
    #[error("ai provider: {0}")]
    Ai(#[from] ProviderError),
    #[error("malformed ai response: {0}")]
    InvalidResponse(String),
}

impl IntelligenceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IntelligenceError::Ai(e) => e.ai_kind(),
            IntelligenceError::InvalidResponse(_) => ErrorKind::AiUnavailable,
        }
    }
}
