//! Error types for expression inference.

use crate::extension::ExtensionError;
use thiserror::Error;

/// Maximum nesting of computed-column lookups before an expression is
/// treated as a circular reference.
pub const MAX_DEPTH: usize = 100;

/// Failures while inferring facts about an expression
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    /// A computed column references itself, directly or transitively
    #[error("recursion limit of {MAX_DEPTH} exceeded, probably a circular column reference")]
    RecursionLimit,

    #[error("variable not found: {0}")]
    VariableNotFound(String),

    #[error(transparent)]
    Extension(#[from] ExtensionError),
}

/// Result type for inference operations
pub type InferenceResult<T> = Result<T, InferenceError>;
