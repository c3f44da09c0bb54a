//! Error taxonomy for the operation engine.
//!
//! Structural misuse surfaces as `BadInput`/`NotFound`/`Conflict` and is
//! raised synchronously, before any work runs. Failed walks surface as
//! `Execution`/`Undo`, carrying the context's full accumulated result
//! history rather than a single error.

use crate::outcome::{summarize, Outcome};
use thiserror::Error;

/// Result alias used throughout the crate.
pub type EngineResult<T> = Result<T, EngineError>;

/// The error type raised by engine operations.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// A malformed argument, such as an empty child collection. Never
    /// retried.
    #[error("bad input: {0}")]
    BadInput(String),

    /// An unknown execution id.
    #[error("execution not found: {0}")]
    NotFound(String),

    /// A walk was requested while a conflicting walk holds the context.
    #[error("conflict: {0}")]
    Conflict(String),

    /// An exec walk failed. The payload is the context's full accumulated
    /// `exec_results`, in order, not just the final error.
    #[error("execution failed: {}", summarize(.0))]
    Execution(Vec<Outcome>),

    /// An undo walk failed. The payload is the accumulated `undo_results`.
    #[error("undo failed: {}", summarize(.0))]
    Undo(Vec<Outcome>),
}

impl EngineError {
    /// Returns the accumulated outcomes carried by a failed walk, if any.
    #[must_use]
    pub fn outcomes(&self) -> Option<&[Outcome]> {
        match self {
            Self::Execution(outcomes) | Self::Undo(outcomes) => Some(outcomes),
            _ => None,
        }
    }

    /// Consumes the error and returns the accumulated outcomes, if any.
    #[must_use]
    pub fn into_outcomes(self) -> Option<Vec<Outcome>> {
        match self {
            Self::Execution(outcomes) | Self::Undo(outcomes) => Some(outcomes),
            _ => None,
        }
    }

    /// Returns true for the synchronous structural errors that are never
    /// retried.
    #[must_use]
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::BadInput(_) | Self::NotFound(_) | Self::Conflict(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_structural_errors() {
        assert!(EngineError::BadInput("x".into()).is_structural());
        assert!(EngineError::NotFound("x".into()).is_structural());
        assert!(EngineError::Conflict("x".into()).is_structural());
        assert!(!EngineError::Execution(Vec::new()).is_structural());
    }

    #[test]
    fn test_execution_error_carries_history() {
        let outcomes = vec![
            Outcome::Value(json!(1)),
            Outcome::Failure("boom".to_string()),
        ];
        let err = EngineError::Execution(outcomes.clone());
        assert_eq!(err.outcomes(), Some(outcomes.as_slice()));
        assert!(err.to_string().contains("boom"));
        assert_eq!(err.into_outcomes(), Some(outcomes));
    }

    #[test]
    fn test_not_found_display() {
        let err = EngineError::NotFound("op-42".to_string());
        assert_eq!(err.to_string(), "execution not found: op-42");
    }
}
