//! Core types and error definitions for the Troupe orchestration workspace.
//!
//! This crate provides the foundational types shared across all Troupe crates:
//! the unified error taxonomy and the inter-agent message representation.
//!
//! # Main types
//!
//! - [`TroupeError`]: Unified error enum for every orchestration subsystem.
//! - [`TroupeResult`]: Convenience alias for `Result<T, TroupeError>`.
//! - [`Message`]: A message exchanged between agents (collaboration, status).
//! - [`MessageType`]: The kind of a [`Message`].

/// Inter-agent message types.
pub mod message;

pub use message::{Message, MessageType};

use uuid::Uuid;

// --- Error types ---

/// Top-level error type for the Troupe workspace.
///
/// Variants mirror the orchestration error taxonomy: submission validation,
/// agent availability, malformed decompositions, gateway failures and
/// consensus failures.
#[derive(Debug, thiserror::Error)]
pub enum TroupeError {
    /// A malformed submission or registration, rejected before it enters the
    /// state machine.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An agent with the same identity is already active.
    #[error("Duplicate agent: {0}")]
    DuplicateAgent(String),

    /// The agent cannot take another task right now.
    #[error("Agent unavailable: {0}")]
    AgentUnavailable(Uuid),

    /// No agent is registered under this id.
    #[error("Agent not found: {0}")]
    AgentNotFound(Uuid),

    /// No task is known under this id.
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    /// Decomposition output whose dependency edges form a cycle.
    #[error("Cyclic dependency among subtasks: {0}")]
    CyclicDependency(String),

    /// Decomposition output referencing an unknown sibling.
    #[error("Subtask '{subtask}' depends on unknown sibling '{missing}'")]
    DanglingDependency {
        /// Key of the subtask declaring the dependency.
        subtask: String,
        /// Key that could not be resolved.
        missing: String,
    },

    /// Decomposition output that is structurally unusable for another reason
    /// (duplicate keys, empty titles, too many subtasks).
    #[error("Invalid decomposition: {0}")]
    InvalidDecomposition(String),

    /// The task already has children; decomposition never runs twice.
    #[error("Task {0} has already been decomposed")]
    AlreadyDecomposed(Uuid),

    /// A lifecycle transition that is not an edge of the state machine.
    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        /// Task whose transition was rejected.
        task_id: Uuid,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// An operation exceeded its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The reasoning gateway failed or returned unusable output.
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// Every collected result was discarded during conflict resolution.
    #[error("No viable result for task {0}")]
    NoViableResult(Uuid),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal orchestrator error.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),
}

impl TroupeError {
    /// Whether the failure is transient and the affected task may be retried
    /// within its retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TroupeError::Timeout(_)
                | TroupeError::Gateway(_)
                | TroupeError::NoViableResult(_)
                | TroupeError::AgentUnavailable(_)
        )
    }

    /// Whether the failure stems from malformed decomposition output. Such
    /// failures are terminal: retrying cannot change the structure.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            TroupeError::CyclicDependency(_)
                | TroupeError::DanglingDependency { .. }
                | TroupeError::InvalidDecomposition(_)
        )
    }
}

/// A convenience `Result` alias using [`TroupeError`].
pub type TroupeResult<T> = Result<T, TroupeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(TroupeError::Timeout("execute".into()).is_retryable());
        assert!(TroupeError::Gateway("503".into()).is_retryable());
        assert!(TroupeError::NoViableResult(Uuid::new_v4()).is_retryable());
        assert!(TroupeError::AgentUnavailable(Uuid::new_v4()).is_retryable());
        assert!(!TroupeError::CyclicDependency("a -> b -> a".into()).is_retryable());
        assert!(!TroupeError::Validation("empty".into()).is_retryable());
    }

    #[test]
    fn test_structural_classification() {
        assert!(TroupeError::CyclicDependency("a".into()).is_structural());
        assert!(TroupeError::DanglingDependency {
            subtask: "c".into(),
            missing: "z".into()
        }
        .is_structural());
        assert!(TroupeError::InvalidDecomposition("dup".into()).is_structural());
        assert!(!TroupeError::Gateway("down".into()).is_structural());
    }

    #[test]
    fn test_error_display() {
        let err = TroupeError::DanglingDependency {
            subtask: "report".into(),
            missing: "collect".into(),
        };
        assert_eq!(
            err.to_string(),
            "Subtask 'report' depends on unknown sibling 'collect'"
        );

        let id = Uuid::new_v4();
        let err = TroupeError::InvalidTransition {
            task_id: id,
            from: "completed".into(),
            to: "ready".into(),
        };
        assert!(err.to_string().contains("completed -> ready"));
    }
}
