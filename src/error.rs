use thiserror::Error;

use crate::domain::{NodeId, PipelineId};

/// Main error type for the arbiter
#[derive(Error, Debug)]
pub enum ArbiterError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Coordination store errors
    #[error("Coordination store error: {0}")]
    Store(#[from] StoreError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Arbitration protocol errors
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Mainstem for pipeline {pipeline_id} is not held by node {node_id}")]
    NotMainstem {
        pipeline_id: PipelineId,
        node_id: NodeId,
    },

    // Collaborator errors
    #[error("Batch source error: {0}")]
    BatchSource(String),

    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    #[error("Completion channel error: {0}")]
    Completion(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation interrupted")]
    Interrupted,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ArbiterError {
    /// True when the error means "stop quietly" rather than "roll back".
    ///
    /// Interruption is the process stopping, not the pipeline failing, so
    /// callers exit without any rollback side effect.
    pub fn should_stop(&self) -> bool {
        matches!(
            self,
            ArbiterError::Interrupted
                | ArbiterError::NotMainstem { .. }
                | ArbiterError::Store(StoreError::Interrupted)
        )
    }

    /// Errors the consumer treats as an expected reason to roll back and
    /// retry, without escalating an abort signal downstream.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ArbiterError::ProtocolViolation(_) | ArbiterError::BatchSource(_)
        )
    }
}

/// Result type alias for ArbiterError
pub type Result<T> = std::result::Result<T, ArbiterError>;

/// Errors surfaced by a coordination store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("no such node: {0}")]
    NoNode(String),

    #[error("node has children: {0}")]
    NotEmpty(String),

    #[error("version conflict on {path}: expected {expected}, found {actual}")]
    BadVersion {
        path: String,
        expected: i32,
        actual: i32,
    },

    #[error("connection lost: {0}")]
    ConnectionLoss(String),

    #[error("session {0} expired")]
    SessionExpired(u64),

    #[error("store call interrupted")]
    Interrupted,
}

impl StoreError {
    /// Connection loss and session expiry: state must be re-read, never trusted.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::ConnectionLoss(_) | StoreError::SessionExpired(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_errors_are_not_recoverable() {
        assert!(ArbiterError::Interrupted.should_stop());
        assert!(ArbiterError::Store(StoreError::Interrupted).should_stop());
        assert!(!ArbiterError::Interrupted.is_recoverable());
    }

    #[test]
    fn test_protocol_violation_is_recoverable() {
        let err = ArbiterError::ProtocolViolation("unmatched batch".into());
        assert!(err.is_recoverable());
        assert!(!err.should_stop());
        assert!(err.to_string().contains("unmatched batch"));
    }

    #[test]
    fn test_transient_store_errors() {
        assert!(StoreError::SessionExpired(3).is_transient());
        assert!(StoreError::ConnectionLoss("reset".into()).is_transient());
        assert!(!StoreError::NodeExists("/a".into()).is_transient());
    }
}
