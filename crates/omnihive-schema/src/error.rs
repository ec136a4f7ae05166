use std::time::Duration;

use thiserror::Error;

/// Vector store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("vector dimension mismatch: table expects {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Embedding gateway failures.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding temporarily unavailable: {0}")]
    Unavailable(String),
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Checkpoint store failures.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("parent checkpoint {parent_id} not found in thread {thread_id}")]
    Conflict { thread_id: String, parent_id: String },
    #[error("checkpoint storage error: {0}")]
    Storage(String),
}

/// Subprocess pool failures.
#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("node {0} is unreachable (connect failed)")]
    Unreachable(String),
    #[error("node {node} circuit is open for another {remaining:?}")]
    CircuitOpen { node: String, remaining: Duration },
    #[error("node {node} call timed out after {timeout:?}")]
    Timeout { node: String, timeout: Duration },
    #[error("unknown node: {0}")]
    UnknownNode(String),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("transport error: {0}")]
    Transport(String),
}

/// Skill runner error taxonomy. Propagated unchanged to the executor.
#[derive(Debug, Error)]
pub enum SkillError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("execution timed out after {0:?}")]
    ExecutionTimeout(Duration),
    #[error("worker unreachable: {0}")]
    WorkerUnreachable(String),
    #[error("circuit open for node {0}")]
    CircuitOpen(String),
    #[error("handler error: {0}")]
    Handler(String),
}

impl SkillError {
    /// Machine-readable code for user-visible presentation. The single-line
    /// message comes from `Display`; stack traces never leave the logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownCommand(_) => "unknown_command",
            Self::InvalidArgs(_) => "invalid_args",
            Self::ExecutionTimeout(_) => "execution_timeout",
            Self::WorkerUnreachable(_) => "worker_unreachable",
            Self::CircuitOpen(_) => "circuit_open",
            Self::Handler(_) => "handler_error",
        }
    }
}

impl From<SwarmError> for SkillError {
    fn from(err: SwarmError) -> Self {
        match err {
            SwarmError::Unreachable(node) => Self::WorkerUnreachable(node),
            SwarmError::CircuitOpen { node, .. } => Self::CircuitOpen(node),
            SwarmError::Timeout { timeout, .. } => Self::ExecutionTimeout(timeout),
            SwarmError::UnknownNode(node) => Self::WorkerUnreachable(node),
            SwarmError::Rpc { code: -32601, message } => Self::UnknownCommand(message),
            SwarmError::Rpc { code: -32602, message } => Self::InvalidArgs(message),
            SwarmError::Rpc { message, .. } => Self::Handler(message),
            SwarmError::Transport(msg) => Self::WorkerUnreachable(msg),
        }
    }
}

/// Workflow graph failures.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("node not found: {0}")]
    NodeNotFound(String),
    #[error("entry point not set")]
    MissingEntryPoint,
    #[error("node {0} has both an edge and conditional edges")]
    ConflictingEdges(String),
    #[error("conditional route from {from} returned unknown label {label}")]
    UnknownRoute { from: String, label: String },
    #[error("thread {0} has no checkpoint to resume from")]
    NothingToResume(String),
    #[error("node {node} failed: {message}")]
    NodeFailed { node: String, message: String },
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swarm_rpc_codes_map_to_skill_errors() {
        let unknown = SkillError::from(SwarmError::Rpc {
            code: -32601,
            message: "no such tool".into(),
        });
        assert!(matches!(unknown, SkillError::UnknownCommand(_)));

        let bad_args = SkillError::from(SwarmError::Rpc {
            code: -32602,
            message: "missing field".into(),
        });
        assert!(matches!(bad_args, SkillError::InvalidArgs(_)));

        let other = SkillError::from(SwarmError::Rpc {
            code: -32000,
            message: "boom".into(),
        });
        assert!(matches!(other, SkillError::Handler(_)));
    }

    #[test]
    fn circuit_open_maps_through() {
        let err = SkillError::from(SwarmError::CircuitOpen {
            node: "coder".into(),
            remaining: Duration::from_secs(12),
        });
        assert!(matches!(err, SkillError::CircuitOpen(node) if node == "coder"));
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(SkillError::UnknownCommand("x".into()).code(), "unknown_command");
        assert_eq!(
            SkillError::ExecutionTimeout(Duration::from_secs(60)).code(),
            "execution_timeout"
        );
    }
}
