//! Engine error taxonomy. Every failure carries a stable kind, a message, and
//! optionally the block it originated from.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error kinds surfaced by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidBlockKind,
    MissingRequiredField,
    InvalidWorkflow,
    /// Internal: a template reference points at a block that has not executed
    /// yet. The executor catches this and defers the block; it never surfaces.
    UnresolvedReference,
    ForEachNotIterable,
    BlockTimeout,
    BlockFailed,
    HandlerNotRegistered,
    Cancelled,
    WorkflowTimeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidBlockKind => "InvalidBlockKind",
            ErrorKind::MissingRequiredField => "MissingRequiredField",
            ErrorKind::InvalidWorkflow => "InvalidWorkflow",
            ErrorKind::UnresolvedReference => "UnresolvedReference",
            ErrorKind::ForEachNotIterable => "ForEachNotIterable",
            ErrorKind::BlockTimeout => "BlockTimeout",
            ErrorKind::BlockFailed => "BlockFailed",
            ErrorKind::HandlerNotRegistered => "HandlerNotRegistered",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::WorkflowTimeout => "WorkflowTimeout",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine execution/validation error.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(rename = "blockId", skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            block_id: None,
        }
    }

    pub fn with_block(mut self, block_id: impl Into<String>) -> Self {
        self.block_id = Some(block_id.into());
        self
    }

    pub fn invalid_workflow(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidWorkflow, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = EngineError::new(ErrorKind::BlockFailed, "boom").with_block("b1");
        assert_eq!(err.to_string(), "BlockFailed: boom");
        assert_eq!(err.block_id.as_deref(), Some("b1"));
    }

    #[test]
    fn kind_serializes_as_stable_name() {
        let json = serde_json::to_string(&ErrorKind::ForEachNotIterable).unwrap();
        assert_eq!(json, "\"ForEachNotIterable\"");
    }
}
