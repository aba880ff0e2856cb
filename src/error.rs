//! Error taxonomy shared by the registry, the lifecycle engine and the
//! orchestrator.

use thiserror::Error;

use crate::models::{Action, Stage};

pub type Result<T> = std::result::Result<T, FlowError>;

#[derive(Debug, Error)]
pub enum FlowError {
    /// Bad input. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid transition: cannot {action} a feature in stage {stage}")]
    InvalidTransition { stage: Stage, action: Action },

    /// Optimistic-concurrency clash. The caller may retry the read-modify-write.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("hook {hook} failed: {message}")]
    HookFailure { hook: String, message: String },

    #[error("hook {hook} timed out after {seconds}s")]
    Timeout { hook: String, seconds: u64 },

    #[error("storage error: {0}")]
    Storage(String),
}

impl FlowError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// No free slot for another feature in a capacity-consuming stage.
    pub fn capacity_reached(limit: usize, active: usize) -> Self {
        Self::Conflict(format!(
            "capacity of {limit} reached ({active} features in capacity-consuming stages)"
        ))
    }

    /// Process exit code for the CLI. Registry failures are 2, everything
    /// else is a user-facing failure and maps to 1.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Storage(_) => 2,
            _ => 1,
        }
    }

    /// Timeouts count as hook failures: the transition was aborted.
    pub fn is_hook_failure(&self) -> bool {
        matches!(self, Self::HookFailure { .. } | Self::Timeout { .. })
    }

    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound { .. } => "not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Conflict(_) => "conflict",
            Self::HookFailure { .. } => "hook_failure",
            Self::Timeout { .. } => "timeout",
            Self::Storage(_) => "storage",
        }
    }
}

impl From<rusqlite::Error> for FlowError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(format!("malformed record: {e}"))
    }
}

impl From<std::io::Error> for FlowError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
