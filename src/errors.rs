//! Typed error hierarchy for the conductor engine.
//!
//! Subsystem enums cover the core surfaces:
//! - `StateError` — persistent-store failures (load/save/lock/recovery)
//! - `PhaseError` — phase-transition precondition failures
//! - `TaskError` — task lifecycle and DAG failures
//! - `CheckpointError` — batch checkpoint failures
//! - `FsmError` — behavior-model compilation and validation failures
//!
//! Every error maps onto a stable `category:code` pair so agents can parse
//! failures from stderr without matching on prose.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the state store and lock manager.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("State file not found at {path}")]
    NotFound { path: PathBuf },

    #[error("State file at {path} is corrupt: {detail}")]
    Corrupt { path: PathBuf, detail: String },

    #[error("Timed out waiting for lock on {path}")]
    Locked { path: PathBuf },

    #[error("Failed to write state file at {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("State validation failed: {}", violations.join("; "))]
    Invalid { violations: Vec<String> },
}

/// Errors from the phase controller.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Cannot advance from terminal phase 'complete'")]
    AlreadyComplete,

    #[error("Cannot advance from {from} to {to}: {reason}")]
    PreconditionFailed {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Unknown phase '{0}'")]
    UnknownPhase(String),
}

/// Errors from the task loader, DAG analysis, and lifecycle operations.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task '{0}' not found")]
    NotFound(String),

    #[error("Task '{id}' is {status}; expected one of: {expected}")]
    InvalidTransition {
        id: String,
        status: String,
        expected: String,
    },

    #[error("Task '{id}' failed with a non-retryable error")]
    NotRetryable { id: String },

    #[error("Task file {file} has no 'id' field")]
    MissingId { file: String },

    #[error("Duplicate task ID '{id}' (first seen in {first}, again in {second})")]
    DuplicateId {
        id: String,
        first: String,
        second: String,
    },

    #[error("Task ID '{0}' does not match the required shape T###")]
    MalformedId(String),

    #[error("Failed to parse task file {file}: {detail}")]
    ParseFailed { file: String, detail: String },

    #[error("Cycle detected in task dependencies. Involved tasks: {}", ids.join(", "))]
    CycleDetected { ids: Vec<String> },
}

/// Errors from the checkpoint coordinator.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("No checkpoint file at {path}")]
    NotFound { path: PathBuf },

    #[error("Checkpoint file at {path} is corrupt: {detail}")]
    Corrupt { path: PathBuf, detail: String },

    #[error("Task '{id}' is not part of the current batch")]
    UnknownTask { id: String },

    #[error("Failed to write checkpoint at {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the behavior-model compiler and validator.
#[derive(Debug, Error)]
pub enum FsmError {
    #[error("FSM artifact not found at {path}")]
    NotFound { path: PathBuf },

    #[error("Failed to compile workflow '{workflow}': {detail}")]
    CompileFailed { workflow: String, detail: String },

    #[error("FSM validation failed with {} error(s)", errors.len())]
    ValidationFailed { errors: Vec<String> },
}

/// Errors from configuration and artifact inputs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required input: {0}")]
    Missing(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Umbrella error carried across command boundaries.
///
/// Each variant resolves to a `category:code` pair used in the fixed
/// stderr format `ERROR [category:code]`.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Phase(#[from] PhaseError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Fsm(#[from] FsmError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to read {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    IoWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Path does not exist: {0}")]
    NotExists(PathBuf),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    /// The error category, one of: state, validation, schema, config, io, internal.
    pub fn category(&self) -> &'static str {
        match self {
            CoreError::State(_) => "state",
            CoreError::Phase(_) | CoreError::Task(_) => "validation",
            CoreError::Checkpoint(e) => match e {
                CheckpointError::NotFound { .. } | CheckpointError::Corrupt { .. } => "state",
                _ => "validation",
            },
            CoreError::Fsm(_) => "schema",
            CoreError::Config(_) => "config",
            CoreError::ReadFailed { .. }
            | CoreError::IoWriteFailed { .. }
            | CoreError::NotExists(_) => "io",
            CoreError::Internal(_) => "internal",
        }
    }

    /// The stable error code within the category.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::State(e) => match e {
                StateError::NotFound { .. } => "NOT_FOUND",
                StateError::Corrupt { .. } | StateError::Invalid { .. } => "CORRUPT",
                StateError::Locked { .. } => "LOCKED",
                StateError::WriteFailed { .. } => "WRITE_FAILED",
            },
            CoreError::Phase(_) => "FAILED",
            CoreError::Task(e) => match e {
                TaskError::MissingId { .. }
                | TaskError::MalformedId(_)
                | TaskError::ParseFailed { .. } => "INVALID_FIELD",
                _ => "FAILED",
            },
            CoreError::Checkpoint(e) => match e {
                CheckpointError::NotFound { .. } => "NOT_FOUND",
                CheckpointError::Corrupt { .. } => "CORRUPT",
                CheckpointError::UnknownTask { .. } => "FAILED",
                CheckpointError::WriteFailed { .. } => "WRITE_FAILED",
            },
            CoreError::Fsm(e) => match e {
                FsmError::NotFound { .. } => "NOT_FOUND",
                FsmError::CompileFailed { .. } => "COMPILE_FAILED",
                FsmError::ValidationFailed { .. } => "VALIDATION_FAILED",
            },
            CoreError::Config(e) => match e {
                ConfigError::Missing(_) => "MISSING",
                ConfigError::Invalid(_) => "INVALID",
            },
            CoreError::ReadFailed { .. } => "READ_FAILED",
            CoreError::IoWriteFailed { .. } => "WRITE_FAILED",
            CoreError::NotExists(_) => "NOT_EXISTS",
            CoreError::Internal(_) => "ERROR",
        }
    }

    /// Structured detail lines written below the `ERROR [category:code]` header.
    pub fn detail_lines(&self) -> Vec<String> {
        match self {
            CoreError::State(StateError::Invalid { violations }) => violations
                .iter()
                .map(|v| format!("violation: {v}"))
                .collect(),
            CoreError::Task(TaskError::CycleDetected { ids }) => {
                ids.iter().map(|id| format!("cycle-member: {id}")).collect()
            }
            CoreError::Fsm(FsmError::ValidationFailed { errors }) => {
                errors.iter().map(|e| format!("invariant: {e}")).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Render the fixed stderr format for this error.
    pub fn render(&self) -> String {
        let mut out = format!("ERROR [{}:{}]\n{self}", self.category(), self.code());
        for line in self.detail_lines() {
            out.push('\n');
            out.push_str(&line);
        }
        out
    }
}

/// Result alias used throughout the engine.
pub type CoreResult<T> = Result<T, CoreError>;
