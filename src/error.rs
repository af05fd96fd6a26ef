use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::types::{EngineState, TaskKind};

/// Failures from the browser session adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrowserError {
    /// Fatal: the debugging endpoint is gone or has no attachable page.
    #[error("browser session unavailable: {0}")]
    SessionUnavailable(String),
    #[error("page did not settle within {0:?}")]
    ObservationTimeout(Duration),
    #[error("action failed: {reason}")]
    ActionFailed { reason: String },
}

impl BrowserError {
    pub fn action_failed(reason: impl Into<String>) -> Self {
        Self::ActionFailed {
            reason: reason.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SessionUnavailable(_))
    }

    /// Message recorded in step history, without the variant prefix.
    pub fn detail(&self) -> String {
        match self {
            Self::ActionFailed { reason } => reason.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanningError {
    /// Rate limits and network hiccups; the engine retries the same step.
    #[error("transient planning error: {0}")]
    Transient(String),
    /// Malformed or rejected responses; costs one step of the attempt.
    #[error("permanent planning error: {0}")]
    Permanent(String),
}

impl PlanningError {
    pub fn detail(&self) -> &str {
        match self {
            Self::Transient(msg) | Self::Permanent(msg) => msg,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[error("schema violation at `{field}`: {reason}")]
pub struct SchemaViolation {
    pub field: String,
    pub reason: String,
}

impl SchemaViolation {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("storage rejected write ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("invalid storage endpoint: {0}")]
    Endpoint(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} environment variable must be set")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// A task that produced no usable result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    pub kind: TaskKind,
    pub attempts: u32,
    pub last_state: EngineState,
    pub reason: String,
}

/// Errors surfaced to whoever invoked the run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RunError {
    #[error("session unavailable during {task:?} task after {attempts} attempt(s) in state {last_state}: {reason}")]
    SessionUnavailable {
        reason: String,
        task: Option<TaskKind>,
        attempts: u32,
        last_state: EngineState,
    },
    #[error("all extraction tasks failed: {}", describe(.failures))]
    Exhausted { failures: Vec<TaskFailure> },
    #[error("run cancelled during {task:?} task after {attempts} attempt(s) in state {last_state}")]
    Cancelled {
        task: Option<TaskKind>,
        attempts: u32,
        last_state: EngineState,
    },
}

impl RunError {
    pub fn kind(&self) -> &'static str {
        match self {
            RunError::SessionUnavailable { .. } => "session_unavailable",
            RunError::Exhausted { .. } => "retries_exhausted",
            RunError::Cancelled { .. } => "cancelled",
        }
    }
}

fn describe(failures: &[TaskFailure]) -> String {
    failures
        .iter()
        .map(|f| {
            format!(
                "{} task failed after {} attempt(s) in state {}: {}",
                f.kind, f.attempts, f.last_state, f.reason
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}
