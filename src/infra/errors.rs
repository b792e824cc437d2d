// src/infra/errors.rs — Error types for agentforge

use std::time::Duration;

use thiserror::Error;

use crate::core::patch::PatchRejection;
use crate::core::types::{FailureKind, FailureRecord, TaskKind};

/// Typed failure of a single provider call. Recovered by the router.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimit { retry_after_ms: u64 },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    /// Auth failures will not heal on the same tier; everything else might.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, ProviderError::Auth(_))
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ProviderError::RateLimit { .. } => FailureKind::RateLimit,
            ProviderError::Timeout(_) => FailureKind::Timeout,
            ProviderError::Auth(_) => FailureKind::Auth,
            ProviderError::Malformed(_) => FailureKind::Malformed,
            ProviderError::Unavailable(_) => FailureKind::Unavailable,
        }
    }
}

#[derive(Error, Debug)]
pub enum ForgeError {
    // Router-level errors
    #[error("Provider error on tier '{tier}': {source}")]
    Provider {
        tier: String,
        #[source]
        source: ProviderError,
    },

    #[error("{task} output failed validation: {reason}")]
    Validation { task: TaskKind, reason: String },

    #[error("Escalation exhausted for {task} after {} failed attempts", .history.len())]
    EscalationExhausted {
        task: TaskKind,
        history: Vec<FailureRecord>,
    },

    // Step-level errors
    #[error("Invalid patch: {0}")]
    PatchFormat(PatchRejection),

    #[error("Patch did not apply: {reason}")]
    PatchApply { reason: String },

    #[error("Tests failed: {summary}")]
    TestFailure { summary: String },

    // Hard stops
    #[error("Budget exceeded: projected cost {projected:.4} exceeds remaining budget {remaining:.4}")]
    BudgetExceeded { projected: f64, remaining: f64 },

    #[error("Execution timeout exceeded: {elapsed_secs}s elapsed, limit {limit_secs}s")]
    TimeoutExceeded { elapsed_secs: u64, limit_secs: u64 },

    #[error("Run cancelled")]
    Cancelled,

    // State machine
    #[error("No transition from {state} on {event}")]
    InvalidTransition { state: String, event: String },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    // Infra
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ForgeError {
    /// Errors that end a run outright instead of feeding retry/replan.
    pub fn is_hard_stop(&self) -> bool {
        matches!(
            self,
            ForgeError::BudgetExceeded { .. }
                | ForgeError::TimeoutExceeded { .. }
                | ForgeError::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, ForgeError>;
