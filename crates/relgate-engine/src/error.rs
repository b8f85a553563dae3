//! # Engine Errors
//!
//! Error taxonomy of the processing engine:
//!
//! - **Lock allocation exhaustion**: no free lock sub-id was found; the
//!   enclosing release creation fails outright.
//! - **Persistence errors**: fatal to the current pass; the job stays
//!   claimable and is retried by a later poll.
//! - **Invariant violations**: programming bugs (corrupt discriminants,
//!   inconsistent rows); processing halts loudly instead of skipping a rule.
//!
//! External rule failures (non-2xx, closed schedule windows, missing
//! sign-off) are not errors; they are recorded as outcomes.

use relgate_core::{RuleError, ScheduleError, StateError};
use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by the engine and its stores.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Unable to find a free lock sub-ID after {tries} tries")]
    LockAllocationExhausted { tries: u32 },

    #[error("release {0} not found")]
    ReleaseNotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("invalid manual decision: {0}")]
    InvalidDecision(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("HTTP client initialization failed: {0}")]
    HttpClient(#[from] reqwest::Error),
}

impl EngineError {
    /// Whether a later attempt at the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// SQLSTATE for `unique_violation`.
pub(crate) const UNIQUE_VIOLATION: &str = "23505";

/// Map a unique violation to [`EngineError::AlreadyExists`], pass everything
/// else through.
pub(crate) fn map_unique_violation(err: sqlx::Error, what: impl FnOnce() -> String) -> EngineError {
    let is_unique = err
        .as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == UNIQUE_VIOLATION);
    if is_unique {
        EngineError::AlreadyExists(what())
    } else {
        EngineError::Database(err)
    }
}
