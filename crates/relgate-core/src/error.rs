//! # Error Types
//!
//! Errors raised by the pure domain layer. Every variant carries enough
//! context to be surfaced to an operator verbatim.

use thiserror::Error;

/// Failure to parse one of a schedule rule's filters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Invalid time format (HH:MM[:SS] expected): {0:?}")]
    InvalidTimeFormat(String),

    #[error("Error parsing {component} component of {input:?}")]
    InvalidTimeComponent {
        /// `hour`, `minute` or `second`.
        component: &'static str,
        input: String,
    },

    #[error("Unrecognized week day {0:?}")]
    UnknownWeekDay(String),

    #[error("Unrecognized month day {0:?} (1-31 expected)")]
    UnknownMonthDay(String),

    #[error("Unrecognized month {0:?}")]
    UnknownMonth(String),

    #[error("begin_time and end_time must both be set or both be unset")]
    UnpairedTimeRange,
}

/// Release state machine violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("release {release} has state {state} but finalized_at is {finalized}")]
    FinalizedAtMismatch {
        release: String,
        state: String,
        finalized: &'static str,
    },
}

/// Invalid approval rule configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("invalid HTTP API rule URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("retry_limit must be at least 1 when retry_policy is retry_on_fail")]
    MissingRetryLimit,

    #[error("minimum approval count must be at least 1")]
    ZeroMinimum,

    #[error("password set without username")]
    PasswordWithoutUsername,

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}
