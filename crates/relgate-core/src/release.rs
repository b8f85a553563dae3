//! # Releases
//!
//! A release is a deployable change request gated by approval rules. Its
//! lifecycle is a four-state machine:
//!
//! ```text
//! in_progress ──▶ approved
//!      │
//!      ├────────▶ rejected
//!      │
//!      └────────▶ cancelled
//! ```
//!
//! All three targets are terminal. `finalized_at` is set exactly when the
//! state is terminal; [`Release::transition`] keeps the two in lockstep.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StateError;
use crate::identity::ReleaseKey;

// ---------------------------------------------------------------------------
// ReleaseState
// ---------------------------------------------------------------------------

/// Processing state of a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseState {
    InProgress,
    Cancelled,
    Approved,
    Rejected,
}

impl ReleaseState {
    /// All states, in declaration order.
    pub const ALL: [ReleaseState; 4] = [
        Self::InProgress,
        Self::Cancelled,
        Self::Approved,
        Self::Rejected,
    ];

    /// Return whether this is a terminal state (no further transitions).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }

    /// Database / wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Cancelled => "cancelled",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for ReleaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReleaseState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown release state {s:?}"))
    }
}

// ---------------------------------------------------------------------------
// Release
// ---------------------------------------------------------------------------

/// A release as seen by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub key: ReleaseKey,
    pub state: ReleaseState,
    /// Optional identity of what is being released (commit, image tag, ...).
    pub source_identity: Option<String>,
    pub comments: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl Release {
    /// Move the release into `to`, stamping `finalized_at` when `to` is
    /// terminal.
    ///
    /// Only `in_progress -> {approved, rejected, cancelled}` is permitted.
    /// Re-entering `in_progress` is a no-op that just touches `updated_at`.
    pub fn transition(&mut self, to: ReleaseState, at: DateTime<Utc>) -> Result<(), StateError> {
        if self.state.is_terminal() {
            return Err(StateError::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
                reason: "release is already finalized".to_string(),
            });
        }
        self.state = to;
        self.updated_at = at;
        if to.is_terminal() {
            self.finalized_at = Some(at);
        }
        Ok(())
    }

    /// Check that `finalized_at` is set if and only if the state is terminal.
    pub fn check_finalization(&self) -> Result<(), StateError> {
        match (self.state.is_terminal(), self.finalized_at.is_some()) {
            (true, true) | (false, false) => Ok(()),
            (true, false) => Err(StateError::FinalizedAtMismatch {
                release: self.key.to_string(),
                state: self.state.to_string(),
                finalized: "unset",
            }),
            (false, true) => Err(StateError::FinalizedAtMismatch {
                release: self.key.to_string(),
                state: self.state.to_string(),
                finalized: "set",
            }),
        }
    }
}

/// Input for release creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRelease {
    pub key: ReleaseKey,
    pub source_identity: Option<String>,
    pub comments: Option<String>,
}

impl NewRelease {
    pub fn new(key: ReleaseKey) -> Self {
        Self {
            key,
            source_identity: None,
            comments: None,
        }
    }

    pub fn with_source_identity(mut self, source_identity: impl Into<String>) -> Self {
        self.source_identity = Some(source_identity.into());
        self
    }

    pub fn with_comments(mut self, comments: impl Into<String>) -> Self {
        self.comments = Some(comments.into());
        self
    }

    /// Materialize the release in its initial state.
    pub fn into_release(self, at: DateTime<Utc>) -> Release {
        Release {
            key: self.key,
            state: ReleaseState::InProgress,
            source_identity: self.source_identity,
            comments: self.comments,
            created_at: at,
            updated_at: at,
            finalized_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release() -> Release {
        NewRelease::new(ReleaseKey::new("org", "app", 1)).into_release(Utc::now())
    }

    #[test]
    fn only_in_progress_is_not_terminal() {
        assert!(!ReleaseState::InProgress.is_terminal());
        assert!(ReleaseState::Approved.is_terminal());
        assert!(ReleaseState::Rejected.is_terminal());
        assert!(ReleaseState::Cancelled.is_terminal());
    }

    #[test]
    fn state_parses_its_own_representation() {
        for state in ReleaseState::ALL {
            assert_eq!(state.as_str().parse::<ReleaseState>(), Ok(state));
        }
        assert!("done".parse::<ReleaseState>().is_err());
    }

    #[test]
    fn state_serializes_snake_case() {
        let json = serde_json::to_string(&ReleaseState::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn transition_to_terminal_sets_finalized_at() {
        let mut r = release();
        let at = Utc::now();
        r.transition(ReleaseState::Approved, at).unwrap();
        assert_eq!(r.state, ReleaseState::Approved);
        assert_eq!(r.finalized_at, Some(at));
        r.check_finalization().unwrap();
    }

    #[test]
    fn terminal_state_cannot_be_left() {
        let mut r = release();
        r.transition(ReleaseState::Cancelled, Utc::now()).unwrap();
        let err = r.transition(ReleaseState::Approved, Utc::now()).unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
        assert_eq!(r.state, ReleaseState::Cancelled);
    }

    #[test]
    fn finalization_mismatch_detected() {
        let mut r = release();
        r.finalized_at = Some(Utc::now());
        assert!(r.check_finalization().is_err());

        let mut r = release();
        r.state = ReleaseState::Rejected;
        assert!(r.check_finalization().is_err());
    }
}
