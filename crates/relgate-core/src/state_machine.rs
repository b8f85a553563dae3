//! # Release State Machine
//!
//! Combines per-rule results, weighted by binding mode, into release states.
//!
//! ## Transition rule
//!
//! Rules are visited in evaluation order. After each rule:
//!
//! | Rule result | Binding mode | Last rule? | Release state | `ignored_error` |
//! |-------------|--------------|------------|---------------|-----------------|
//! | success | any | yes | approved | false |
//! | success | any | no | in_progress | false |
//! | failure | permissive | yes | approved | true |
//! | failure | permissive | no | in_progress | true |
//! | failure | enforcing | any | rejected | false |
//!
//! A rejected result short-circuits the pass. A rule that cannot be decided
//! yet ([`Verdict::Pending`]) ends the pass without a state change.

use serde::{Deserialize, Serialize};

use crate::binding::BindingMode;
use crate::release::ReleaseState;

/// Result of evaluating one rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Fail,
    /// Not decidable yet (schedule window closed, sign-off outstanding).
    Pending,
}

impl Verdict {
    pub fn from_success(success: bool) -> Self {
        if success {
            Self::Pass
        } else {
            Self::Fail
        }
    }
}

/// Release state recorded on a rule-processed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleResolution {
    pub state: ReleaseState,
    pub ignored_error: bool,
}

/// Release state after a decided rule.
pub fn resolve_rule(success: bool, mode: BindingMode, is_last: bool) -> RuleResolution {
    match (success, mode) {
        (false, BindingMode::Enforcing) => RuleResolution {
            state: ReleaseState::Rejected,
            ignored_error: false,
        },
        (success, BindingMode::Enforcing | BindingMode::Permissive) => RuleResolution {
            state: if is_last {
                ReleaseState::Approved
            } else {
                ReleaseState::InProgress
            },
            ignored_error: !success,
        },
    }
}

/// Reduce an ordered list of per-rule verdicts to a release state.
///
/// The first enforcing failure wins; otherwise any pending rule keeps the
/// release in progress; otherwise it is approved. An empty list approves.
pub fn aggregate(verdicts: &[(BindingMode, Verdict)]) -> ReleaseState {
    let mut pending = false;
    for (mode, verdict) in verdicts {
        match (verdict, mode) {
            (Verdict::Fail, BindingMode::Enforcing) => return ReleaseState::Rejected,
            (Verdict::Pending, _) => pending = true,
            (Verdict::Pass, _) | (Verdict::Fail, BindingMode::Permissive) => {}
        }
    }
    if pending {
        ReleaseState::InProgress
    } else {
        ReleaseState::Approved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_on_last_rule_approves() {
        let r = resolve_rule(true, BindingMode::Enforcing, true);
        assert_eq!(r.state, ReleaseState::Approved);
        assert!(!r.ignored_error);
    }

    #[test]
    fn success_before_last_rule_stays_in_progress() {
        let r = resolve_rule(true, BindingMode::Permissive, false);
        assert_eq!(r.state, ReleaseState::InProgress);
        assert!(!r.ignored_error);
    }

    #[test]
    fn enforcing_failure_rejects_without_ignoring() {
        for is_last in [true, false] {
            let r = resolve_rule(false, BindingMode::Enforcing, is_last);
            assert_eq!(r.state, ReleaseState::Rejected);
            assert!(!r.ignored_error);
        }
    }

    #[test]
    fn permissive_failure_is_ignored() {
        let r = resolve_rule(false, BindingMode::Permissive, true);
        assert_eq!(r.state, ReleaseState::Approved);
        assert!(r.ignored_error);

        let r = resolve_rule(false, BindingMode::Permissive, false);
        assert_eq!(r.state, ReleaseState::InProgress);
        assert!(r.ignored_error);
    }

    #[test]
    fn aggregate_first_enforcing_failure_wins_over_pending() {
        let verdicts = [
            (BindingMode::Enforcing, Verdict::Pending),
            (BindingMode::Enforcing, Verdict::Fail),
        ];
        assert_eq!(aggregate(&verdicts), ReleaseState::Rejected);
    }

    #[test]
    fn aggregate_pending_keeps_release_open() {
        let verdicts = [
            (BindingMode::Enforcing, Verdict::Pass),
            (BindingMode::Permissive, Verdict::Pending),
        ];
        assert_eq!(aggregate(&verdicts), ReleaseState::InProgress);
    }

    #[test]
    fn aggregate_tolerates_permissive_failures() {
        let verdicts = [
            (BindingMode::Enforcing, Verdict::Pass),
            (BindingMode::Permissive, Verdict::Fail),
        ];
        assert_eq!(aggregate(&verdicts), ReleaseState::Approved);
        assert_eq!(aggregate(&[]), ReleaseState::Approved);
    }
}
