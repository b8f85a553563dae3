//! # relgate-core: Release Approval Domain Model
//!
//! Types and pure logic shared by every other relgate crate. Nothing in here
//! performs I/O; persistence, HTTP and scheduling live in `relgate-engine`.
//!
//! ## Contents
//!
//! - [`identity`]: release, rule, event and ruleset-version identifiers.
//! - [`release`]: the release record and its four-state lifecycle.
//! - [`binding`]: ruleset bindings and enforcement modes.
//! - [`rule`]: the approval rule tagged union (HTTP API, schedule, manual).
//! - [`schedule`]: schedule filter parsing and window evaluation.
//! - [`manual`]: reviewer decisions and policy tallying.
//! - [`outcome`]: rule outcomes, release events and timelines.
//! - [`state_machine`]: per-rule state resolution and verdict aggregation.
//!
//! ## Crate Policy
//!
//! - No `panic!()` or `.unwrap()` outside tests.
//! - Every tagged union carries an explicit discriminant and is matched
//!   exhaustively; there is no catch-all arm over rule kinds.

pub mod binding;
pub mod error;
pub mod identity;
pub mod manual;
pub mod outcome;
pub mod release;
pub mod rule;
pub mod schedule;
pub mod state_machine;

pub use binding::{BindingMode, NewRulesetBinding, RulesetBinding};
pub use error::{RuleError, ScheduleError, StateError};
pub use identity::{ApplicationId, EventId, OrganizationId, ReleaseKey, RuleId, RulesetVersionKey};
pub use manual::{ManualDecision, NewManualDecision};
pub use outcome::{
    EventKind, HttpResponseRecord, OutcomePayload, ReleaseEvent, RuleEvaluation, RuleOutcome,
    TimelineEntry,
};
pub use release::{NewRelease, Release, ReleaseState};
pub use rule::{
    ApprovalPolicy, ApprovalRule, BoundRule, HttpApiRule, ManualRule, NewApprovalRule,
    RetryPolicy, RuleSpec, RuleType, ScheduleRule,
};
pub use schedule::ScheduleWindow;
pub use state_machine::{RuleResolution, Verdict};
