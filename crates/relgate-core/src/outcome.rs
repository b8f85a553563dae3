//! # Rule Outcomes and Release Events
//!
//! The audit trail of a release: an append-only list of events, where each
//! rule-processed event owns exactly one outcome describing why the rule
//! passed or failed. Both are tagged unions keyed by an explicit `kind`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{EventId, ReleaseKey, RuleId};
use crate::release::ReleaseState;
use crate::rule::RuleType;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What the HTTP API rule's endpoint answered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponseRecord {
    /// `None` when no response was received (timeout, connection failure).
    pub response_code: Option<u16>,
    pub content_type: String,
    /// Possibly truncated response body.
    pub body: Vec<u8>,
    /// Transport error of the final attempt, if any.
    pub error: Option<String>,
    /// Number of calls made, including retries.
    pub attempts: u32,
}

impl HttpResponseRecord {
    /// A 2xx response whose body was read in full. A body that broke off
    /// mid-stream fails the call even when the status was 2xx.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.response_code.is_some_and(|code| (200..300).contains(&code))
    }
}

/// Variant-specific outcome payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutcomePayload {
    HttpApi(HttpResponseRecord),
    Schedule,
    Manual { comments: Option<String> },
}

impl OutcomePayload {
    pub fn rule_type(&self) -> RuleType {
        match self {
            Self::HttpApi(_) => RuleType::HttpApi,
            Self::Schedule => RuleType::Schedule,
            Self::Manual { .. } => RuleType::Manual,
        }
    }
}

/// A decided rule, before it is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleEvaluation {
    pub rule_id: RuleId,
    pub success: bool,
    pub payload: OutcomePayload,
}

/// A persisted rule outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleOutcome {
    pub event_id: EventId,
    pub rule_id: RuleId,
    pub success: bool,
    pub payload: OutcomePayload,
    pub created_at: DateTime<Utc>,
}

impl RuleOutcome {
    pub fn rule_type(&self) -> RuleType {
        self.payload.rule_type()
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Event variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Cancelled,
    RuleProcessed {
        rule_type: RuleType,
        rule_id: RuleId,
        /// Release state computed after this rule.
        result_state: ReleaseState,
        /// A failure was tolerated because the binding is permissive.
        ignored_error: bool,
    },
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Cancelled => "cancelled",
            Self::RuleProcessed { .. } => "rule_processed",
        }
    }
}

/// An entry of a release's audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseEvent {
    pub id: EventId,
    pub release: ReleaseKey,
    pub kind: EventKind,
    pub created_at: DateTime<Utc>,
}

/// An event joined with its outcome, for timeline views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub event: ReleaseEvent,
    pub outcome: Option<RuleOutcome>,
}

/// Join events with their outcomes, preserving event order.
pub fn build_timeline(events: Vec<ReleaseEvent>, outcomes: Vec<RuleOutcome>) -> Vec<TimelineEntry> {
    let mut by_event: std::collections::HashMap<EventId, RuleOutcome> =
        outcomes.into_iter().map(|o| (o.event_id, o)).collect();
    events
        .into_iter()
        .map(|event| {
            let outcome = by_event.remove(&event.id);
            TimelineEntry { event, outcome }
        })
        .collect()
}
