//! # Approval Rules
//!
//! Rules are a tagged union over three variants, each carrying its own
//! policy parameters:
//!
//! - **HTTP API**: POST the release to an external endpoint; 2xx approves.
//! - **Schedule**: approve while the clock is inside a time window.
//! - **Manual**: approve once enough reviewers have signed off.
//!
//! [`RuleType`] is the explicit discriminant. Code that must cover every
//! variant matches on it (or on [`RuleSpec`]) exhaustively, so adding a
//! variant fails to compile until every consumer handles it.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::binding::BindingMode;
use crate::error::RuleError;
use crate::identity::{RuleId, RulesetVersionKey};
use crate::schedule::ScheduleWindow;

// ---------------------------------------------------------------------------
// RuleType
// ---------------------------------------------------------------------------

/// Discriminant of the rule / outcome tagged unions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    HttpApi,
    Schedule,
    Manual,
}

impl RuleType {
    /// Order in which a pass visits rule types. Manual rules come first so
    /// that a missing sign-off parks the release before any external system
    /// is called.
    pub const EVALUATION_ORDER: [RuleType; 3] = [Self::Manual, Self::Schedule, Self::HttpApi];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HttpApi => "http_api",
            Self::Schedule => "schedule",
            Self::Manual => "manual",
        }
    }

    fn evaluation_rank(&self) -> usize {
        match self {
            Self::Manual => 0,
            Self::Schedule => 1,
            Self::HttpApi => 2,
        }
    }
}

impl std::fmt::Display for RuleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::EVALUATION_ORDER
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown rule type {s:?}"))
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// What an HTTP API rule does after a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    Never,
    RetryOnFail,
}

impl RetryPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::RetryOnFail => "retry_on_fail",
        }
    }
}

impl FromStr for RetryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never" => Ok(Self::Never),
            "retry_on_fail" => Ok(Self::RetryOnFail),
            other => Err(format!("unknown retry policy {other:?}")),
        }
    }
}

/// How many manual sign-offs a manual rule needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy", content = "count")]
pub enum ApprovalPolicy {
    /// Every recorded decision must approve, and there must be at least one.
    All,
    /// At least this many approvals.
    Minimum(u32),
}

impl ApprovalPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Minimum(_) => "minimum",
        }
    }
}

// ---------------------------------------------------------------------------
// Rule variants
// ---------------------------------------------------------------------------

/// Calls an external HTTP endpoint with the release description.
///
/// Custom `Debug` redacts `password`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpApiRule {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// PEM-encoded CA certificate trusted in addition to the system roots.
    pub tls_ca_certificate: Option<String>,
    pub retry_policy: RetryPolicy,
    /// Number of retries after the first attempt. Ignored for `never`.
    pub retry_limit: u32,
}

impl std::fmt::Debug for HttpApiRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpApiRule")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("tls_ca_certificate", &self.tls_ca_certificate.is_some())
            .field("retry_policy", &self.retry_policy)
            .field("retry_limit", &self.retry_limit)
            .finish()
    }
}

impl HttpApiRule {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            tls_ca_certificate: None,
            retry_policy: RetryPolicy::Never,
            retry_limit: 0,
        }
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_tls_ca_certificate(mut self, pem: impl Into<String>) -> Self {
        self.tls_ca_certificate = Some(pem.into());
        self
    }

    pub fn with_retry_on_fail(mut self, retry_limit: u32) -> Self {
        self.retry_policy = RetryPolicy::RetryOnFail;
        self.retry_limit = retry_limit;
        self
    }

    /// Total number of calls the evaluator may make for this rule.
    pub fn max_attempts(&self) -> u32 {
        match self.retry_policy {
            RetryPolicy::Never => 1,
            RetryPolicy::RetryOnFail => 1 + self.retry_limit,
        }
    }

    fn validate(&self) -> Result<(), RuleError> {
        url::Url::parse(&self.url).map_err(|e| RuleError::InvalidUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        if self.retry_policy == RetryPolicy::RetryOnFail && self.retry_limit == 0 {
            return Err(RuleError::MissingRetryLimit);
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(RuleError::PasswordWithoutUsername);
        }
        Ok(())
    }
}

/// Approves while the evaluation time falls inside every configured filter.
///
/// Filters are kept in their textual form; [`ScheduleRule::window`] parses
/// them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRule {
    pub begin_time: Option<String>,
    pub end_time: Option<String>,
    pub days_of_week: Option<String>,
    pub days_of_month: Option<String>,
    pub months_of_year: Option<String>,
}

impl ScheduleRule {
    /// A rule with no filters, i.e. always open.
    pub fn always_open() -> Self {
        Self::default()
    }

    pub fn with_time_range(mut self, begin: impl Into<String>, end: impl Into<String>) -> Self {
        self.begin_time = Some(begin.into());
        self.end_time = Some(end.into());
        self
    }

    pub fn with_days_of_week(mut self, days: impl Into<String>) -> Self {
        self.days_of_week = Some(days.into());
        self
    }

    pub fn with_days_of_month(mut self, days: impl Into<String>) -> Self {
        self.days_of_month = Some(days.into());
        self
    }

    pub fn with_months_of_year(mut self, months: impl Into<String>) -> Self {
        self.months_of_year = Some(months.into());
        self
    }

    /// Parse the textual filters into an evaluable window.
    pub fn window(&self) -> Result<ScheduleWindow, crate::error::ScheduleError> {
        ScheduleWindow::parse(self)
    }
}

/// Waits for reviewer sign-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualRule {
    pub approval_policy: ApprovalPolicy,
}

// ---------------------------------------------------------------------------
// RuleSpec / ApprovalRule
// ---------------------------------------------------------------------------

/// Variant-specific rule configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleSpec {
    HttpApi(HttpApiRule),
    Schedule(ScheduleRule),
    Manual(ManualRule),
}

impl RuleSpec {
    pub fn rule_type(&self) -> RuleType {
        match self {
            Self::HttpApi(_) => RuleType::HttpApi,
            Self::Schedule(_) => RuleType::Schedule,
            Self::Manual(_) => RuleType::Manual,
        }
    }

    /// Reject configurations the evaluator could not act on.
    pub fn validate(&self) -> Result<(), RuleError> {
        match self {
            Self::HttpApi(rule) => rule.validate(),
            Self::Schedule(rule) => rule.window().map(|_| ()).map_err(RuleError::from),
            Self::Manual(rule) => match rule.approval_policy {
                ApprovalPolicy::Minimum(0) => Err(RuleError::ZeroMinimum),
                ApprovalPolicy::All | ApprovalPolicy::Minimum(_) => Ok(()),
            },
        }
    }
}

/// A stored approval rule belonging to one ruleset version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub id: RuleId,
    pub version: RulesetVersionKey,
    pub enabled: bool,
    pub spec: RuleSpec,
    pub created_at: DateTime<Utc>,
}

impl ApprovalRule {
    pub fn rule_type(&self) -> RuleType {
        self.spec.rule_type()
    }
}

/// Rule input for catalog writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewApprovalRule {
    pub enabled: bool,
    pub spec: RuleSpec,
}

impl NewApprovalRule {
    pub fn enabled(spec: RuleSpec) -> Self {
        Self { enabled: true, spec }
    }

    pub fn disabled(spec: RuleSpec) -> Self {
        Self {
            enabled: false,
            spec,
        }
    }
}

// ---------------------------------------------------------------------------
// BoundRule
// ---------------------------------------------------------------------------

/// A rule reached through one of a release's bindings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundRule {
    pub rule: ApprovalRule,
    pub mode: BindingMode,
    /// Position of the binding within the release's binding list.
    pub binding_index: usize,
}

/// Drop disabled rules and sort the rest into evaluation order: by rule type
/// (manual, schedule, HTTP API), then binding position, then rule id.
pub fn evaluation_order(mut rules: Vec<BoundRule>) -> Vec<BoundRule> {
    rules.retain(|bound| bound.rule.enabled);
    rules.sort_by_key(|bound| {
        (
            bound.rule.rule_type().evaluation_rank(),
            bound.binding_index,
            bound.rule.id,
        )
    });
    rules
}
