//! # Storage
//!
//! The engine reaches all persistent state through the [`Store`] trait. Two
//! implementations exist:
//!
//! - [`PgStore`]: PostgreSQL via sqlx. Row locks with `SKIP LOCKED` for
//!   claiming, session-scoped advisory locks for per-release exclusion, and
//!   one transaction per audit write.
//! - [`MemoryStore`]: a process-local store with the same semantics, used
//!   by tests and single-process setups.
//!
//! Write operations that touch a release take the release row lock first
//! and refuse to act on a terminal release, so an externally cancelled
//! release is never overwritten by a pass that was already in flight.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relgate_core::{
    ApprovalRule, BoundRule, EventId, ManualDecision, NewApprovalRule, NewManualDecision,
    NewRelease, NewRulesetBinding, Release, ReleaseEvent, ReleaseKey, ReleaseState, RuleEvaluation,
    RuleId, RuleOutcome, RuleResolution, RulesetBinding, RulesetVersionKey,
};

use crate::error::EngineError;
use crate::queue::{ClaimedJob, LockSubIdPolicy, ReleaseBackgroundJob};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// A decided rule together with the release state it leads to.
#[derive(Debug, Clone)]
pub struct RuleProcessedWrite {
    pub release: ReleaseKey,
    pub evaluation: RuleEvaluation,
    pub resolution: RuleResolution,
    pub at: DateTime<Utc>,
}

/// Result of an audit write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Event and outcome appended; the release moved to the resolution's
    /// state if it is terminal.
    Recorded(EventId),
    /// An outcome for this rule already exists. Nothing was written.
    AlreadyRecorded,
    /// The release was already terminal. Nothing was written.
    ReleaseFinalized(ReleaseState),
}

/// Result of a finalization attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Finalized,
    AlreadyFinal(ReleaseState),
}

#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    // -- creation ------------------------------------------------------------

    /// Insert a release in `in_progress` with its binding snapshot, its
    /// `Created` event and its background job, atomically.
    async fn create_release(
        &self,
        release: NewRelease,
        bindings: Vec<NewRulesetBinding>,
        lock_sub_ids: &LockSubIdPolicy,
        at: DateTime<Utc>,
    ) -> Result<(Release, ReleaseBackgroundJob), EngineError>;

    /// Insert the background job of an existing release.
    async fn create_background_job(
        &self,
        release: &ReleaseKey,
        lock_sub_ids: &LockSubIdPolicy,
        at: DateTime<Utc>,
    ) -> Result<ReleaseBackgroundJob, EngineError>;

    /// Add rules to a ruleset version's catalog.
    async fn insert_rules(
        &self,
        version: RulesetVersionKey,
        rules: Vec<NewApprovalRule>,
        at: DateTime<Utc>,
    ) -> Result<Vec<ApprovalRule>, EngineError>;

    // -- reads ---------------------------------------------------------------

    async fn release(&self, key: &ReleaseKey) -> Result<Option<Release>, EngineError>;

    async fn release_state(&self, key: &ReleaseKey) -> Result<Option<ReleaseState>, EngineError> {
        Ok(self.release(key).await?.map(|release| release.state))
    }

    async fn background_job(&self, key: &ReleaseKey) -> Result<Option<ReleaseBackgroundJob>, EngineError>;

    async fn bindings(&self, key: &ReleaseKey) -> Result<Vec<RulesetBinding>, EngineError>;

    /// Every rule reachable through the release's bindings, tagged with the
    /// binding's mode and position. Disabled rules are included.
    async fn bound_rules(&self, key: &ReleaseKey) -> Result<Vec<BoundRule>, EngineError>;

    /// Events in append order.
    async fn events(&self, key: &ReleaseKey) -> Result<Vec<ReleaseEvent>, EngineError>;

    /// Outcomes in append order.
    async fn outcomes(&self, key: &ReleaseKey) -> Result<Vec<RuleOutcome>, EngineError>;

    async fn manual_decisions(
        &self,
        key: &ReleaseKey,
        rule_id: RuleId,
    ) -> Result<Vec<ManualDecision>, EngineError>;

    // -- claim queue ---------------------------------------------------------

    /// Select up to `limit` jobs of in-progress releases, least recently
    /// processed first (never-processed jobs lead, then by creation). No
    /// lock is taken; claim each job with [`Store::try_claim`].
    async fn next_jobs(&self, limit: usize) -> Result<Vec<ReleaseBackgroundJob>, EngineError>;

    /// Take one release's advisory lock and return its job as read under
    /// the lock. `None` when the job does not exist or its lock is held
    /// elsewhere.
    async fn try_claim(&self, key: &ReleaseKey) -> Result<Option<ClaimedJob>, EngineError>;

    /// Stamp the end of a pass on the release's job.
    async fn mark_processed(&self, key: &ReleaseKey, at: DateTime<Utc>) -> Result<(), EngineError>;

    // -- writes --------------------------------------------------------------

    /// Append a rule-processed event and its outcome in one transaction,
    /// finalizing the release when the resolution is terminal.
    async fn record_rule_processed(&self, write: RuleProcessedWrite) -> Result<WriteOutcome, EngineError>;

    /// Move an in-progress release to the terminal `state`.
    async fn finalize_release(
        &self,
        key: &ReleaseKey,
        state: ReleaseState,
        at: DateTime<Utc>,
    ) -> Result<FinalizeOutcome, EngineError>;

    /// Cancel an in-progress release and append its `Cancelled` event.
    async fn cancel_release(&self, key: &ReleaseKey, at: DateTime<Utc>) -> Result<Release, EngineError>;

    /// Store a reviewer decision for a manual rule bound to the release.
    async fn record_manual_decision(
        &self,
        key: &ReleaseKey,
        rule_id: RuleId,
        decision: NewManualDecision,
        at: DateTime<Utc>,
    ) -> Result<ManualDecision, EngineError>;
}
