//! In-memory [`Store`] implementation.
//!
//! A single mutex guards all tables, which makes every operation atomic and
//! plays the role of the release row lock. Advisory locks live in a separate
//! set so that lock guards can release themselves on drop.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relgate_core::{
    ApprovalRule, BoundRule, EventId, EventKind, ManualDecision, NewApprovalRule,
    NewManualDecision, NewRelease, NewRulesetBinding, Release, ReleaseEvent, ReleaseKey,
    ReleaseState, RuleId, RuleOutcome, RuleSpec, RulesetBinding, RulesetVersionKey,
};

use super::{FinalizeOutcome, RuleProcessedWrite, Store, WriteOutcome};
use crate::config::DEFAULT_LOCK_NAMESPACE_BASE;
use crate::error::EngineError;
use crate::queue::{advisory_lock_id, ClaimedJob, JobLock, LockSubIdPolicy, ReleaseBackgroundJob};

#[derive(Debug, Default)]
struct Tables {
    releases: BTreeMap<ReleaseKey, Release>,
    bindings: BTreeMap<ReleaseKey, Vec<RulesetBinding>>,
    rules: BTreeMap<RulesetVersionKey, Vec<ApprovalRule>>,
    jobs: BTreeMap<ReleaseKey, ReleaseBackgroundJob>,
    taken_sub_ids: HashSet<i32>,
    sub_id_sequence: i32,
    events: Vec<ReleaseEvent>,
    outcomes: Vec<(ReleaseKey, RuleOutcome)>,
    decisions: Vec<(ReleaseKey, ManualDecision)>,
    next_event_id: i64,
    next_rule_id: i64,
    /// Rule writes allowed to succeed before the next one fails.
    failing_rule_write: Option<usize>,
}

impl Tables {
    fn append_event(&mut self, release: &ReleaseKey, kind: EventKind, at: DateTime<Utc>) -> EventId {
        self.next_event_id += 1;
        let id = EventId(self.next_event_id);
        self.events.push(ReleaseEvent {
            id,
            release: release.clone(),
            kind,
            created_at: at,
        });
        id
    }

    fn allocate_job(
        &mut self,
        key: &ReleaseKey,
        policy: &LockSubIdPolicy,
        at: DateTime<Utc>,
    ) -> Result<ReleaseBackgroundJob, EngineError> {
        if self.jobs.contains_key(key) {
            return Err(EngineError::AlreadyExists(format!("background job for {key}")));
        }
        let mut candidates = policy.candidates();
        for candidate in candidates.by_ref() {
            let lock_sub_id = match candidate {
                Some(random) => random,
                None => {
                    self.sub_id_sequence += 1;
                    self.sub_id_sequence
                }
            };
            if self.taken_sub_ids.insert(lock_sub_id) {
                let job = ReleaseBackgroundJob {
                    key: key.clone(),
                    lock_sub_id,
                    created_at: at,
                    last_processed_at: None,
                };
                self.jobs.insert(key.clone(), job.clone());
                return Ok(job);
            }
            tracing::debug!(release = %key, lock_sub_id, "lock sub-id taken, retrying");
        }
        Err(EngineError::LockAllocationExhausted {
            tries: candidates.tries(),
        })
    }

    fn release_mut(&mut self, key: &ReleaseKey) -> Result<&mut Release, EngineError> {
        self.releases
            .get_mut(key)
            .ok_or_else(|| EngineError::ReleaseNotFound(key.to_string()))
    }
}

/// Process-local store. Cloning shares the underlying tables.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    locks: Arc<Mutex<HashSet<i64>>>,
    lock_namespace_base: i64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            locks: Arc::new(Mutex::new(HashSet::new())),
            lock_namespace_base: DEFAULT_LOCK_NAMESPACE_BASE,
        }
    }

    pub fn with_lock_namespace_base(mut self, base: i64) -> Self {
        self.lock_namespace_base = base;
        self
    }

    /// Mark lock sub-ids as taken without creating jobs for them.
    pub fn reserve_lock_sub_ids(&self, ids: impl IntoIterator<Item = i32>) {
        self.tables.lock().taken_sub_ids.extend(ids);
    }

    /// Let `successes` further rule writes succeed, then fail the next one
    /// with a database error.
    pub fn fail_rule_write_after(&self, successes: usize) {
        self.tables.lock().failing_rule_write = Some(successes);
    }

    /// Whether the advisory lock for `lock_id` is currently held.
    pub fn is_locked(&self, lock_id: i64) -> bool {
        self.locks.lock().contains(&lock_id)
    }

    fn lock_job(&self, locks: &mut HashSet<i64>, job: &ReleaseBackgroundJob) -> Option<ClaimedJob> {
        let lock_id = job.lock_id(self.lock_namespace_base);
        if !locks.insert(lock_id) {
            return None;
        }
        Some(ClaimedJob {
            job: job.clone(),
            lock: Box::new(MemoryJobLock {
                lock_id,
                locks: Arc::clone(&self.locks),
                held: true,
            }),
        })
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_release(
        &self,
        release: NewRelease,
        bindings: Vec<NewRulesetBinding>,
        lock_sub_ids: &LockSubIdPolicy,
        at: DateTime<Utc>,
    ) -> Result<(Release, ReleaseBackgroundJob), EngineError> {
        let mut guard = self.tables.lock();
        let tables = &mut *guard;
        let key = release.key.clone();
        if tables.releases.contains_key(&key) {
            return Err(EngineError::AlreadyExists(format!("release {key}")));
        }

        // Allocate first so that exhaustion leaves no trace.
        let job = tables.allocate_job(&key, lock_sub_ids, at)?;
        let release = release.into_release(at);
        tables.releases.insert(key.clone(), release.clone());
        tables.bindings.insert(
            key.clone(),
            bindings.into_iter().map(|b| b.bind_to(key.clone())).collect(),
        );
        tables.append_event(&key, EventKind::Created, at);
        Ok((release, job))
    }

    async fn create_background_job(
        &self,
        release: &ReleaseKey,
        lock_sub_ids: &LockSubIdPolicy,
        at: DateTime<Utc>,
    ) -> Result<ReleaseBackgroundJob, EngineError> {
        let mut tables = self.tables.lock();
        if !tables.releases.contains_key(release) {
            return Err(EngineError::ReleaseNotFound(release.to_string()));
        }
        tables.allocate_job(release, lock_sub_ids, at)
    }

    async fn insert_rules(
        &self,
        version: RulesetVersionKey,
        rules: Vec<NewApprovalRule>,
        at: DateTime<Utc>,
    ) -> Result<Vec<ApprovalRule>, EngineError> {
        for rule in &rules {
            rule.spec.validate()?;
        }
        let mut tables = self.tables.lock();
        let mut inserted = Vec::with_capacity(rules.len());
        for rule in rules {
            tables.next_rule_id += 1;
            inserted.push(ApprovalRule {
                id: RuleId(tables.next_rule_id),
                version,
                enabled: rule.enabled,
                spec: rule.spec,
                created_at: at,
            });
        }
        tables
            .rules
            .entry(version)
            .or_default()
            .extend(inserted.iter().cloned());
        Ok(inserted)
    }

    async fn release(&self, key: &ReleaseKey) -> Result<Option<Release>, EngineError> {
        Ok(self.tables.lock().releases.get(key).cloned())
    }

    async fn background_job(&self, key: &ReleaseKey) -> Result<Option<ReleaseBackgroundJob>, EngineError> {
        Ok(self.tables.lock().jobs.get(key).cloned())
    }

    async fn bindings(&self, key: &ReleaseKey) -> Result<Vec<RulesetBinding>, EngineError> {
        Ok(self.tables.lock().bindings.get(key).cloned().unwrap_or_default())
    }

    async fn bound_rules(&self, key: &ReleaseKey) -> Result<Vec<BoundRule>, EngineError> {
        let tables = self.tables.lock();
        let Some(bindings) = tables.bindings.get(key) else {
            return Ok(Vec::new());
        };
        let mut bound = Vec::new();
        for (binding_index, binding) in bindings.iter().enumerate() {
            for rule in tables.rules.get(&binding.version).into_iter().flatten() {
                bound.push(BoundRule {
                    rule: rule.clone(),
                    mode: binding.mode,
                    binding_index,
                });
            }
        }
        Ok(bound)
    }

    async fn events(&self, key: &ReleaseKey) -> Result<Vec<ReleaseEvent>, EngineError> {
        Ok(self
            .tables
            .lock()
            .events
            .iter()
            .filter(|event| &event.release == key)
            .cloned()
            .collect())
    }

    async fn outcomes(&self, key: &ReleaseKey) -> Result<Vec<RuleOutcome>, EngineError> {
        Ok(self
            .tables
            .lock()
            .outcomes
            .iter()
            .filter(|(release, _)| release == key)
            .map(|(_, outcome)| outcome.clone())
            .collect())
    }

    async fn manual_decisions(
        &self,
        key: &ReleaseKey,
        rule_id: RuleId,
    ) -> Result<Vec<ManualDecision>, EngineError> {
        Ok(self
            .tables
            .lock()
            .decisions
            .iter()
            .filter(|(release, decision)| release == key && decision.rule_id == rule_id)
            .map(|(_, decision)| decision.clone())
            .collect())
    }

    async fn next_jobs(&self, limit: usize) -> Result<Vec<ReleaseBackgroundJob>, EngineError> {
        let tables = self.tables.lock();
        let mut jobs: Vec<ReleaseBackgroundJob> = tables
            .jobs
            .values()
            .filter(|job| {
                tables
                    .releases
                    .get(&job.key)
                    .is_some_and(|release| !release.state.is_terminal())
            })
            .cloned()
            .collect();
        // `None` sorts first: never-processed jobs lead.
        jobs.sort_by_key(|job| (job.last_processed_at, job.created_at, job.lock_sub_id));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn try_claim(&self, key: &ReleaseKey) -> Result<Option<ClaimedJob>, EngineError> {
        let tables = self.tables.lock();
        let mut locks = self.locks.lock();
        Ok(tables
            .jobs
            .get(key)
            .and_then(|job| self.lock_job(&mut locks, job)))
    }

    async fn mark_processed(&self, key: &ReleaseKey, at: DateTime<Utc>) -> Result<(), EngineError> {
        if let Some(job) = self.tables.lock().jobs.get_mut(key) {
            job.last_processed_at = Some(at);
        }
        Ok(())
    }

    async fn record_rule_processed(&self, write: RuleProcessedWrite) -> Result<WriteOutcome, EngineError> {
        let mut guard = self.tables.lock();
        let tables = &mut *guard;

        match tables.failing_rule_write {
            Some(0) => {
                tables.failing_rule_write = None;
                return Err(EngineError::Database(sqlx::Error::Protocol(
                    "injected rule write failure".into(),
                )));
            }
            Some(remaining) => tables.failing_rule_write = Some(remaining - 1),
            None => {}
        }

        let state = tables.release_mut(&write.release)?.state;
        if state.is_terminal() {
            return Ok(WriteOutcome::ReleaseFinalized(state));
        }
        let rule_id = write.evaluation.rule_id;
        let exists = tables
            .outcomes
            .iter()
            .any(|(release, outcome)| release == &write.release && outcome.rule_id == rule_id);
        if exists {
            return Ok(WriteOutcome::AlreadyRecorded);
        }

        let event_id = tables.append_event(
            &write.release,
            EventKind::RuleProcessed {
                rule_type: write.evaluation.payload.rule_type(),
                rule_id,
                result_state: write.resolution.state,
                ignored_error: write.resolution.ignored_error,
            },
            write.at,
        );
        tables.outcomes.push((
            write.release.clone(),
            RuleOutcome {
                event_id,
                rule_id,
                success: write.evaluation.success,
                payload: write.evaluation.payload,
                created_at: write.at,
            },
        ));
        tables
            .release_mut(&write.release)?
            .transition(write.resolution.state, write.at)?;
        Ok(WriteOutcome::Recorded(event_id))
    }

    async fn finalize_release(
        &self,
        key: &ReleaseKey,
        state: ReleaseState,
        at: DateTime<Utc>,
    ) -> Result<FinalizeOutcome, EngineError> {
        if !state.is_terminal() {
            return Err(EngineError::InvariantViolation(format!(
                "cannot finalize {key} into non-terminal state {state}"
            )));
        }
        let mut tables = self.tables.lock();
        let release = tables.release_mut(key)?;
        if release.state.is_terminal() {
            return Ok(FinalizeOutcome::AlreadyFinal(release.state));
        }
        release.transition(state, at)?;
        Ok(FinalizeOutcome::Finalized)
    }

    async fn cancel_release(&self, key: &ReleaseKey, at: DateTime<Utc>) -> Result<Release, EngineError> {
        let mut guard = self.tables.lock();
        let tables = &mut *guard;
        let release = tables.release_mut(key)?;
        release.transition(ReleaseState::Cancelled, at)?;
        let release = release.clone();
        tables.append_event(key, EventKind::Cancelled, at);
        Ok(release)
    }

    async fn record_manual_decision(
        &self,
        key: &ReleaseKey,
        rule_id: RuleId,
        decision: NewManualDecision,
        at: DateTime<Utc>,
    ) -> Result<ManualDecision, EngineError> {
        let mut guard = self.tables.lock();
        let tables = &mut *guard;
        let state = tables.release_mut(key)?.state;
        if state.is_terminal() {
            return Err(EngineError::InvalidDecision(format!(
                "release {key} is already {state}"
            )));
        }

        let bound_manual = tables.bindings.get(key).into_iter().flatten().any(|binding| {
            tables
                .rules
                .get(&binding.version)
                .into_iter()
                .flatten()
                .any(|rule| rule.id == rule_id && matches!(rule.spec, RuleSpec::Manual(_)))
        });
        if !bound_manual {
            return Err(EngineError::InvalidDecision(format!(
                "{rule_id} is not a manual rule bound to release {key}"
            )));
        }

        let duplicate = tables.decisions.iter().any(|(release, existing)| {
            release == key && existing.rule_id == rule_id && existing.reviewer == decision.reviewer
        });
        if duplicate {
            return Err(EngineError::AlreadyExists(format!(
                "decision by {} on {rule_id}",
                decision.reviewer
            )));
        }

        let recorded = ManualDecision {
            rule_id,
            reviewer: decision.reviewer,
            approved: decision.approved,
            comments: decision.comments,
            decided_at: at,
        };
        tables.decisions.push((key.clone(), recorded.clone()));
        Ok(recorded)
    }
}

// ---------------------------------------------------------------------------
// MemoryJobLock
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct MemoryJobLock {
    lock_id: i64,
    locks: Arc<Mutex<HashSet<i64>>>,
    held: bool,
}

impl MemoryJobLock {
    fn unlock(&mut self) {
        if self.held {
            self.locks.lock().remove(&self.lock_id);
            self.held = false;
        }
    }
}

impl Drop for MemoryJobLock {
    fn drop(&mut self) {
        self.unlock();
    }
}

#[async_trait]
impl JobLock for MemoryJobLock {
    fn lock_id(&self) -> i64 {
        self.lock_id
    }

    async fn release(mut self: Box<Self>) -> Result<(), EngineError> {
        self.unlock();
        Ok(())
    }
}
