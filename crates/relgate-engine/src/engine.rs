//! # Engine Context
//!
//! [`Engine`] bundles the store, rule evaluator, clock, configuration and
//! counters behind one cheaply clonable handle. Every public operation of
//! the processing engine is a method on it.
//!
//! ## Processing entry points
//!
//! - [`Engine::process_claimed`]: run one pass over a job this worker has
//!   claimed, then release the claim.
//! - [`Engine::process_in_background`]: claim a single release and process
//!   it on a spawned task, retrying failed passes with backoff.
//! - [`Worker`](crate::Worker): periodic sweeps over all claimable jobs.

use std::sync::Arc;

use relgate_core::outcome::build_timeline;
use relgate_core::{
    ApprovalRule, ManualDecision, NewApprovalRule, NewManualDecision, NewRelease,
    NewRulesetBinding, Release, ReleaseEvent, ReleaseKey, RuleId, RuleOutcome, RulesetVersionKey,
    TimelineEntry,
};
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::evaluator::RuleEvaluator;
use crate::metrics::EngineMetrics;
use crate::processor::{PassReport, Processor};
use crate::queue::{ClaimedJob, ReleaseBackgroundJob};
use crate::store::Store;

#[derive(Debug)]
struct EngineInner {
    store: Arc<dyn Store>,
    evaluator: RuleEvaluator,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    metrics: EngineMetrics,
}

/// Shared handle to the processing engine.
#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn Store>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let evaluator = RuleEvaluator::new(Arc::clone(&store), &config)?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                store,
                evaluator,
                clock,
                config,
                metrics: EngineMetrics::new(),
            }),
        })
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.inner.metrics
    }

    // -- catalog and releases ------------------------------------------------

    pub async fn insert_rules(
        &self,
        version: RulesetVersionKey,
        rules: Vec<NewApprovalRule>,
    ) -> Result<Vec<ApprovalRule>, EngineError> {
        self.inner.store.insert_rules(version, rules, self.inner.clock.now()).await
    }

    /// Create a release with its binding snapshot and background job.
    pub async fn create_release(
        &self,
        release: NewRelease,
        bindings: Vec<NewRulesetBinding>,
    ) -> Result<(Release, ReleaseBackgroundJob), EngineError> {
        let created = self
            .inner
            .store
            .create_release(release, bindings, &self.inner.config.lock_sub_ids, self.inner.clock.now())
            .await?;
        tracing::info!(release = %created.0.key, lock_sub_id = created.1.lock_sub_id, "release created");
        Ok(created)
    }

    /// Create the background job of an existing release.
    ///
    /// The first attempt takes the next sequence value; on a lock sub-id
    /// collision further attempts use random values. Fails with
    /// [`EngineError::LockAllocationExhausted`] once the configured number
    /// of tries is used up.
    pub async fn create_release_background_job(&self, key: &ReleaseKey) -> Result<ReleaseBackgroundJob, EngineError> {
        self.inner
            .store
            .create_background_job(key, &self.inner.config.lock_sub_ids, self.inner.clock.now())
            .await
    }

    pub async fn release(&self, key: &ReleaseKey) -> Result<Option<Release>, EngineError> {
        self.inner.store.release(key).await
    }

    pub async fn cancel_release(&self, key: &ReleaseKey) -> Result<Release, EngineError> {
        let release = self.inner.store.cancel_release(key, self.inner.clock.now()).await?;
        tracing::info!(release = %key, "release cancelled");
        Ok(release)
    }

    pub async fn record_manual_decision(
        &self,
        key: &ReleaseKey,
        rule_id: RuleId,
        decision: NewManualDecision,
    ) -> Result<ManualDecision, EngineError> {
        let decision = self
            .inner
            .store
            .record_manual_decision(key, rule_id, decision, self.inner.clock.now())
            .await?;
        tracing::info!(
            release = %key,
            rule_id = rule_id.0,
            reviewer = %decision.reviewer,
            approved = decision.approved,
            "manual decision recorded"
        );
        Ok(decision)
    }

    // -- audit trail ---------------------------------------------------------

    pub async fn events(&self, key: &ReleaseKey) -> Result<Vec<ReleaseEvent>, EngineError> {
        self.inner.store.events(key).await
    }

    pub async fn outcomes(&self, key: &ReleaseKey) -> Result<Vec<RuleOutcome>, EngineError> {
        self.inner.store.outcomes(key).await
    }

    /// Events paired with their outcomes, in creation order.
    pub async fn timeline(&self, key: &ReleaseKey) -> Result<Vec<TimelineEntry>, EngineError> {
        let events = self.inner.store.events(key).await?;
        let outcomes = self.inner.store.outcomes(key).await?;
        Ok(build_timeline(events, outcomes))
    }

    // -- processing ----------------------------------------------------------

    /// Run one pass over `key`.
    ///
    /// The caller must hold the release's job lock; use
    /// [`Engine::process_claimed`] unless the lock is managed elsewhere.
    pub async fn process_release(&self, key: &ReleaseKey) -> Result<PassReport, EngineError> {
        let inner = &*self.inner;
        Processor {
            store: inner.store.as_ref(),
            evaluator: &inner.evaluator,
            clock: inner.clock.as_ref(),
            metrics: &inner.metrics,
            max_wait: inner.config.max_wait,
        }
        .run(key)
        .await
    }

    /// Process a claimed job, stamp it as processed and release its lock.
    ///
    /// The stamp is written whether or not the pass succeeded, so a release
    /// that keeps waiting or failing moves behind the rest of the queue.
    pub async fn process_claimed(&self, claimed: ClaimedJob) -> Result<PassReport, EngineError> {
        let ClaimedJob { job, lock } = claimed;
        let result = self.process_release(&job.key).await;
        if let Err(e) = self.inner.store.mark_processed(&job.key, self.inner.clock.now()).await {
            tracing::warn!(release = %job.key, "failed to stamp job as processed: {e}");
        }
        let lock_id = lock.lock_id();
        if let Err(e) = lock.release().await {
            tracing::warn!(release = %job.key, lock_id, "failed to release job lock: {e}");
        }
        result
    }

    /// Claim and process one release on a background task.
    ///
    /// If the release's lock is held elsewhere the task exits quietly: the
    /// holder is already processing it. Failed passes are retried with
    /// exponential backoff until the configured attempt limit; errors that
    /// cannot succeed on retry stop the task immediately.
    pub fn process_in_background(&self, key: ReleaseKey) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let backoff = engine.inner.config.background_backoff;
            let max_attempts = engine.inner.config.background_max_attempts;

            for attempt in 0..max_attempts {
                let result = match engine.inner.store.try_claim(&key).await {
                    Ok(Some(claimed)) => engine.process_claimed(claimed).await.map(|_| ()),
                    Ok(None) => {
                        engine.inner.metrics.lock_contended();
                        tracing::debug!(release = %key, "release locked by another worker");
                        return;
                    }
                    Err(e) => Err(e),
                };

                let e = match result {
                    Ok(()) => return,
                    Err(e) => e,
                };
                if !e.is_transient() {
                    tracing::error!(release = %key, "background processing failed: {e}");
                    return;
                }
                let delay = backoff.delay(attempt);
                tracing::warn!(
                    release = %key,
                    attempt = attempt + 1,
                    max_attempts,
                    "background processing failed, retrying in {delay:?}: {e}"
                );
                tokio::time::sleep(delay).await;
            }
            tracing::error!(release = %key, max_attempts, "background processing gave up");
        })
    }
}
