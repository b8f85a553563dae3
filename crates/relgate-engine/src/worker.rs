//! Polling worker.
//!
//! Sweeps the job queue on a fixed interval: selects a batch of jobs whose
//! releases are still in progress, least recently processed first, then
//! claims each one right before its pass and releases the claim as soon as
//! the pass ends. The first sweep runs immediately on start, so jobs left
//! over from a crash are picked up without waiting a full interval.

use std::future::Future;

use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::processor::PassOutcome;

/// Tally of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    /// Jobs claimed and processed by this sweep.
    pub claimed: usize,
    /// Selected jobs that another worker held or had processed since
    /// selection.
    pub contended: usize,
    pub finalized: usize,
    pub waiting: usize,
    pub skipped: usize,
    pub superseded: usize,
    pub failed: usize,
}

impl SweepSummary {
    fn record(&mut self, outcome: &PassOutcome) {
        match outcome {
            PassOutcome::Finalized { .. } => self.finalized += 1,
            PassOutcome::Waiting { .. } => self.waiting += 1,
            PassOutcome::Skipped { .. } => self.skipped += 1,
            PassOutcome::Superseded => self.superseded += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Worker {
    engine: Engine,
}

impl Worker {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// Select one batch of jobs and process them in order, holding one
    /// job lock at a time.
    ///
    /// A failed pass is logged and counted; its job stays queued for the
    /// next sweep.
    pub async fn process_pending_once(&self) -> Result<SweepSummary, EngineError> {
        let batch = self.engine.config().claim_batch_size;
        let selected = self.engine.store().next_jobs(batch).await?;
        let mut summary = SweepSummary::default();

        for job in selected {
            let claim = match self.engine.store().try_claim(&job.key).await {
                Ok(Some(claim)) => claim,
                Ok(None) => {
                    summary.contended += 1;
                    self.engine.metrics().lock_contended();
                    continue;
                }
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!(release = %job.key, "claiming job failed: {e}");
                    continue;
                }
            };
            if claim.job.last_processed_at != job.last_processed_at {
                tracing::debug!(release = %job.key, "job processed elsewhere since selection");
                summary.contended += 1;
                if let Err(e) = claim.lock.release().await {
                    tracing::warn!(release = %job.key, "failed to release job lock: {e}");
                }
                continue;
            }

            summary.claimed += 1;
            match self.engine.process_claimed(claim).await {
                Ok(report) => {
                    tracing::debug!(release = %job.key, outcome = report.outcome.as_str(), "pass complete");
                    summary.record(&report.outcome);
                }
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!(release = %job.key, transient = e.is_transient(), "release pass failed: {e}");
                }
            }
        }
        Ok(summary)
    }

    /// Sweep every poll interval until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut tick = interval(self.engine.config().poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        tracing::info!(
            poll_interval = ?self.engine.config().poll_interval,
            claim_batch_size = self.engine.config().claim_batch_size,
            "worker started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("worker shutting down");
                    return;
                }
                _ = tick.tick() => {
                    match self.process_pending_once().await {
                        Ok(summary) if summary.claimed + summary.contended > 0 => {
                            let counters = self.engine.metrics().snapshot();
                            tracing::info!(
                                claimed = summary.claimed,
                                contended = summary.contended,
                                finalized = summary.finalized,
                                waiting = summary.waiting,
                                skipped = summary.skipped,
                                superseded = summary.superseded,
                                failed = summary.failed,
                                total_passes = counters.passes,
                                total_rules_processed = counters.rules_processed,
                                "sweep complete"
                            );
                        }
                        Ok(_) => tracing::debug!("sweep found no claimable jobs"),
                        Err(e) => tracing::error!("sweep failed: {e}"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use relgate_core::{
        BindingMode, NewApprovalRule, NewRelease, NewRulesetBinding, ReleaseKey, ReleaseState,
        RuleSpec, RulesetVersionKey, ScheduleRule,
    };

    use crate::config::EngineConfig;
    use crate::store::{MemoryStore, Store};

    async fn engine_with_releases(count: i64, config: EngineConfig) -> (Engine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(store.clone(), config).unwrap();
        let version = RulesetVersionKey::new(1, 0);
        engine
            .insert_rules(
                version,
                vec![NewApprovalRule::enabled(RuleSpec::Schedule(ScheduleRule::always_open()))],
            )
            .await
            .unwrap();
        for id in 1..=count {
            engine
                .create_release(
                    NewRelease::new(ReleaseKey::new("acme", "api", id)),
                    vec![NewRulesetBinding::new("main", version, BindingMode::Enforcing)],
                )
                .await
                .unwrap();
        }
        (engine, store)
    }

    #[tokio::test]
    async fn sweep_processes_a_batch() {
        let (engine, store) = engine_with_releases(3, EngineConfig::default().with_claim_batch_size(2)).await;
        let worker = Worker::new(engine);

        let first = worker.process_pending_once().await.unwrap();
        assert_eq!(first.claimed, 2);
        assert_eq!(first.finalized, 2);

        let second = worker.process_pending_once().await.unwrap();
        assert_eq!(second.claimed, 1);

        let third = worker.process_pending_once().await.unwrap();
        assert_eq!(third, SweepSummary::default());

        for id in 1..=3 {
            let state = store.release_state(&ReleaseKey::new("acme", "api", id)).await.unwrap();
            assert_eq!(state, Some(ReleaseState::Approved));
        }
    }

    #[tokio::test]
    async fn failed_pass_is_counted_and_retried() {
        let (engine, store) = engine_with_releases(1, EngineConfig::default()).await;
        let worker = Worker::new(engine);

        store.fail_rule_write_after(0);
        let summary = worker.process_pending_once().await.unwrap();
        assert_eq!(summary.failed, 1);

        let summary = worker.process_pending_once().await.unwrap();
        assert_eq!(summary.finalized, 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (engine, store) = engine_with_releases(
            1,
            EngineConfig::default().with_poll_interval(Duration::from_millis(10)),
        )
        .await;
        let worker = Worker::new(engine);

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            worker
                .run(async {
                    let _ = rx.await;
                })
                .await
        });

        for _ in 0..100 {
            let state = store.release_state(&ReleaseKey::new("acme", "api", 1)).await.unwrap();
            if state == Some(ReleaseState::Approved) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(()).unwrap();
        handle.await.unwrap();
        let state = store.release_state(&ReleaseKey::new("acme", "api", 1)).await.unwrap();
        assert_eq!(state, Some(ReleaseState::Approved));
    }
}
