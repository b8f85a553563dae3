//! # Release Pass
//!
//! One pass over one release, run by whoever holds the release's job lock.
//!
//! ## Algorithm
//!
//! 1. Load the release. A terminal release is left alone.
//! 2. Order the enabled bound rules (manual, schedule, HTTP API; then by
//!    binding position and rule id).
//! 3. Walk the rules. A rule that already has an outcome contributes its
//!    recorded verdict without being re-evaluated. Otherwise it is
//!    evaluated and its event and outcome are written in one transaction,
//!    moving the release to `approved` or `rejected` when the rule settles
//!    it. An enforcing failure stops the walk.
//! 4. If the walk ended without a terminal write (everything was reused),
//!    aggregate the verdicts and finalize.
//!
//! Undecided rules (closed schedule window, missing sign-offs) end the pass
//! without writing anything; the job stays queued. Once the release has
//! waited longer than `max_wait`, the undecided rule is recorded as failed.
//!
//! Every write re-checks the release under its row lock, so a release that
//! is cancelled mid-pass is never overwritten, and a concurrent pass that
//! already recorded a rule makes this one stand down.

use std::collections::HashMap;
use std::time::Duration;

use relgate_core::rule::evaluation_order;
use relgate_core::state_machine::{aggregate, resolve_rule};
use relgate_core::{
    BindingMode, ReleaseKey, ReleaseState, RuleEvaluation, RuleId, RuleType, Verdict,
};
use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::EngineError;
use crate::evaluator::{RuleCheck, RuleEvaluator};
use crate::metrics::EngineMetrics;
use crate::store::{FinalizeOutcome, RuleProcessedWrite, Store, WriteOutcome};

/// How a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PassOutcome {
    /// This pass moved the release into a terminal state.
    Finalized { state: ReleaseState },
    /// A rule is not decidable yet; the release stays in progress.
    Waiting { rule_id: RuleId, rule_type: RuleType },
    /// The release was already terminal, or became terminal mid-pass.
    Skipped { state: ReleaseState },
    /// Another pass recorded the same rule first.
    Superseded,
}

impl PassOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Finalized { .. } => "finalized",
            Self::Waiting { .. } => "waiting",
            Self::Skipped { .. } => "skipped",
            Self::Superseded => "superseded",
        }
    }
}

/// Summary of one pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub release: ReleaseKey,
    pub pass_id: Uuid,
    pub outcome: PassOutcome,
    /// Rules evaluated and recorded by this pass.
    pub evaluated: u32,
    /// Rules whose earlier outcome was reused.
    pub reused: u32,
}

pub(crate) struct Processor<'a> {
    pub store: &'a dyn Store,
    pub evaluator: &'a RuleEvaluator,
    pub clock: &'a dyn Clock,
    pub metrics: &'a EngineMetrics,
    pub max_wait: Duration,
}

struct PassState {
    evaluated: u32,
    reused: u32,
}

impl Processor<'_> {
    pub async fn run(&self, key: &ReleaseKey) -> Result<PassReport, EngineError> {
        let pass_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "release_pass",
            organization_id = %key.organization_id,
            application_id = %key.application_id,
            release_id = key.release_id,
            %pass_id,
        );
        self.metrics.pass_started();
        let mut state = PassState {
            evaluated: 0,
            reused: 0,
        };
        let outcome = self.walk(key, &mut state).instrument(span).await;
        match outcome {
            Ok(outcome) => Ok(PassReport {
                release: key.clone(),
                pass_id,
                outcome,
                evaluated: state.evaluated,
                reused: state.reused,
            }),
            Err(e) => {
                self.metrics.pass_failed();
                Err(e)
            }
        }
    }

    async fn walk(&self, key: &ReleaseKey, pass: &mut PassState) -> Result<PassOutcome, EngineError> {
        let release = self
            .store
            .release(key)
            .await?
            .ok_or_else(|| EngineError::ReleaseNotFound(key.to_string()))?;
        if release.state.is_terminal() {
            tracing::debug!(state = %release.state, "release already finalized");
            return Ok(PassOutcome::Skipped {
                state: release.state,
            });
        }

        let rules = evaluation_order(self.store.bound_rules(key).await?);
        let recorded: HashMap<RuleId, bool> = self
            .store
            .outcomes(key)
            .await?
            .into_iter()
            .map(|outcome| (outcome.rule_id, outcome.success))
            .collect();

        let mut verdicts: Vec<(BindingMode, Verdict)> = Vec::with_capacity(rules.len());
        let last = rules.len().saturating_sub(1);

        for (index, bound) in rules.iter().enumerate() {
            let rule = &bound.rule;

            if let Some(&success) = recorded.get(&rule.id) {
                pass.reused += 1;
                self.metrics.rule_reused();
                verdicts.push((bound.mode, Verdict::from_success(success)));
                if !success && bound.mode == BindingMode::Enforcing {
                    break;
                }
                continue;
            }

            // Cheap check before a potentially slow evaluation.
            if let Some(state) = self.store.release_state(key).await? {
                if state.is_terminal() {
                    tracing::info!(%state, "release finalized externally, stopping pass");
                    return Ok(PassOutcome::Skipped { state });
                }
            }

            let now = self.clock.now();
            let evaluation = match self.evaluator.evaluate(&release, rule, now).await? {
                RuleCheck::Decided(evaluation) => evaluation,
                RuleCheck::Pending { reason, on_expiry } => {
                    let waited = (now - release.created_at).to_std().unwrap_or_default();
                    if waited <= self.max_wait {
                        tracing::debug!(rule_id = rule.id.0, rule_type = %rule.rule_type(), %reason, "rule undecided");
                        return Ok(PassOutcome::Waiting {
                            rule_id: rule.id,
                            rule_type: rule.rule_type(),
                        });
                    }
                    tracing::warn!(
                        rule_id = rule.id.0,
                        rule_type = %rule.rule_type(),
                        %reason,
                        "rule undecided past max wait of {:?}, failing it",
                        self.max_wait
                    );
                    RuleEvaluation {
                        rule_id: rule.id,
                        success: false,
                        payload: on_expiry,
                    }
                }
            };

            let success = evaluation.success;
            let resolution = resolve_rule(success, bound.mode, index == last);
            let write = RuleProcessedWrite {
                release: key.clone(),
                evaluation,
                resolution,
                at: self.clock.now(),
            };
            match self.store.record_rule_processed(write).await? {
                WriteOutcome::Recorded(event_id) => {
                    pass.evaluated += 1;
                    self.metrics.rule_processed();
                    tracing::info!(
                        rule_id = rule.id.0,
                        rule_type = %rule.rule_type(),
                        event_id = event_id.0,
                        success,
                        result_state = %resolution.state,
                        ignored_error = resolution.ignored_error,
                        "rule processed"
                    );
                    if resolution.state.is_terminal() {
                        self.metrics.release_finalized();
                        return Ok(PassOutcome::Finalized {
                            state: resolution.state,
                        });
                    }
                    verdicts.push((bound.mode, Verdict::from_success(success)));
                }
                WriteOutcome::AlreadyRecorded => {
                    tracing::info!(rule_id = rule.id.0, "rule recorded by a concurrent pass, standing down");
                    return Ok(PassOutcome::Superseded);
                }
                WriteOutcome::ReleaseFinalized(state) => {
                    tracing::info!(%state, "release finalized externally, result discarded");
                    return Ok(PassOutcome::Skipped { state });
                }
            }
        }

        let state = aggregate(&verdicts);
        if !state.is_terminal() {
            return Err(EngineError::InvariantViolation(format!(
                "release {key} has no undecided rule but aggregates to {state}"
            )));
        }
        match self.store.finalize_release(key, state, self.clock.now()).await? {
            FinalizeOutcome::Finalized => {
                self.metrics.release_finalized();
                tracing::info!(%state, "release finalized from recorded outcomes");
                Ok(PassOutcome::Finalized { state })
            }
            FinalizeOutcome::AlreadyFinal(state) => Ok(PassOutcome::Skipped { state }),
        }
    }
}
