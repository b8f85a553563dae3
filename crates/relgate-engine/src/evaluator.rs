//! Rule evaluation.
//!
//! Turns one approval rule into either a decision or a "not yet" answer.
//! Schedule and manual rules can be undecided: a closed window may open
//! later and missing sign-offs may still arrive. The processor decides what
//! to do with an undecided rule; this module only reports it.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use relgate_core::manual::{summarize_comments, tally};
use relgate_core::{ApprovalRule, OutcomePayload, Release, RuleEvaluation, RuleSpec, Verdict};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::http::{HttpRuleClient, ReleaseNotification};
use crate::store::Store;

/// Result of checking one rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleCheck {
    Decided(RuleEvaluation),
    /// Not decidable yet. `on_expiry` is the payload to record if the rule
    /// is failed for having waited too long.
    Pending { reason: String, on_expiry: OutcomePayload },
}

#[derive(Debug, Clone)]
pub struct RuleEvaluator {
    store: Arc<dyn Store>,
    http: HttpRuleClient,
    schedule_offset: FixedOffset,
}

impl RuleEvaluator {
    pub fn new(store: Arc<dyn Store>, config: &EngineConfig) -> Result<Self, EngineError> {
        Ok(Self {
            store,
            http: HttpRuleClient::new(config)?,
            schedule_offset: config.schedule_utc_offset,
        })
    }

    pub async fn evaluate(
        &self,
        release: &Release,
        rule: &ApprovalRule,
        now: DateTime<Utc>,
    ) -> Result<RuleCheck, EngineError> {
        match &rule.spec {
            RuleSpec::HttpApi(http) => {
                let notification = ReleaseNotification::new(release, rule.id);
                let record = self.http.call(http, &notification).await;
                Ok(RuleCheck::Decided(RuleEvaluation {
                    rule_id: rule.id,
                    success: record.is_success(),
                    payload: OutcomePayload::HttpApi(record),
                }))
            }
            RuleSpec::Schedule(schedule) => {
                let window = schedule.window()?;
                let local = now.with_timezone(&self.schedule_offset);
                if window.contains(&local) {
                    Ok(RuleCheck::Decided(RuleEvaluation {
                        rule_id: rule.id,
                        success: true,
                        payload: OutcomePayload::Schedule,
                    }))
                } else {
                    Ok(RuleCheck::Pending {
                        reason: format!("outside schedule window at {local}"),
                        on_expiry: OutcomePayload::Schedule,
                    })
                }
            }
            RuleSpec::Manual(manual) => {
                let decisions = self.store.manual_decisions(&release.key, rule.id).await?;
                let comments = summarize_comments(&decisions);
                let success = match tally(manual.approval_policy, &decisions) {
                    Verdict::Pass => true,
                    Verdict::Fail => false,
                    Verdict::Pending => {
                        return Ok(RuleCheck::Pending {
                            reason: format!(
                                "{} decision(s) recorded, {} policy unmet",
                                decisions.len(),
                                manual.approval_policy.as_str()
                            ),
                            on_expiry: OutcomePayload::Manual { comments },
                        })
                    }
                };
                Ok(RuleCheck::Decided(RuleEvaluation {
                    rule_id: rule.id,
                    success,
                    payload: OutcomePayload::Manual { comments },
                }))
            }
        }
    }
}
