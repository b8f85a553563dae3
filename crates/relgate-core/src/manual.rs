//! # Manual Sign-off
//!
//! Reviewer decisions are recorded out-of-band, one per reviewer per rule.
//! A pass tallies them against the rule's [`ApprovalPolicy`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::RuleId;
use crate::rule::ApprovalPolicy;
use crate::state_machine::Verdict;

/// A reviewer's decision on one manual rule of one release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualDecision {
    pub rule_id: RuleId,
    pub reviewer: String,
    pub approved: bool,
    pub comments: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// Decision input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewManualDecision {
    pub reviewer: String,
    pub approved: bool,
    pub comments: Option<String>,
}

impl NewManualDecision {
    pub fn approve(reviewer: impl Into<String>) -> Self {
        Self {
            reviewer: reviewer.into(),
            approved: true,
            comments: None,
        }
    }

    pub fn reject(reviewer: impl Into<String>) -> Self {
        Self {
            reviewer: reviewer.into(),
            approved: false,
            comments: None,
        }
    }

    pub fn with_comments(mut self, comments: impl Into<String>) -> Self {
        self.comments = Some(comments.into());
        self
    }
}

/// Tally `decisions` for a rule governed by `policy`.
///
/// - `all`: any rejection fails; otherwise at least one approval passes.
/// - `minimum(n)`: `n` approvals pass. Rejections do not fail the rule since
///   other reviewers may still approve.
pub fn tally(policy: ApprovalPolicy, decisions: &[ManualDecision]) -> Verdict {
    let approvals = decisions.iter().filter(|d| d.approved).count();
    let rejections = decisions.len() - approvals;

    match policy {
        ApprovalPolicy::All if rejections > 0 => Verdict::Fail,
        ApprovalPolicy::All if approvals > 0 => Verdict::Pass,
        ApprovalPolicy::All => Verdict::Pending,
        ApprovalPolicy::Minimum(n) if approvals >= n as usize => Verdict::Pass,
        ApprovalPolicy::Minimum(_) => Verdict::Pending,
    }
}

/// Collapse reviewer comments into the text stored on the outcome.
pub fn summarize_comments(decisions: &[ManualDecision]) -> Option<String> {
    let lines: Vec<String> = decisions
        .iter()
        .map(|d| {
            let verdict = if d.approved { "approved" } else { "rejected" };
            match &d.comments {
                Some(comments) => format!("{} {verdict}: {comments}", d.reviewer),
                None => format!("{} {verdict}", d.reviewer),
            }
        })
        .collect();
    (!lines.is_empty()).then(|| lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(reviewer: &str, approved: bool) -> ManualDecision {
        ManualDecision {
            rule_id: RuleId(1),
            reviewer: reviewer.into(),
            approved,
            comments: None,
            decided_at: Utc::now(),
        }
    }

    #[test]
    fn all_policy_waits_for_first_decision() {
        assert_eq!(tally(ApprovalPolicy::All, &[]), Verdict::Pending);
    }

    #[test]
    fn all_policy_fails_on_any_rejection() {
        let decisions = [decision("a", true), decision("b", false)];
        assert_eq!(tally(ApprovalPolicy::All, &decisions), Verdict::Fail);
    }

    #[test]
    fn all_policy_passes_when_every_decision_approves() {
        let decisions = [decision("a", true), decision("b", true)];
        assert_eq!(tally(ApprovalPolicy::All, &decisions), Verdict::Pass);
    }

    #[test]
    fn minimum_policy_counts_approvals_only() {
        let decisions = [decision("a", true), decision("b", false)];
        assert_eq!(tally(ApprovalPolicy::Minimum(2), &decisions), Verdict::Pending);

        let decisions = [decision("a", true), decision("b", false), decision("c", true)];
        assert_eq!(tally(ApprovalPolicy::Minimum(2), &decisions), Verdict::Pass);
    }

    #[test]
    fn comments_summary_lists_each_reviewer() {
        let mut with_comment = decision("alice", false);
        with_comment.comments = Some("missing changelog".into());
        let summary = summarize_comments(&[decision("bob", true), with_comment]).unwrap();
        assert_eq!(summary, "bob approved\nalice rejected: missing changelog");
        assert_eq!(summarize_comments(&[]), None);
    }
}
