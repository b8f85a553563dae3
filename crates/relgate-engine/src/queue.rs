//! # Job Claim Queue
//!
//! One background job row exists per release. Its `lock_sub_id` selects a
//! session-scoped advisory lock (`namespace_base + lock_sub_id`) that guards
//! processing of that release: whoever holds the lock is the only worker
//! evaluating the release, and the lock disappears with the session if the
//! worker dies.
//!
//! ## Claiming
//!
//! A sweep selects a batch of jobs (`Store::next_jobs`), least recently
//! processed first, skipping rows another selector has locked. No advisory
//! lock is taken at selection time: each job is locked with
//! `Store::try_claim` right before its pass and unlocked right after, so a
//! sweep holds at most one lock at a time. Every pass stamps
//! `last_processed_at`, which moves releases that are still waiting to the
//! back of the queue. A claimed job whose stamp differs from the one seen at
//! selection was processed by another worker in the meantime and is left
//! alone.
//!
//! ## Lock sub-id allocation
//!
//! The first insert attempt takes the next value of the column's sequence.
//! If that value is already taken (for example by an earlier random pick),
//! later attempts use a uniformly random value in `[1, max_sub_id]`. Only a
//! collision on `lock_sub_id` is retried; any other failure is fatal. After
//! `max_tries` attempts the creation fails with
//! [`EngineError::LockAllocationExhausted`](crate::EngineError).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use relgate_core::ReleaseKey;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

// ---------------------------------------------------------------------------
// ReleaseBackgroundJob
// ---------------------------------------------------------------------------

/// The claimable work item of a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseBackgroundJob {
    pub key: ReleaseKey,
    pub lock_sub_id: i32,
    pub created_at: DateTime<Utc>,
    /// End of the most recent pass, `None` until the first one.
    pub last_processed_at: Option<DateTime<Utc>>,
}

impl ReleaseBackgroundJob {
    /// Advisory lock id guarding this job.
    pub fn lock_id(&self, namespace_base: i64) -> i64 {
        advisory_lock_id(namespace_base, self.lock_sub_id)
    }
}

pub fn advisory_lock_id(namespace_base: i64, lock_sub_id: i32) -> i64 {
    namespace_base.wrapping_add(i64::from(lock_sub_id))
}

// ---------------------------------------------------------------------------
// Lock sub-id allocation
// ---------------------------------------------------------------------------

/// Bounds of the lock sub-id allocation protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSubIdPolicy {
    pub max_tries: u32,
    pub max_sub_id: i32,
}

impl Default for LockSubIdPolicy {
    fn default() -> Self {
        Self {
            max_tries: 1000,
            max_sub_id: i32::MAX,
        }
    }
}

impl LockSubIdPolicy {
    pub fn new(max_tries: u32, max_sub_id: i32) -> Result<Self, String> {
        if max_tries == 0 {
            return Err("at least one allocation attempt is required".into());
        }
        if max_sub_id < 1 {
            return Err(format!("max_sub_id must be positive, got {max_sub_id}"));
        }
        Ok(Self {
            max_tries,
            max_sub_id,
        })
    }

    /// Candidate sub-ids to try in order: `None` means "use the sequence".
    pub fn candidates(&self) -> SubIdCandidates {
        SubIdCandidates {
            issued: 0,
            max_tries: self.max_tries,
            max_sub_id: self.max_sub_id,
        }
    }
}

/// Iterator over allocation attempts. Yields at most `max_tries` items.
#[derive(Debug, Clone)]
pub struct SubIdCandidates {
    issued: u32,
    max_tries: u32,
    max_sub_id: i32,
}

impl SubIdCandidates {
    /// Number of candidates handed out so far.
    pub fn tries(&self) -> u32 {
        self.issued
    }
}

impl Iterator for SubIdCandidates {
    type Item = Option<i32>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.issued >= self.max_tries {
            return None;
        }
        self.issued += 1;
        if self.issued == 1 {
            Some(None)
        } else {
            Some(Some(rand::thread_rng().gen_range(1..=self.max_sub_id)))
        }
    }
}

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

/// Held advisory lock of a claimed job.
///
/// Implementations release the lock when dropped. [`JobLock::release`]
/// releases it eagerly and reports failures.
#[async_trait]
pub trait JobLock: Send + Sync + std::fmt::Debug {
    fn lock_id(&self) -> i64;

    async fn release(self: Box<Self>) -> Result<(), EngineError>;
}

/// A job whose advisory lock is held by this worker.
#[derive(Debug)]
pub struct ClaimedJob {
    pub job: ReleaseBackgroundJob,
    pub lock: Box<dyn JobLock>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_id_offsets_namespace() {
        assert_eq!(advisory_lock_id(0xffff_ffff, 1), 0x1_0000_0000);
        assert_eq!(
            advisory_lock_id(0xffff_ffff, i32::MAX),
            0xffff_ffff + i64::from(i32::MAX)
        );
    }

    #[test]
    fn first_candidate_uses_sequence_then_random() {
        let policy = LockSubIdPolicy::new(50, 10).unwrap();
        let candidates: Vec<Option<i32>> = policy.candidates().collect();
        assert_eq!(candidates.len(), 50);
        assert_eq!(candidates[0], None);
        for candidate in &candidates[1..] {
            let id = candidate.unwrap();
            assert!((1..=10).contains(&id));
        }
    }

    #[test]
    fn candidates_count_tries() {
        let policy = LockSubIdPolicy::new(3, 5).unwrap();
        let mut candidates = policy.candidates();
        while candidates.next().is_some() {}
        assert_eq!(candidates.tries(), 3);
    }

    #[test]
    fn degenerate_policies_rejected() {
        assert!(LockSubIdPolicy::new(0, 10).is_err());
        assert!(LockSubIdPolicy::new(10, 0).is_err());
    }
}
