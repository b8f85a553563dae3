//! Store tests against a live Postgres.
//!
//! Skipped unless `DATABASE_URL` points at a disposable database. Every
//! test works under its own organization so runs do not interfere.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use common::{always_open, fast_config};
use relgate_core::{
    BindingMode, EventKind, NewApprovalRule, NewRelease, NewRulesetBinding, ReleaseKey, ReleaseState,
    RulesetVersionKey,
};
use relgate_engine::{Engine, EngineError, LockSubIdPolicy, PassOutcome, PgStore, Store};

async fn pg_engine() -> Option<(Engine, Arc<PgStore>)> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping Postgres test");
        return None;
    };
    let config = fast_config();
    let store = Arc::new(PgStore::connect_and_migrate(&url, &config).await.unwrap());
    let engine = Engine::new(store.clone(), config).unwrap();
    Some((engine, store))
}

fn unique_key(test: &str) -> ReleaseKey {
    let org = format!("{test}-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
    ReleaseKey::new(org, "payments", 1)
}

/// Ruleset versions are global, so derive one from the clock as well.
fn unique_version() -> RulesetVersionKey {
    RulesetVersionKey::new(Utc::now().timestamp_micros(), 0)
}

#[tokio::test]
async fn release_lifecycle_round_trips() {
    let Some((engine, store)) = pg_engine().await else {
        return;
    };
    let key = unique_key("lifecycle");
    let version = unique_version();
    engine
        .insert_rules(version, vec![NewApprovalRule::enabled(always_open())])
        .await
        .unwrap();

    let (release, job) = engine
        .create_release(
            NewRelease::new(key.clone()),
            vec![NewRulesetBinding::new("default", version, BindingMode::Enforcing)],
        )
        .await
        .unwrap();
    assert_eq!(release.state, ReleaseState::InProgress);
    assert!(job.lock_sub_id > 0);
    let stored_job = store.background_job(&key).await.unwrap().expect("job row");
    assert_eq!(stored_job.lock_sub_id, job.lock_sub_id);

    let report = engine.process_release(&key).await.unwrap();
    assert_eq!(
        report.outcome,
        PassOutcome::Finalized {
            state: ReleaseState::Approved
        }
    );

    let stored = engine.release(&key).await.unwrap().unwrap();
    assert_eq!(stored.state, ReleaseState::Approved);
    assert!(stored.finalized_at.is_some());

    let timeline = engine.timeline(&key).await.unwrap();
    assert_eq!(timeline.len(), 2);
    assert_eq!(timeline[0].event.kind, EventKind::Created);
    assert!(timeline[1].outcome.as_ref().is_some_and(|o| o.success));
}

#[tokio::test]
async fn duplicate_release_is_rejected() {
    let Some((engine, _)) = pg_engine().await else {
        return;
    };
    let key = unique_key("duplicate");
    engine
        .create_release(NewRelease::new(key.clone()), Vec::new())
        .await
        .unwrap();
    let err = engine
        .create_release(NewRelease::new(key), Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));
}

#[tokio::test]
async fn claimed_job_is_skipped_by_other_claimers() {
    let Some((engine, store)) = pg_engine().await else {
        return;
    };
    let key = unique_key("claim");
    engine
        .create_release(NewRelease::new(key.clone()), Vec::new())
        .await
        .unwrap();

    let first = store.try_claim(&key).await.unwrap().expect("first claim");
    assert!(store.try_claim(&key).await.unwrap().is_none());
    first.lock.release().await.unwrap();

    let again = store.try_claim(&key).await.unwrap();
    assert!(again.is_some());
}

#[tokio::test]
async fn cancel_is_final() {
    let Some((engine, _)) = pg_engine().await else {
        return;
    };
    let key = unique_key("cancel");
    engine
        .create_release(NewRelease::new(key.clone()), Vec::new())
        .await
        .unwrap();

    let cancelled = engine.cancel_release(&key).await.unwrap();
    assert_eq!(cancelled.state, ReleaseState::Cancelled);
    assert!(engine.cancel_release(&key).await.is_err());

    let report = engine.process_release(&key).await.unwrap();
    assert_eq!(
        report.outcome,
        PassOutcome::Skipped {
            state: ReleaseState::Cancelled
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creation_resolves_sub_id_collisions() {
    let Some((engine, store)) = pg_engine().await else {
        return;
    };
    let org = unique_key("subids").organization_id.as_str().to_string();
    let concurrent: i64 = 16;

    // Blockers take the next sequence values; rewinding the sequence makes
    // every sequence pick below collide with one of them.
    let mut blockers = HashSet::new();
    for id in 1..=2 * concurrent {
        let (_, job) = engine
            .create_release(NewRelease::new(ReleaseKey::new(org.as_str(), "blockers", id)), Vec::new())
            .await
            .unwrap();
        blockers.insert(job.lock_sub_id);
    }
    let lowest = blockers.iter().copied().min().unwrap();
    let highest = blockers.iter().copied().max().unwrap();
    sqlx::query("SELECT setval(pg_get_serial_sequence('release_background_jobs', 'lock_sub_id'), $1, false)")
        .bind(i64::from(lowest))
        .execute(store.pool())
        .await
        .unwrap();

    // A tight random range forces collisions between the concurrent
    // creations themselves, not only with the blockers.
    let policy = LockSubIdPolicy::new(20_000, highest + 4 * concurrent as i32).unwrap();
    let crowded = Engine::new(store.clone(), fast_config().with_lock_sub_ids(policy)).unwrap();

    let creations: Vec<_> = (1..=concurrent)
        .map(|id| {
            let engine = crowded.clone();
            let key = ReleaseKey::new(org.as_str(), "crowded", id);
            tokio::spawn(async move { engine.create_release(NewRelease::new(key), Vec::new()).await })
        })
        .collect();

    let mut sub_ids = HashSet::new();
    for creation in creations {
        let (_, job) = creation.await.unwrap().unwrap();
        assert!(!blockers.contains(&job.lock_sub_id), "reused blocker sub-id {}", job.lock_sub_id);
        assert!(sub_ids.insert(job.lock_sub_id), "duplicate sub-id {}", job.lock_sub_id);
    }
    assert_eq!(sub_ids.len(), concurrent as usize);

    // A second job for the same release is a key conflict, not a sub-id
    // collision: it fails at once instead of being retried.
    let existing = ReleaseKey::new(org.as_str(), "crowded", 1);
    let err = crowded.create_release_background_job(&existing).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)), "got {err:?}");
}

#[tokio::test]
async fn claims_rotate_by_last_processed() {
    let Some((engine, store)) = pg_engine().await else {
        return;
    };
    let key = unique_key("rotation");
    let (_, job) = engine
        .create_release(NewRelease::new(key.clone()), Vec::new())
        .await
        .unwrap();
    assert!(job.last_processed_at.is_none());

    let claimed = store.try_claim(&key).await.unwrap().expect("claim");
    store.mark_processed(&key, Utc::now()).await.unwrap();
    claimed.lock.release().await.unwrap();

    let reclaimed = store.try_claim(&key).await.unwrap().expect("reclaim");
    assert!(reclaimed.job.last_processed_at.is_some());
    reclaimed.lock.release().await.unwrap();
}
