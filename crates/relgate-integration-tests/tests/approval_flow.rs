//! End-to-end approval passes against the in-memory store, with HTTP rule
//! endpoints served by wiremock.

mod common;

use std::time::Duration;

use common::{always_open, fast_config, http, key, memory_engine, ruleset};
use relgate_core::{
    BindingMode, EventKind, HttpApiRule, NewRelease, OutcomePayload, ReleaseState, RuleSpec,
};
use relgate_engine::{PassOutcome, Store};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn permissive_http_failure_still_approves() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("service unavailable"))
        .expect(1)
        .mount(&server)
        .await;

    let (engine, _) = memory_engine(fast_config());
    let ruleset_a = ruleset(&engine, 1, BindingMode::Enforcing, vec![always_open()]).await;
    let ruleset_b = ruleset(&engine, 2, BindingMode::Permissive, vec![http(server.uri())]).await;
    engine
        .create_release(NewRelease::new(key(1)), vec![ruleset_a, ruleset_b])
        .await
        .unwrap();

    let report = engine.process_release(&key(1)).await.unwrap();
    assert_eq!(
        report.outcome,
        PassOutcome::Finalized {
            state: ReleaseState::Approved
        }
    );

    let release = engine.release(&key(1)).await.unwrap().unwrap();
    assert_eq!(release.state, ReleaseState::Approved);
    assert!(release.finalized_at.is_some());

    let timeline = engine.timeline(&key(1)).await.unwrap();
    let ignored: Vec<_> = timeline
        .iter()
        .filter(|entry| {
            matches!(
                entry.event.kind,
                EventKind::RuleProcessed {
                    ignored_error: true,
                    ..
                }
            )
        })
        .collect();
    assert_eq!(ignored.len(), 1);

    let outcome = ignored[0].outcome.as_ref().unwrap();
    assert!(!outcome.success);
    let OutcomePayload::HttpApi(record) = &outcome.payload else {
        panic!("expected HTTP outcome, got {:?}", outcome.payload);
    };
    assert_eq!(record.response_code, Some(500));
    assert_eq!(record.body, b"service unavailable");

    let schedule_success = timeline.iter().any(|entry| {
        entry
            .outcome
            .as_ref()
            .is_some_and(|o| o.success && o.payload == OutcomePayload::Schedule)
    });
    assert!(schedule_success);
}

#[tokio::test]
async fn enforcing_failure_short_circuits_remaining_rules() {
    let failing = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&failing)
        .await;
    let never_called = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&never_called)
        .await;

    let (engine, _) = memory_engine(fast_config());
    let binding = ruleset(
        &engine,
        1,
        BindingMode::Enforcing,
        vec![http(failing.uri()), http(never_called.uri())],
    )
    .await;
    engine
        .create_release(NewRelease::new(key(1)), vec![binding])
        .await
        .unwrap();

    let report = engine.process_release(&key(1)).await.unwrap();
    assert_eq!(
        report.outcome,
        PassOutcome::Finalized {
            state: ReleaseState::Rejected
        }
    );

    let events = engine.events(&key(1)).await.unwrap();
    let processed: Vec<_> = events
        .iter()
        .filter_map(|event| match event.kind {
            EventKind::RuleProcessed {
                result_state,
                ignored_error,
                ..
            } => Some((result_state, ignored_error)),
            _ => None,
        })
        .collect();
    assert_eq!(processed, vec![(ReleaseState::Rejected, false)]);
}

#[tokio::test]
async fn only_permissive_failures_approve() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let (engine, _) = memory_engine(fast_config());
    let binding = ruleset(
        &engine,
        1,
        BindingMode::Permissive,
        vec![http(server.uri()), http(server.uri())],
    )
    .await;
    engine
        .create_release(NewRelease::new(key(1)), vec![binding])
        .await
        .unwrap();

    engine.process_release(&key(1)).await.unwrap();
    let release = engine.release(&key(1)).await.unwrap().unwrap();
    assert_eq!(release.state, ReleaseState::Approved);

    let ignored = engine
        .events(&key(1))
        .await
        .unwrap()
        .into_iter()
        .filter(|event| {
            matches!(
                event.kind,
                EventKind::RuleProcessed {
                    ignored_error: true,
                    ..
                }
            )
        })
        .count();
    assert_eq!(ignored, 2);
}

#[tokio::test]
async fn http_retries_are_bounded_by_rule_limit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(4)
        .mount(&server)
        .await;

    let (engine, _) = memory_engine(fast_config());
    let binding = ruleset(
        &engine,
        1,
        BindingMode::Enforcing,
        vec![RuleSpec::HttpApi(HttpApiRule::new(server.uri()).with_retry_on_fail(3))],
    )
    .await;
    engine
        .create_release(NewRelease::new(key(1)), vec![binding])
        .await
        .unwrap();

    engine.process_release(&key(1)).await.unwrap();
    let outcomes = engine.outcomes(&key(1)).await.unwrap();
    let OutcomePayload::HttpApi(record) = &outcomes[0].payload else {
        panic!("expected HTTP outcome");
    };
    assert_eq!(record.attempts, 4);
    assert_eq!(
        engine.release(&key(1)).await.unwrap().unwrap().state,
        ReleaseState::Rejected
    );
}

#[tokio::test]
async fn cancellation_during_evaluation_is_honored() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let (engine, store) = memory_engine(fast_config());
    let binding = ruleset(&engine, 1, BindingMode::Enforcing, vec![http(server.uri())]).await;
    engine
        .create_release(NewRelease::new(key(1)), vec![binding])
        .await
        .unwrap();

    let claimed = store.try_claim(&key(1)).await.unwrap().unwrap();
    let pass = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.process_claimed(claimed).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    engine.cancel_release(&key(1)).await.unwrap();

    let report = pass.await.unwrap().unwrap();
    assert_eq!(
        report.outcome,
        PassOutcome::Skipped {
            state: ReleaseState::Cancelled
        }
    );

    let release = engine.release(&key(1)).await.unwrap().unwrap();
    assert_eq!(release.state, ReleaseState::Cancelled);
    assert!(engine.outcomes(&key(1)).await.unwrap().is_empty());

    let kinds: Vec<&str> = engine
        .events(&key(1))
        .await
        .unwrap()
        .iter()
        .map(|event| event.kind.as_str())
        .collect();
    assert_eq!(kinds, vec!["created", "cancelled"]);
}

#[tokio::test]
async fn interrupted_pass_resumes_without_duplicates() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(5)
        .mount(&server)
        .await;

    let (engine, store) = memory_engine(fast_config());
    let binding = ruleset(
        &engine,
        1,
        BindingMode::Enforcing,
        vec![
            http(server.uri()),
            http(server.uri()),
            http(server.uri()),
            http(server.uri()),
        ],
    )
    .await;
    engine
        .create_release(NewRelease::new(key(1)), vec![binding])
        .await
        .unwrap();

    // Two rules land, the third write fails mid-pass.
    store.fail_rule_write_after(2);
    assert!(engine.process_release(&key(1)).await.is_err());
    assert_eq!(engine.outcomes(&key(1)).await.unwrap().len(), 2);

    // The third rule's HTTP call happened but its outcome was lost, so
    // resuming calls it again; the first two are reused.
    assert_eq!(server.received_requests().await.unwrap().len(), 3);

    let report = engine.process_release(&key(1)).await.unwrap();
    assert_eq!(report.reused, 2);
    assert_eq!(report.evaluated, 2);

    let outcomes = engine.outcomes(&key(1)).await.unwrap();
    assert_eq!(outcomes.len(), 4);
    let mut rule_ids: Vec<_> = outcomes.iter().map(|o| o.rule_id.0).collect();
    rule_ids.sort_unstable();
    rule_ids.dedup();
    assert_eq!(rule_ids.len(), 4);
    server.verify().await;
}
