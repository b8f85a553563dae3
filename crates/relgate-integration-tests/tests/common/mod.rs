//! Fixtures shared by the integration test binaries.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use relgate_core::{
    BindingMode, HttpApiRule, NewApprovalRule, NewRulesetBinding, ReleaseKey, RuleSpec,
    RulesetVersionKey, ScheduleRule,
};
use relgate_engine::{Backoff, Engine, EngineConfig, MemoryStore};

pub fn key(id: i64) -> ReleaseKey {
    ReleaseKey::new("acme", "payments", id)
}

/// Config with short HTTP timeouts and retry delays.
pub fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_http_timeout(Duration::from_secs(2))
        .with_http_retry_backoff(Backoff::new(Duration::from_millis(1), Duration::from_millis(10)))
        .with_background_retry(Backoff::new(Duration::from_millis(1), Duration::from_millis(10)), 3)
}

pub fn memory_engine(config: EngineConfig) -> (Engine, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::new(store.clone(), config).expect("engine");
    (engine, store)
}

pub fn always_open() -> RuleSpec {
    RuleSpec::Schedule(ScheduleRule::always_open())
}

pub fn http(url: impl Into<String>) -> RuleSpec {
    RuleSpec::HttpApi(HttpApiRule::new(url))
}

/// Store `specs` as ruleset version `major`.0 and return a binding to it.
pub async fn ruleset(
    engine: &Engine,
    major: i64,
    mode: BindingMode,
    specs: Vec<RuleSpec>,
) -> NewRulesetBinding {
    let version = RulesetVersionKey::new(major, 0);
    engine
        .insert_rules(version, specs.into_iter().map(NewApprovalRule::enabled).collect())
        .await
        .expect("insert rules");
    NewRulesetBinding::new(format!("ruleset-{major}"), version, mode)
}
