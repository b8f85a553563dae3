//! Engine configuration.
//!
//! Every setting has a default and can be overridden through an environment
//! variable or a `with_*` builder method. The database URL is optional: an
//! unset `DATABASE_URL` leaves the engine usable with the in-memory store.

use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};

use crate::backoff::Backoff;
use crate::queue::LockSubIdPolicy;

/// Default namespace added to every lock sub-id to form the advisory lock id.
pub const DEFAULT_LOCK_NAMESPACE_BASE: i64 = 0xffff_ffff;

/// One connection for a held job lock, one for the pass itself.
const MIN_DB_CONNECTIONS: u32 = 2;

/// Configuration for the processing engine and its worker.
///
/// Custom `Debug` implementation redacts the password of `database_url`.
#[derive(Clone)]
pub struct EngineConfig {
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub db_min_connections: u32,
    pub db_acquire_timeout: Duration,
    /// Interval between polling sweeps.
    pub poll_interval: Duration,
    /// Maximum number of jobs selected per sweep. Jobs are locked one at a
    /// time, each lock pinning one pooled connection for its pass.
    pub claim_batch_size: usize,
    /// Per-request timeout for HTTP API rules.
    pub http_timeout: Duration,
    pub http_retry_backoff: Backoff,
    /// Response bodies beyond this many bytes are truncated before storage.
    pub http_max_body_bytes: usize,
    /// How long schedule and manual rules may stay undecided, counted from
    /// release creation, before they are recorded as failed.
    pub max_wait: Duration,
    /// Offset from UTC in which schedule windows are interpreted.
    pub schedule_utc_offset: FixedOffset,
    pub lock_namespace_base: i64,
    pub lock_sub_ids: LockSubIdPolicy,
    pub background_backoff: Backoff,
    pub background_max_attempts: u32,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("database_url", &self.database_url.as_deref().map(redact_url))
            .field("db_max_connections", &self.db_max_connections)
            .field("db_min_connections", &self.db_min_connections)
            .field("db_acquire_timeout", &self.db_acquire_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("claim_batch_size", &self.claim_batch_size)
            .field("http_timeout", &self.http_timeout)
            .field("http_retry_backoff", &self.http_retry_backoff)
            .field("http_max_body_bytes", &self.http_max_body_bytes)
            .field("max_wait", &self.max_wait)
            .field("schedule_utc_offset", &self.schedule_utc_offset)
            .field("lock_namespace_base", &self.lock_namespace_base)
            .field("lock_sub_ids", &self.lock_sub_ids)
            .field("background_backoff", &self.background_backoff)
            .field("background_max_attempts", &self.background_max_attempts)
            .finish()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_connections: 20,
            db_min_connections: 2,
            db_acquire_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(10),
            claim_batch_size: 8,
            http_timeout: Duration::from_secs(30),
            http_retry_backoff: Backoff::new(Duration::from_millis(500), Duration::from_secs(10)),
            http_max_body_bytes: 64 * 1024,
            max_wait: Duration::from_secs(7 * 24 * 60 * 60),
            schedule_utc_offset: Utc.fix(),
            lock_namespace_base: DEFAULT_LOCK_NAMESPACE_BASE,
            lock_sub_ids: LockSubIdPolicy::default(),
            background_backoff: Backoff::new(Duration::from_secs(5), Duration::from_secs(300))
                .with_jitter(Duration::from_secs(10)),
            background_max_attempts: 10,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Variables (defaults in parentheses):
    /// - `DATABASE_URL` (unset)
    /// - `RELGATE_DB_MAX_CONNECTIONS` (20), `RELGATE_DB_MIN_CONNECTIONS` (2),
    ///   `RELGATE_DB_ACQUIRE_TIMEOUT_SECS` (5)
    /// - `RELGATE_POLL_INTERVAL_SECS` (10), `RELGATE_CLAIM_BATCH_SIZE` (8)
    /// - `RELGATE_HTTP_TIMEOUT_SECS` (30), `RELGATE_HTTP_RETRY_BASE_DELAY_MS` (500),
    ///   `RELGATE_HTTP_RETRY_MAX_DELAY_MS` (10000), `RELGATE_HTTP_MAX_BODY_BYTES` (65536)
    /// - `RELGATE_MAX_WAIT_SECS` (604800)
    /// - `RELGATE_SCHEDULE_UTC_OFFSET_MINUTES` (0)
    /// - `RELGATE_LOCK_NAMESPACE_BASE` (4294967295), `RELGATE_LOCK_SUB_ID_MAX` (2147483647),
    ///   `RELGATE_LOCK_ALLOCATION_TRIES` (1000)
    /// - `RELGATE_BACKGROUND_MIN_DELAY_SECS` (5), `RELGATE_BACKGROUND_MAX_DELAY_SECS` (300),
    ///   `RELGATE_BACKGROUND_JITTER_SECS` (10), `RELGATE_BACKGROUND_MAX_ATTEMPTS` (10)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let offset_minutes: i32 = env_parse("RELGATE_SCHEDULE_UTC_OFFSET_MINUTES", 0)?;
        let schedule_utc_offset = offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                ConfigError::Invalid(
                    "RELGATE_SCHEDULE_UTC_OFFSET_MINUTES".into(),
                    format!("{offset_minutes} is out of range"),
                )
            })?;

        let lock_sub_ids = LockSubIdPolicy::new(
            env_parse("RELGATE_LOCK_ALLOCATION_TRIES", defaults.lock_sub_ids.max_tries)?,
            env_parse("RELGATE_LOCK_SUB_ID_MAX", defaults.lock_sub_ids.max_sub_id)?,
        )
        .map_err(|reason| ConfigError::Invalid("RELGATE_LOCK_SUB_ID_MAX".into(), reason))?;

        let config = Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            db_max_connections: env_parse("RELGATE_DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            db_min_connections: env_parse("RELGATE_DB_MIN_CONNECTIONS", defaults.db_min_connections)?,
            db_acquire_timeout: Duration::from_secs(env_parse("RELGATE_DB_ACQUIRE_TIMEOUT_SECS", 5)?),
            poll_interval: Duration::from_secs(env_parse("RELGATE_POLL_INTERVAL_SECS", 10)?),
            claim_batch_size: env_parse("RELGATE_CLAIM_BATCH_SIZE", defaults.claim_batch_size)?,
            http_timeout: Duration::from_secs(env_parse("RELGATE_HTTP_TIMEOUT_SECS", 30)?),
            http_retry_backoff: Backoff::new(
                Duration::from_millis(env_parse("RELGATE_HTTP_RETRY_BASE_DELAY_MS", 500)?),
                Duration::from_millis(env_parse("RELGATE_HTTP_RETRY_MAX_DELAY_MS", 10_000)?),
            ),
            http_max_body_bytes: env_parse("RELGATE_HTTP_MAX_BODY_BYTES", defaults.http_max_body_bytes)?,
            max_wait: Duration::from_secs(env_parse("RELGATE_MAX_WAIT_SECS", 604_800)?),
            schedule_utc_offset,
            lock_namespace_base: env_parse("RELGATE_LOCK_NAMESPACE_BASE", defaults.lock_namespace_base)?,
            lock_sub_ids,
            background_backoff: Backoff::new(
                Duration::from_secs(env_parse("RELGATE_BACKGROUND_MIN_DELAY_SECS", 5)?),
                Duration::from_secs(env_parse("RELGATE_BACKGROUND_MAX_DELAY_SECS", 300)?),
            )
            .with_jitter(Duration::from_secs(env_parse("RELGATE_BACKGROUND_JITTER_SECS", 10)?)),
            background_max_attempts: env_parse(
                "RELGATE_BACKGROUND_MAX_ATTEMPTS",
                defaults.background_max_attempts,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check settings that parse individually but cannot work together.
    ///
    /// A pass holds its advisory lock on one pooled connection while its
    /// reads and writes need another, so the pool must allow at least two.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.claim_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "RELGATE_CLAIM_BATCH_SIZE".into(),
                "must be at least 1".into(),
            ));
        }
        if self.db_max_connections < MIN_DB_CONNECTIONS {
            return Err(ConfigError::Invalid(
                "RELGATE_DB_MAX_CONNECTIONS".into(),
                format!("must be at least {MIN_DB_CONNECTIONS}, got {}", self.db_max_connections),
            ));
        }
        if self.db_min_connections > self.db_max_connections {
            return Err(ConfigError::Invalid(
                "RELGATE_DB_MIN_CONNECTIONS".into(),
                format!(
                    "{} exceeds RELGATE_DB_MAX_CONNECTIONS ({})",
                    self.db_min_connections, self.db_max_connections
                ),
            ));
        }
        Ok(())
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_claim_batch_size(mut self, size: usize) -> Self {
        self.claim_batch_size = size;
        self
    }

    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    pub fn with_http_retry_backoff(mut self, backoff: Backoff) -> Self {
        self.http_retry_backoff = backoff;
        self
    }

    pub fn with_http_max_body_bytes(mut self, limit: usize) -> Self {
        self.http_max_body_bytes = limit;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_schedule_utc_offset(mut self, offset: FixedOffset) -> Self {
        self.schedule_utc_offset = offset;
        self
    }

    pub fn with_lock_sub_ids(mut self, policy: LockSubIdPolicy) -> Self {
        self.lock_sub_ids = policy;
        self
    }

    pub fn with_background_retry(mut self, backoff: Backoff, max_attempts: u32) -> Self {
        self.background_backoff = backoff;
        self.background_max_attempts = max_attempts;
        self
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url.as_deref().ok_or(ConfigError::MissingDatabaseUrl)
    }
}

fn env_parse<T>(var: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::Invalid(var.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

/// Replace the password component of a connection URL.
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) if parsed.password().is_some() => {
            // set_password only fails for URLs that cannot carry credentials.
            let _ = parsed.set_password(Some("[REDACTED]"));
            parsed.to_string()
        }
        Ok(parsed) => parsed.to_string(),
        Err(_) => "[UNPARSEABLE]".to_string(),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_database_password() {
        let config = EngineConfig::default().with_database_url("postgres://relgate:s3cret@db:5432/relgate");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("relgate"));
    }

    #[test]
    fn redact_leaves_passwordless_urls_alone() {
        assert_eq!(redact_url("postgres://db/relgate"), "postgres://db/relgate");
        assert_eq!(redact_url("::"), "[UNPARSEABLE]");
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = EngineConfig::default().with_claim_batch_size(0).validate().unwrap_err();
        assert!(err.to_string().contains("RELGATE_CLAIM_BATCH_SIZE"));
    }

    #[test]
    fn pool_must_fit_lock_and_pass_connections() {
        let mut config = EngineConfig::default();
        config.db_max_connections = 1;
        config.db_min_connections = 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("RELGATE_DB_MAX_CONNECTIONS"));

        config.db_max_connections = 2;
        assert!(config.validate().is_ok());

        config.db_min_connections = 3;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("RELGATE_DB_MIN_CONNECTIONS"));
    }

    #[test]
    fn batch_size_may_exceed_pool_size() {
        let mut config = EngineConfig::default().with_claim_batch_size(50);
        config.db_max_connections = 2;
        config.db_min_connections = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn defaults_are_bounded() {
        assert!(EngineConfig::default().validate().is_ok());
        let config = EngineConfig::default();
        assert_eq!(config.lock_namespace_base, 0xffff_ffff);
        assert_eq!(config.lock_sub_ids.max_tries, 1000);
        assert_eq!(config.lock_sub_ids.max_sub_id, i32::MAX);
        assert_eq!(config.background_max_attempts, 10);
        assert!(config.http_retry_backoff.max >= config.http_retry_backoff.min);
    }
}
