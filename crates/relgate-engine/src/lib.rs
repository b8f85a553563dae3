//! # relgate-engine: Release Approval Processing
//!
//! Decides whether a software release may proceed by evaluating the
//! approval rules bound to it, and records why.
//!
//! ## Architecture
//!
//! - [`store`]: persistence behind the [`Store`] trait, with PostgreSQL
//!   ([`PgStore`]) and in-memory ([`MemoryStore`]) implementations.
//! - [`queue`]: background jobs, lock sub-id allocation and claims.
//! - [`evaluator`] / [`http`]: rule evaluation, including the HTTP client
//!   with bounded retries.
//! - [`processor`]: one pass over one release.
//! - [`engine`]: the [`Engine`] context exposing every operation.
//! - [`worker`]: the polling [`Worker`].
//!
//! ## Concurrency
//!
//! Any number of engine processes may share one database. A release is
//! processed by at most one of them at a time: its job's advisory lock
//! admits one holder, and every audit write re-checks the release and the
//! rule under the release row lock, so a lost race degrades into a no-op
//! rather than a duplicate or overwritten record.

pub mod backoff;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod http;
pub mod metrics;
pub mod processor;
pub mod queue;
pub mod store;
pub mod worker;

pub use backoff::Backoff;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EngineConfig};
pub use engine::Engine;
pub use error::EngineError;
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use processor::{PassOutcome, PassReport};
pub use queue::{ClaimedJob, JobLock, LockSubIdPolicy, ReleaseBackgroundJob};
pub use store::{MemoryStore, PgStore, Store};
pub use worker::{SweepSummary, Worker};
