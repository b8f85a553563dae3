//! # relgate CLI
//!
//! Subcommand handlers for the `relgate` binary. Each handler takes its
//! parsed arguments plus an [`EngineConfig`](relgate_engine::EngineConfig)
//! and returns the process exit code.
//!
//! All commands except `migrate` need a migrated database; `DATABASE_URL`
//! must be set.

pub mod connect;
pub mod release;
pub mod worker;
