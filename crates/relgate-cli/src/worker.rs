//! # Worker Subcommands
//!
//! - `worker`: sweep the job queue every poll interval until interrupted.
//! - `process-pending`: run a single sweep and exit.

use anyhow::{Context, Result};
use clap::Args;
use relgate_engine::{EngineConfig, Worker};

use crate::connect::connect_engine;

/// Arguments for `relgate worker`.
#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Seconds between sweeps. Overrides RELGATE_POLL_INTERVAL_SECS.
    #[arg(long)]
    pub poll_interval_secs: Option<u64>,

    /// Maximum jobs claimed per sweep. Overrides RELGATE_CLAIM_BATCH_SIZE.
    #[arg(long)]
    pub batch_size: Option<usize>,
}

impl WorkerArgs {
    fn apply(&self, mut config: EngineConfig) -> EngineConfig {
        if let Some(secs) = self.poll_interval_secs {
            config = config.with_poll_interval(std::time::Duration::from_secs(secs));
        }
        if let Some(size) = self.batch_size {
            config = config.with_claim_batch_size(size);
        }
        config
    }
}

pub async fn run_worker(args: &WorkerArgs, config: EngineConfig) -> Result<u8> {
    let engine = connect_engine(args.apply(config)).await?;
    let worker = Worker::new(engine.clone());

    worker
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {e}");
            }
        })
        .await;

    let counters = engine.metrics().snapshot();
    tracing::info!(
        passes = counters.passes,
        pass_errors = counters.pass_errors,
        rules_processed = counters.rules_processed,
        releases_finalized = counters.releases_finalized,
        "worker stopped"
    );
    Ok(0)
}

pub async fn run_process_pending(args: &WorkerArgs, config: EngineConfig) -> Result<u8> {
    let engine = connect_engine(args.apply(config)).await?;
    let summary = Worker::new(engine)
        .process_pending_once()
        .await
        .context("sweep failed")?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(if summary.failed > 0 { 1 } else { 0 })
}
