//! # Release Subcommands
//!
//! Operate on a single release identified by organization, application and
//! release id.
//!
//! - `process`: claim the release and run one pass.
//! - `cancel`: cancel an in-progress release.
//! - `decide`: record a reviewer decision on a manual rule.
//! - `events` / `outcomes`: print the audit trail as JSON.

use anyhow::{bail, Context, Result};
use clap::Args;
use relgate_core::{NewManualDecision, ReleaseKey, RuleId};
use relgate_engine::EngineConfig;
use serde::Serialize;

use crate::connect::connect_engine;

/// Identifies one release.
#[derive(Args, Debug, Clone)]
pub struct ReleaseKeyArgs {
    /// Organization that owns the application.
    #[arg(long)]
    pub organization: String,
    /// Application the release belongs to.
    #[arg(long)]
    pub application: String,
    /// Release number within the application.
    #[arg(long)]
    pub release: i64,
}

impl ReleaseKeyArgs {
    pub fn key(&self) -> ReleaseKey {
        ReleaseKey::new(self.organization.clone(), self.application.clone(), self.release)
    }
}

/// Arguments for `relgate decide`.
#[derive(Args, Debug)]
pub struct DecideArgs {
    #[command(flatten)]
    pub release: ReleaseKeyArgs,
    /// Manual rule being decided.
    #[arg(long)]
    pub rule_id: i64,
    /// Reviewer identity.
    #[arg(long)]
    pub reviewer: String,
    /// Approve the release.
    #[arg(long, conflicts_with = "reject", required_unless_present = "reject")]
    pub approve: bool,
    /// Reject the release.
    #[arg(long)]
    pub reject: bool,
    /// Free-form reviewer comments.
    #[arg(long)]
    pub comments: Option<String>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn run_process(args: &ReleaseKeyArgs, config: EngineConfig) -> Result<u8> {
    let engine = connect_engine(config).await?;
    let key = args.key();
    let Some(claimed) = engine.store().try_claim(&key).await? else {
        if engine.release(&key).await?.is_none() {
            bail!("release {key} not found");
        }
        tracing::warn!(release = %key, "release is locked by another worker");
        return Ok(2);
    };
    let report = engine
        .process_claimed(claimed)
        .await
        .with_context(|| format!("processing {key} failed"))?;
    print_json(&report)?;
    Ok(0)
}

pub async fn run_cancel(args: &ReleaseKeyArgs, config: EngineConfig) -> Result<u8> {
    let engine = connect_engine(config).await?;
    let key = args.key();
    let release = engine
        .cancel_release(&key)
        .await
        .with_context(|| format!("cannot cancel {key}"))?;
    print_json(&release)?;
    Ok(0)
}

pub async fn run_decide(args: &DecideArgs, config: EngineConfig) -> Result<u8> {
    let engine = connect_engine(config).await?;
    let key = args.release.key();
    let mut decision = if args.reject {
        NewManualDecision::reject(args.reviewer.clone())
    } else {
        NewManualDecision::approve(args.reviewer.clone())
    };
    if let Some(comments) = &args.comments {
        decision = decision.with_comments(comments.clone());
    }
    let recorded = engine
        .record_manual_decision(&key, RuleId(args.rule_id), decision)
        .await
        .with_context(|| format!("cannot record decision on {key}"))?;
    print_json(&recorded)?;
    Ok(0)
}

pub async fn run_events(args: &ReleaseKeyArgs, config: EngineConfig) -> Result<u8> {
    let engine = connect_engine(config).await?;
    let key = args.key();
    if engine.release(&key).await?.is_none() {
        bail!("release {key} not found");
    }
    print_json(&engine.timeline(&key).await?)?;
    Ok(0)
}

pub async fn run_outcomes(args: &ReleaseKeyArgs, config: EngineConfig) -> Result<u8> {
    let engine = connect_engine(config).await?;
    let key = args.key();
    if engine.release(&key).await?.is_none() {
        bail!("release {key} not found");
    }
    print_json(&engine.outcomes(&key).await?)?;
    Ok(0)
}
