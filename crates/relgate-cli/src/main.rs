//! # relgate CLI entry point
//!
//! Parses command-line arguments, initializes logging and configuration,
//! and dispatches to subcommand handlers.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use relgate_cli::connect::run_migrate;
use relgate_cli::release::{
    run_cancel, run_decide, run_events, run_outcomes, run_process, DecideArgs, ReleaseKeyArgs,
};
use relgate_cli::worker::{run_process_pending, run_worker, WorkerArgs};
use relgate_engine::EngineConfig;

/// Release approval processing engine.
///
/// Evaluates the approval rules bound to each release (HTTP API checks,
/// schedule windows, manual sign-off) and records an auditable outcome per
/// rule. Configuration comes from DATABASE_URL and RELGATE_* variables.
#[derive(Parser, Debug)]
#[command(name = "relgate", version, about, long_about = None)]
struct Cli {
    /// Enable verbose output. Repeat for more verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Poll for claimable releases and process them until interrupted.
    Worker(WorkerArgs),

    /// Run a single sweep over claimable releases and exit.
    ProcessPending(WorkerArgs),

    /// Claim one release and run a processing pass over it.
    Process(ReleaseKeyArgs),

    /// Cancel an in-progress release.
    Cancel(ReleaseKeyArgs),

    /// Record a reviewer decision on a manual approval rule.
    Decide(DecideArgs),

    /// Print a release's events with their rule outcomes.
    Events(ReleaseKeyArgs),

    /// Print a release's rule outcomes.
    Outcomes(ReleaseKeyArgs),

    /// Apply database migrations.
    Migrate,
}

fn init_tracing(verbose: u8, json: bool) {
    // RUST_LOG wins over -v when set.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
        0 => EnvFilter::new("info"),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    });

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("invalid configuration: {e}");
            return ExitCode::from(1);
        }
    };
    tracing::debug!(?config, "configuration loaded");

    let result = match &cli.command {
        Commands::Worker(args) => run_worker(args, config).await,
        Commands::ProcessPending(args) => run_process_pending(args, config).await,
        Commands::Process(args) => run_process(args, config).await,
        Commands::Cancel(args) => run_cancel(args, config).await,
        Commands::Decide(args) => run_decide(args, config).await,
        Commands::Events(args) => run_events(args, config).await,
        Commands::Outcomes(args) => run_outcomes(args, config).await,
        Commands::Migrate => run_migrate(&config).await,
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn decide_requires_a_verdict() {
        let parsed = Cli::try_parse_from([
            "relgate", "decide", "--organization", "acme", "--application", "api", "--release", "1",
            "--rule-id", "7", "--reviewer", "alice",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn decide_rejects_both_verdicts() {
        let parsed = Cli::try_parse_from([
            "relgate", "decide", "--organization", "acme", "--application", "api", "--release", "1",
            "--rule-id", "7", "--reviewer", "alice", "--approve", "--reject",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from(["relgate", "process-pending", "-vv", "--log-json", "--batch-size", "4"])
            .unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(cli.log_json);
        match cli.command {
            Commands::ProcessPending(args) => assert_eq!(args.batch_size, Some(4)),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
