//! CLI command definitions for dispatch-forge.
//!
//! `run` drives the orchestrator with the dry-run dispatcher until Ctrl-C,
//! `plan` prints a slot allocation and `config` prints the effective
//! configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::metrics::{export_metrics, init_metrics, spawn_sink, PrometheusSink, TracingSink};
use crate::orchestrator::Orchestrator;
use crate::scheduler::{
    DemandPrediction, DispatchRequest, DryRunDispatcher, SlotAllocation, SlotOptimizer, SlotOptimizerConfig,
};

/// How long `run` waits for metrics sinks to drain after shutdown.
const SINK_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Distributed job orchestration core with a dry-run dispatcher.
#[derive(Parser)]
#[command(name = "dispatch-forge")]
#[command(about = "Priority job scheduling onto a pool of remote workers")]
#[command(version)]
#[command(
    long_about = "dispatch-forge queues jobs by priority and dispatches them onto registered repository workers.\n\nThe bundled binary uses a dry-run dispatcher that logs every trigger and reports success.\n\nExample usage:\n  dispatch-forge run --repo org/app --dispatch ci.yml --max-parallel 10"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the orchestrator until interrupted.
    Run(RunArgs),

    /// Print a slot allocation plan for a number of pending jobs.
    Plan(PlanArgs),

    /// Print the effective configuration as YAML.
    Config(ConfigArgs),
}

/// Arguments for `dispatch-forge run`.
#[derive(Parser, Debug, Default)]
pub struct RunArgs {
    /// YAML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Repository to register (owner/name). May be repeated.
    #[arg(short, long = "repo")]
    pub repos: Vec<String>,

    /// Workflow to dispatch once on every registered repository at startup.
    #[arg(long)]
    pub dispatch: Option<String>,

    /// Redis URL for queue persistence.
    #[arg(long, env = "DISPATCH_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Mirror the queue to Redis.
    #[arg(long)]
    pub persist: bool,

    /// Maximum number of jobs running at once.
    #[arg(long)]
    pub max_parallel: Option<usize>,

    /// Seconds between polling ticks.
    #[arg(long)]
    pub poll_interval_secs: Option<u64>,

    /// Print Prometheus metrics after shutdown.
    #[arg(long)]
    pub print_metrics: bool,
}

/// Arguments for `dispatch-forge plan`.
#[derive(Parser, Debug)]
pub struct PlanArgs {
    /// Number of jobs waiting for slots.
    #[arg(short, long)]
    pub pending: usize,

    /// Total runner slots.
    #[arg(long, default_value = "10")]
    pub max_slots: usize,

    /// Expected duration of one job in seconds.
    #[arg(long)]
    pub avg_job_secs: Option<u64>,
}

/// Arguments for `dispatch-forge config`.
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// YAML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Write the effective configuration to this file instead of stdout.
    #[arg(short, long)]
    pub write: Option<PathBuf>,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_orchestrator_command(args).await,
        Commands::Plan(args) => run_plan_command(args),
        Commands::Config(args) => run_config_command(args),
    }
}

// ============================================================================
// Run
// ============================================================================

/// Applies `run` flags on top of the loaded configuration.
fn apply_run_overrides(config: &mut OrchestratorConfig, args: &RunArgs) {
    if let Some(url) = &args.redis_url {
        config.redis_url = url.clone();
    }
    if args.persist {
        config.queue.persistence_enabled = true;
    }
    if let Some(max) = args.max_parallel {
        config.supervisor.max_parallel_jobs = max;
    }
    if let Some(secs) = args.poll_interval_secs {
        config.supervisor.polling_interval = Duration::from_secs(secs);
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<OrchestratorConfig> {
    OrchestratorConfig::load(path).context("Failed to load configuration")
}

async fn run_orchestrator_command(args: RunArgs) -> anyhow::Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    apply_run_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    if let Err(e) = init_metrics() {
        warn!(error = %e, "Failed to initialize metrics");
    }

    let orchestrator = Orchestrator::connect(config, Arc::new(DryRunDispatcher::new()))
        .await
        .context("Failed to start orchestrator")?;
    let sinks = [
        spawn_sink(orchestrator.events(), TracingSink::new()),
        spawn_sink(orchestrator.events(), PrometheusSink::new()),
    ];

    orchestrator.register_repositories(&args.repos).await?;
    if let Some(workflow) = &args.dispatch {
        for repo in &args.repos {
            let job_id = orchestrator
                .dispatch(DispatchRequest::new(repo, workflow))
                .await?;
            info!(job_id = %job_id, repo = %repo, workflow = %workflow, "Startup dispatch queued");
        }
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received, shutting down"),
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
        }
        let _ = shutdown_tx.send(());
    });

    orchestrator.run(shutdown_rx).await;
    let report = orchestrator.shutdown().await?;

    // Sinks stop once the last bus sender is dropped.
    drop(orchestrator);
    for sink in sinks {
        if tokio::time::timeout(SINK_DRAIN_TIMEOUT, sink).await.is_err() {
            warn!("Metrics sink did not stop in time");
        }
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    if args.print_metrics {
        println!("{}", export_metrics());
    }
    Ok(())
}

// ============================================================================
// Plan
// ============================================================================

#[derive(Debug, Serialize)]
struct PlanOutput {
    pending_jobs: usize,
    max_slots: usize,
    allocation: SlotAllocation,
    demand: DemandPrediction,
}

fn build_plan(args: &PlanArgs) -> anyhow::Result<PlanOutput> {
    if args.max_slots == 0 {
        anyhow::bail!("--max-slots must be greater than 0");
    }

    let optimizer = SlotOptimizer::new(SlotOptimizerConfig::new(args.max_slots));
    let allocation = optimizer.calculate_allocation(args.pending, args.avg_job_secs.map(Duration::from_secs));

    Ok(PlanOutput {
        pending_jobs: args.pending,
        max_slots: args.max_slots,
        allocation,
        demand: optimizer.predict_demand(),
    })
}

fn run_plan_command(args: PlanArgs) -> anyhow::Result<()> {
    let plan = build_plan(&args)?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

// ============================================================================
// Config
// ============================================================================

fn run_config_command(args: ConfigArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;
    match &args.write {
        Some(path) => {
            config
                .to_file(path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(path = %path.display(), "Configuration written");
        }
        None => print!("{}", config.to_yaml()?),
    }
    Ok(())
}
