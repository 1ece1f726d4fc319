mod budget;
mod command;
mod config;
mod controller;
mod lock;
mod metrics;
mod plateau;
mod signals;
mod status;
mod supervisor;

use budget::ReductionBudget;
use clap::Parser;
use command::{CommandTemplate, TrainingRunSpec};
use config::{ConfigError, SupervisorConfig};
use controller::{ControlLoop, LoopSettings, EXIT_FAILED};
use lock::RunLock;
use metrics::CsvMetricSource;
use status::StatusTracker;
use std::path::PathBuf;
use std::time::Duration;
use supervisor::{OsSupervisor, StopStrategy};

/// Supervise a training process: watch its metric log for a plateau, restart
/// it with a reduced hyperparameter, and stop it once reductions run out.
#[derive(Parser, Debug)]
#[command(name = "plateau-supervisor", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "plateau.toml")]
    config: PathBuf,

    /// Metric column to monitor (overrides config)
    #[arg(long)]
    metric: Option<String>,

    /// Candidate metric log, glob allowed; repeat for fallbacks (overrides config)
    #[arg(long = "metrics-file", value_name = "PATH")]
    metrics_files: Vec<String>,

    /// Minimum improvement over the best that counts as progress
    #[arg(long)]
    min_delta: Option<f64>,

    /// Recent epochs compared against the historical best
    #[arg(long)]
    patience: Option<usize>,

    /// Epochs required before any plateau decision
    #[arg(long)]
    min_epochs: Option<usize>,

    /// Moving-average window over the metric
    #[arg(long)]
    smooth: Option<usize>,

    /// Seconds between checks
    #[arg(long, value_name = "SECS")]
    check_interval: Option<u64>,

    /// Multiplier applied to the hyperparameter on each reduction
    #[arg(long)]
    reduce_factor: Option<f64>,

    /// Reductions allowed before training is stopped
    #[arg(long)]
    max_reductions: Option<u32>,

    /// Hyperparameter value for the first launch
    #[arg(long)]
    initial_value: Option<f64>,

    /// Run the training command through the platform shell
    #[arg(long)]
    shell: bool,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (every transition and metric check)
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,

    /// Training command and its arguments (overrides config)
    #[arg(last = true, value_name = "COMMAND")]
    command: Vec<String>,
}

fn init_logging(cli: &Cli) {
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::new("plateau_supervisor=debug")
    } else if cli.quiet {
        tracing_subscriber::EnvFilter::new("plateau_supervisor=warn")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("plateau_supervisor=info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

/// Load the config file, apply CLI overrides, and validate the result.
fn resolve_config(cli: &Cli) -> Result<SupervisorConfig, ConfigError> {
    let mut config = SupervisorConfig::load(&cli.config)?;

    if let Some((program, args)) = cli.command.split_first() {
        config.training.command = program.clone();
        config.training.args = args.to_vec();
    }
    if cli.shell {
        config.training.shell = true;
    }
    if let Some(v) = cli.initial_value {
        config.training.initial_value = Some(v);
    }
    if let Some(metric) = &cli.metric {
        config.metrics.metric = metric.clone();
    }
    if !cli.metrics_files.is_empty() {
        config.metrics.files = cli.metrics_files.clone();
    }
    if let Some(v) = cli.smooth {
        config.metrics.smooth = v;
    }
    if let Some(v) = cli.min_delta {
        config.plateau.min_delta = v;
    }
    if let Some(v) = cli.patience {
        config.plateau.patience = v;
    }
    if let Some(v) = cli.min_epochs {
        config.plateau.min_epochs = v;
    }
    if let Some(v) = cli.check_interval {
        config.plateau.check_interval_secs = v;
    }
    if let Some(v) = cli.reduce_factor {
        config.reduction.factor = v;
    }
    if let Some(v) = cli.max_reductions {
        config.reduction.max_reductions = v;
    }

    config.validate()?;
    Ok(config)
}

fn print_dry_run(config: &SupervisorConfig) {
    let template = CommandTemplate::from_config(&config.training);
    let spec = TrainingRunSpec::initial(template, config.training.initial_value);
    let supervisor = OsSupervisor::new(StopStrategy::for_host(&config.shutdown));

    println!("plateau-supervisor v{}", env!("CARGO_PKG_VERSION"));
    println!("command:        {}", spec.render().command_line());
    println!("metric:         {}", config.metrics.metric);
    println!("metric logs:    {}", config.metrics.files.join(", "));
    println!("smoothing:      {}", config.metrics.smooth);
    println!(
        "plateau:        min_delta={} patience={} min_epochs={} cooldown={}",
        config.plateau.min_delta,
        config.plateau.patience,
        config.plateau.min_epochs,
        config.plateau.restart_cooldown_epochs
    );
    println!("check every:    {}s", config.plateau.check_interval_secs);
    println!(
        "reduction:      factor={} max={} default={}",
        config.reduction.factor, config.reduction.max_reductions, config.reduction.default_value
    );
    println!("stop strategy:  {:?}", supervisor.strategy());
    println!("stop file:      {}", config.shutdown.stop_file.display());
    println!("status file:    {}", config.status.file.display());
    println!("Dry run: config validated, not running.");
}

/// Run the controller to completion. Returns the process exit status.
async fn run(config: SupervisorConfig) -> i32 {
    let _lock = match RunLock::acquire(&config.status.lock_file) {
        Ok(lock) => lock,
        Err(e) => {
            tracing::error!(error = %e, "cannot start");
            return EXIT_FAILED;
        }
    };

    let stop_file = config.shutdown.stop_file.clone();
    if stop_file.exists() {
        tracing::info!(path = %stop_file.display(), "removing stale stop file");
        if let Err(e) = std::fs::remove_file(&stop_file) {
            tracing::error!(path = %stop_file.display(), error = %e, "failed to remove stale stop file");
            return EXIT_FAILED;
        }
    }

    let mut shutdown = match signals::install(
        Some(stop_file),
        Duration::from_secs(config.shutdown.force_window_secs),
    ) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            return EXIT_FAILED;
        }
    };

    let metrics = CsvMetricSource::new(
        config.metrics.files.clone(),
        config.metrics.metric.clone(),
        config.metrics.smooth,
    );
    let supervisor = OsSupervisor::new(StopStrategy::for_host(&config.shutdown));
    let spec = TrainingRunSpec::initial(
        CommandTemplate::from_config(&config.training),
        config.training.initial_value,
    );
    let budget = ReductionBudget::new(config.reduction.max_reductions);
    let status = StatusTracker::new(config.status.file.clone(), config.reduction.max_reductions);

    tracing::info!(
        metric = %config.metrics.metric,
        max_reductions = config.reduction.max_reductions,
        "plateau-supervisor starting"
    );

    let mut control = ControlLoop::new(
        LoopSettings::from_config(&config),
        metrics,
        supervisor,
        spec,
        budget,
        status,
    );
    let outcome = control.run(&mut shutdown).await;

    tracing::info!(
        reductions = control.budget().used(),
        hyperparameter = ?control.spec().hyperparameter(),
        exit_status = outcome.exit_status(),
        "done"
    );
    outcome.exit_status()
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match resolve_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(EXIT_FAILED);
        }
    };

    if cli.dry_run {
        print_dry_run(&config);
        return;
    }

    let code = run(config).await;
    std::process::exit(code);
}
