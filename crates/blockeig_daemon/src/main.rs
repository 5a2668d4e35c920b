pub mod config;
pub mod control_loop;
pub mod matrix;
pub mod stats;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use blockeig_core::EngineConfig;
use clap::parser::ValueSource;
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser, Subcommand};
use tracing::{error, info};

use crate::config::{Config, LoggingConfig};
use crate::control_loop::ControlLoop;

#[derive(Parser)]
#[command(name = "blockeig")]
#[command(about = "Block-parallel power iteration with adaptive convergence control")]
struct Cli {
    /// Engine flags given explicitly override the config file
    #[command(flatten)]
    engine: EngineConfig,

    /// Config file (defaults to ~/.blockeig/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level override
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Solve the synthetic matrix once per control tick
    Run {
        /// Number of control ticks
        #[arg(long, default_value_t = 10)]
        ticks: u64,
        /// Seed of the synthetic matrix
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Pause between ticks (ms)
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
        /// Write a JSON run summary here
        #[arg(long)]
        stats: Option<PathBuf>,
    },
    /// Write the default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration as TOML
    ShowConfig,
}

/// Flag ids of `EngineConfig`, as derived by clap.
const ENGINE_FLAGS: [&str; 10] = [
    "lanes",
    "spare_lanes",
    "queue_depth",
    "buffer_capacity",
    "retry_budget",
    "base_threshold",
    "base_learning_rate",
    "max_iterations",
    "deadline_ms",
    "redo_limit",
];

fn from_command_line(matches: &ArgMatches, id: &str) -> bool {
    matches!(matches.value_source(id), Some(ValueSource::CommandLine))
}

/// Start from the file's engine section and apply flags the user typed.
fn merge_engine(file: EngineConfig, cli: &EngineConfig, matches: &ArgMatches) -> EngineConfig {
    let mut merged = file;
    for id in ENGINE_FLAGS.iter().filter(|id| from_command_line(matches, id)) {
        match *id {
            "lanes" => merged.lanes = cli.lanes,
            "spare_lanes" => merged.spare_lanes = cli.spare_lanes,
            "queue_depth" => merged.queue_depth = cli.queue_depth,
            "buffer_capacity" => merged.buffer_capacity = cli.buffer_capacity,
            "retry_budget" => merged.retry_budget = cli.retry_budget,
            "base_threshold" => merged.base_threshold = cli.base_threshold,
            "base_learning_rate" => merged.base_learning_rate = cli.base_learning_rate,
            "max_iterations" => merged.max_iterations = cli.max_iterations,
            "deadline_ms" => merged.deadline_ms = cli.deadline_ms,
            "redo_limit" => merged.redo_limit = cli.redo_limit,
            _ => {}
        }
    }
    merged
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("reading config {}", path.display())),
        None => Config::load(),
    }
}

fn init_logging(logging: &LoggingConfig, level_override: Option<&str>) -> anyhow::Result<()> {
    let name = level_override.unwrap_or(&logging.level);
    let level: tracing::Level = name
        .parse()
        .map_err(|_| anyhow::anyhow!("unknown log level {name:?}"))?;

    let builder = tracing_subscriber::fmt().with_max_level(level);
    // `try_init` also routes the core's `log` records into the subscriber.
    let installed = if logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("setting default subscriber failed: {e}"))
}

fn init_config(path: Option<&Path>, force: bool) -> anyhow::Result<()> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(Config::get_config_path);
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Config::default().save_to(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

fn run(
    config: Config,
    ticks: u64,
    seed: u64,
    interval_ms: u64,
    stats: Option<PathBuf>,
) -> anyhow::Result<()> {
    config.validate()?;
    info!(
        engine = ?config.engine,
        matrix = ?config.matrix,
        "Starting control loop"
    );

    let mut runner = ControlLoop::new(
        config.engine,
        config.matrix,
        seed,
        Duration::from_millis(interval_ms),
    )?;
    let summary = runner.run(ticks)?;

    println!(
        "{} ticks | {} converged | mean iterations {:.1}",
        summary.ticks.len(),
        summary.converged(),
        summary.mean_iterations()
    );
    if let Some(last) = summary.ticks.last() {
        println!("dominant eigenvalue ~ {:.6}", last.eigenvalue);
    }

    if let Some(path) = stats {
        summary
            .save(&path)
            .with_context(|| format!("writing stats {}", path.display()))?;
        info!(path = %path.display(), "Stats written");
    }
    Ok(())
}

fn execute(cli: Cli, matches: &ArgMatches) -> anyhow::Result<()> {
    if let Commands::InitConfig { force } = cli.command {
        return init_config(cli.config.as_deref(), force);
    }

    let mut config = load_config(cli.config.as_deref())?;
    config.engine = merge_engine(config.engine, &cli.engine, matches);
    init_logging(&config.logging, cli.log_level.as_deref())?;

    match cli.command {
        Commands::Run {
            ticks,
            seed,
            interval_ms,
            stats,
        } => run(config, ticks, seed, interval_ms, stats),
        Commands::ShowConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::InitConfig { .. } => Ok(()),
    }
}

fn main() {
    let matches = Cli::command().get_matches();
    let cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(e) => e.exit(),
    };

    if let Err(e) = execute(cli, &matches) {
        error!(error = %e, "Fatal Error");
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
