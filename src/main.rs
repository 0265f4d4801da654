//! mcdiff-chm - resumable transition-matrix and Monte-Carlo diffusion pipeline
//!
//! Reads a TOML pipeline description and brings every (replica, lag time)
//! unit up to a finished production profile, skipping whatever already exists.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use owo_colors::OwoColorize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mcdiff_chm::{ConfigError, FanOutShape, Pipeline, PipelineConfig, PipelineError, PipelineReport};

const EXIT_UNIT_FAILURES: u8 = 1;
const EXIT_CONFIG: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "mcdiff-chm", version)]
#[command(about = "Extract transition matrices and fit diffusion profiles for every replica and lag time")]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every unit that is not finished yet
    Run(RunArgs),
    /// List every unit with the state of its artifacts, without running anything
    Plan {
        /// Pipeline configuration file
        config: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Pipeline configuration file
    config: PathBuf,

    /// Run one unit at a time
    #[arg(long, conflicts_with = "parallel")]
    serial: bool,

    /// Run units concurrently
    #[arg(long)]
    parallel: bool,

    /// Shape of the worker pools
    #[arg(long, value_enum)]
    fanout: Option<FanOutArg>,

    /// Upper bound on the width of each worker pool
    #[arg(long)]
    max_workers: Option<usize>,

    /// Do not write pipeline_report.json
    #[arg(long)]
    no_report: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FanOutArg {
    Flat,
    Nested,
}

impl From<FanOutArg> for FanOutShape {
    fn from(arg: FanOutArg) -> Self {
        match arg {
            FanOutArg::Flat => FanOutShape::Flat,
            FanOutArg::Nested => FanOutShape::Nested,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Plan { config } => plan(&config),
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn configure(args: &RunArgs) -> Result<PipelineConfig, ConfigError> {
    let mut config = PipelineConfig::load(&args.config)?;
    if args.serial {
        config = config.with_parallel(false);
    }
    if args.parallel {
        config = config.with_parallel(true);
    }
    if let Some(fanout) = args.fanout {
        config = config.with_fanout(fanout.into());
    }
    if let Some(max_workers) = args.max_workers {
        config = config.with_max_workers(max_workers)?;
    }
    Ok(config)
}

async fn run(args: RunArgs) -> ExitCode {
    let config = match configure(&args) {
        Ok(config) => config,
        Err(err) => {
            print_error(&err);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let mut pipeline = Pipeline::with_system_runner(config);
    if args.no_report {
        pipeline = pipeline.without_report();
    }

    match pipeline.run().await {
        Ok(report) => {
            print_report(&report);
            if report.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_UNIT_FAILURES)
            }
        }
        Err(err @ (PipelineError::Config(_) | PipelineError::OutputDir { .. })) => {
            print_error(&err);
            ExitCode::from(EXIT_CONFIG)
        }
        Err(err) => {
            print_error(&err);
            ExitCode::from(EXIT_UNIT_FAILURES)
        }
    }
}

fn plan(path: &Path) -> ExitCode {
    let units = match PipelineConfig::load(path).and_then(|config| Pipeline::with_system_runner(config).plan()) {
        Ok(units) => units,
        Err(err) => {
            print_error(&err);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let pending = units.iter().filter(|unit| !unit.is_complete()).count();
    for unit in &units {
        let marks: Vec<String> = unit
            .stages
            .iter()
            .map(|stage| {
                if stage.done {
                    format!("{} {}", "✓".green(), stage.stage)
                } else {
                    format!("{} {}", "·".dimmed(), stage.stage.dimmed())
                }
            })
            .collect();
        let status = match unit.next_stage() {
            None => "done".green().to_string(),
            Some(stage) => format!("next: {}", stage).yellow().to_string(),
        };
        println!("{:<16} {}  {}", unit.unit.to_string(), marks.join("  "), status);
    }
    println!();
    println!("{} of {} units pending", pending, units.len());
    ExitCode::SUCCESS
}

fn print_report(report: &PipelineReport) {
    let elapsed = report.finished_at - report.started_at;
    if report.is_success() {
        println!(
            "{} {} in {}s",
            "✓".green().bold(),
            report.summary(),
            elapsed.num_seconds()
        );
        return;
    }

    println!(
        "{} {} in {}s",
        "✗".red().bold(),
        report.summary(),
        elapsed.num_seconds()
    );
    for failure in &report.failures {
        println!(
            "  {} lag {} {} {}",
            failure.unit.replica_id.bold(),
            failure.unit.lag_time,
            "failed at".red(),
            failure.stage
        );
        println!("    {}", failure.error);
        if let Some(log) = failure.log_path() {
            println!("    log: {}", log.display().cyan());
        }
    }
}

fn print_error(err: &dyn std::error::Error) {
    eprintln!("{} {}", "error:".red().bold(), err);
}
