//! Timebox CLI
//!
//! A command-line tool for running programs under a wall-clock budget.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use timebox::{BackendKind, CommandEvent, CommandEventStream, CommandSpec, Config, EXAMPLE_CONFIG};
use tracing::{Level, debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code used when the budget elapsed, as in GNU timeout
const EXIT_TIMED_OUT: i32 = 124;

#[derive(Parser)]
#[command(name = "timebox")]
#[command(about = "Run programs under a wall-clock budget")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path (default: timebox.toml)
        #[arg(short, long, default_value = "timebox.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Run a program under the budget, echoing its output live
    Run {
        /// Budget in seconds (default: from configuration)
        #[arg(short, long)]
        budget: Option<f64>,

        /// Input file written to the program's stdin
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Program to run
        #[arg(value_name = "PROGRAM", required = true)]
        program: String,

        /// Arguments passed to the program
        #[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// List timeout backends and their availability
    Backends,

    /// Show the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Load configuration
    let config = if let Some(ref path) = cli.config {
        info!(?path, "loading configuration");
        Config::from_file(path).context("failed to load configuration")?
    } else {
        debug!("using default configuration with environment overrides");
        Config::from_env().context("failed to load configuration from environment")?
    };

    match cli.command {
        Commands::Init { output, force } => init_config(&output, force).await,
        Commands::Run {
            budget,
            input,
            program,
            args,
        } => {
            let code = run_program(&config, budget, input.as_deref(), program, args).await?;
            std::process::exit(code);
        }
        Commands::Backends => {
            list_backends(&config);
            Ok(())
        }
        Commands::ShowConfig => show_config(&config),
    }
}

async fn run_program(
    config: &Config,
    budget: Option<f64>,
    input: Option<&Path>,
    program: String,
    args: Vec<String>,
) -> Result<i32> {
    let config = match budget {
        Some(seconds) => config.clone().with_budget(seconds),
        None => config.clone(),
    };
    let limits = config.limits().context("invalid budget")?;

    let mut spec = CommandSpec::new(program).args(args);
    if let Some(path) = input {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read input file '{}'", path.display()))?;
        spec = spec.input(data);
    }

    info!(program = spec.program(), budget = %limits.budget, "running program");

    let mut stream = CommandEventStream::spawn(spec, limits);
    while let Some(event) = stream.recv().await {
        match event {
            CommandEvent::Stdout(line) => println!("{line}"),
            CommandEvent::Stderr(line) => eprintln!("{line}"),
            CommandEvent::Exited(_) => {}
        }
    }
    let report = stream.finish().await.context("failed to run program")?;

    // Log result via tracing (stderr), keeping stdout clean for piping
    info!(
        exit_code = ?report.exit_code,
        signal = ?report.signal,
        elapsed = format_args!("{:.3}s", report.elapsed.as_secs_f64()),
        "program finished"
    );

    if report.timed_out {
        warn!(budget = %limits.budget, "program took more than its budget and was terminated");
        return Ok(EXIT_TIMED_OUT);
    }
    Ok(match (report.exit_code, report.signal) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    })
}

fn list_backends(config: &Config) {
    println!("Timeout backends:\n");

    for kind in BackendKind::ALL {
        let availability = if kind.is_available() {
            "available"
        } else {
            "unavailable"
        };
        let stops = if kind.guarantees_kill() {
            "kills on timeout"
        } else {
            "cooperative"
        };
        let marker = if kind == config.backend { "*" } else { " " };
        println!("{marker} {:<10} {availability}, {stops}", kind.name());
    }
}

fn show_config(config: &Config) -> Result<()> {
    let limits = config.limits().context("invalid configuration")?;

    println!("Budget: {}", limits.budget);
    println!("Backend: {}", config.backend);
    println!("Kill grace: {:?}", limits.kill_grace);
    println!("Cancel grace: {:?}", limits.cancel_grace);
    println!("Poll interval: {:?}", limits.poll_interval);
    Ok(())
}

async fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}
