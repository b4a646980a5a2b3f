//! Keel CLI - dependency-ordered stack set deployment
//!
//! This CLI lets operators:
//! - Deploy a stack set in dependency order with health-gated rolling updates
//! - Preview the change set of one stack
//! - Tear a stack set down in reverse order
//! - Inspect persisted stacks and published exports
//!
//! Exit codes: 0 success, 2 dependency error, 3 review rejected, 4 apply
//! rejected, 5 rolling update failure, 6 teardown blocked, 1 anything else.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;
mod error;
mod gate;
mod output;
mod stackset;

use commands::{deploy, plan, status, teardown, CommandContext};
use config::CliConfig;
use error::CliResult;
use output::{print_error, OutputFormat};

/// Keel CLI application
#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "Keel - dependency-ordered stack set deployment", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "KEEL_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// State directory (overrides state_dir from the config file)
    #[arg(long, env = "KEEL_STATE_DIR", global = true)]
    state_dir: Option<PathBuf>,

    /// Output format (table, json, yaml)
    #[arg(short, long, default_value = "table", global = true)]
    output: OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Deploy a stack set
    Deploy(deploy::DeployArgs),

    /// Show the change set of one stack
    Plan(plan::PlanArgs),

    /// Tear a stack set down
    Teardown(teardown::TeardownArgs),

    /// Show persisted stacks and exports
    Status,

    /// Show effective configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .without_time()
                .with_writer(std::io::stderr),
        )
        .init();

    match run(cli).await {
        Ok(code) => exit_code(code),
        Err(err) => {
            print_error(&err.to_string());
            exit_code(err.exit_code())
        }
    }
}

async fn run(cli: Cli) -> CliResult<i32> {
    let (config, config_path) = CliConfig::load(cli.config.as_deref())?;
    let state_dir = config.state_dir(cli.state_dir.as_deref())?;
    let ctx = CommandContext {
        config,
        config_path,
        state_dir,
    };

    match cli.command {
        Commands::Deploy(args) => deploy::execute(args, &ctx, cli.output).await,
        Commands::Plan(args) => plan::execute(args, &ctx, cli.output).await.map(|_| 0),
        Commands::Teardown(args) => teardown::execute(args, &ctx).await,
        Commands::Status => status::execute(&ctx, cli.output).await.map(|_| 0),
        Commands::Config => {
            match &ctx.config_path {
                Some(path) => println!("Config: {}", path.display()),
                None => println!("Config: (none)"),
            }
            println!("State directory: {}", ctx.state_dir.display());
            let rendered = toml::to_string_pretty(&ctx.config)
                .map_err(|e| error::CliError::Config(e.to_string()))?;
            print!("{}", rendered);
            Ok(0)
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
