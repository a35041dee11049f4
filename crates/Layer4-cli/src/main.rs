//! Warden CLI - Main entry point

mod cli;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use warden_foundation::SupervisorConfig;
use warden_task::Supervisor;

/// Warden - supervised shell command execution
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a command in the foreground and wait for it
    Run {
        #[command(flatten)]
        spec: CommandSpec,
    },
    /// Show the validator verdict for a command without running it
    Check {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Start a command in the background and poll it to completion
    Bg {
        #[command(flatten)]
        spec: CommandSpec,

        /// Poll interval in milliseconds
        #[arg(long, default_value = "200")]
        poll_ms: u64,
    },
    /// Run commands one after another in a single shell session
    Session {
        /// Session id (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Command lines, one per argument
        #[arg(required = true)]
        commands: Vec<String>,
    },
}

#[derive(clap::Args, Debug)]
struct CommandSpec {
    /// Timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Working directory
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Environment override (repeatable)
    #[arg(short = 'e', long = "env", value_parser = cli::parse_env)]
    env: Vec<(String, String)>,

    /// Keep only output lines matching this regex
    #[arg(long)]
    filter: Option<String>,

    /// Command line passed to the shell
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl From<CommandSpec> for cli::RunOptions {
    fn from(spec: CommandSpec) -> Self {
        cli::RunOptions {
            command: spec.command.join(" "),
            timeout_ms: spec.timeout_ms,
            cwd: spec.cwd,
            env: spec.env,
            filter: spec.filter,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; stdout carries command output
    let log_level = if args.debug { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = SupervisorConfig::load().context("failed to load supervisor configuration")?;
    let supervisor = Supervisor::new(config).context("failed to start supervisor")?;
    tracing::debug!(?args, "Starting");

    let outcome = match args.command {
        Command::Run { spec } => cli::run(&supervisor, spec.into(), args.json).await,
        Command::Check { command } => cli::check(&supervisor, &command.join(" "), args.json),
        Command::Bg { spec, poll_ms } => {
            cli::background(
                &supervisor,
                spec.into(),
                Duration::from_millis(poll_ms.max(10)),
                args.json,
            )
            .await
        }
        Command::Session { id, commands } => {
            cli::session(&supervisor, id, &commands, args.json).await
        }
    };

    supervisor.shutdown().await;
    let code = outcome?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
