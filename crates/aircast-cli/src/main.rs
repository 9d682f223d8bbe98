//! aircast unified CLI.
//!
//! Timed event broadcasting for the airport simulation platform.
//!
//! # Quick Start
//!
//! ```bash
//! # Declare a queue (the control plane is the store)
//! aircast queue create wire
//!
//! # Run the broadcaster daemon
//! aircast start
//!
//! # Replay yesterday's traffic at double speed
//! aircast queue reset wire --speed 2 --start 2026-07-31T06:00:00+00:00
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// aircast - timed event broadcasting for airport simulation.
#[derive(Parser)]
#[command(name = "aircast")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory holding aircast.toml (defaults to the current dir).
    #[arg(short = 'C', long, global = true)]
    config_dir: Option<String>,

    /// Store URL, overriding the configuration.
    #[arg(short = 'u', long, global = true)]
    store_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broadcaster daemon until interrupted.
    Start,

    /// Queue management commands.
    #[command(subcommand)]
    Queue(QueueCommands),
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Declare a new queue (or overwrite an existing one).
    Create {
        /// Queue name.
        name: String,

        /// Formatter identifier consumers use for this queue's payloads.
        #[arg(short, long, default_value = "wire")]
        formatter: String,

        /// Clock speed multiplier (1.0 = real time).
        #[arg(short, long, default_value_t = 1.0)]
        speed: f64,

        /// Queue-time origin as an ISO-8601 timestamp (defaults to now).
        #[arg(long)]
        start: Option<String>,

        /// Declare the queue without starting its broadcaster.
        #[arg(long)]
        stopped: bool,
    },

    /// List declared queues.
    List,

    /// Reconfigure a queue (speed, start time, run state).
    Reset {
        /// Queue name.
        name: String,

        /// New clock speed multiplier.
        #[arg(short, long)]
        speed: Option<f64>,

        /// New queue-time origin as an ISO-8601 timestamp.
        #[arg(long)]
        start: Option<String>,

        /// Stop the queue's broadcaster.
        #[arg(long, conflicts_with = "run")]
        stop: bool,

        /// Start the queue's broadcaster.
        #[arg(long)]
        run: bool,
    },

    /// Delete a queue and its pending entries.
    Delete {
        /// Queue name.
        name: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = commands::load_config(cli.config_dir.as_deref(), cli.store_url)?;

    match cli.command {
        Commands::Start => commands::start::run(&config),
        Commands::Queue(command) => match command {
            QueueCommands::Create {
                name,
                formatter,
                speed,
                start,
                stopped,
            } => commands::queue::create(&config, &name, &formatter, speed, start, stopped),
            QueueCommands::List => commands::queue::list(&config),
            QueueCommands::Reset {
                name,
                speed,
                start,
                stop,
                run,
            } => commands::queue::reset(&config, &name, speed, start, stop, run),
            QueueCommands::Delete { name } => commands::queue::delete(&config, &name),
        },
    }
}
