use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Calendar notification CLI arguments
#[derive(Debug, Parser)]
#[command(
    name = "calendar",
    version,
    about = "Dispatches and delivers calendar event notifications"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Event storage backend (memory or sql)
    #[arg(long, global = true)]
    pub storage: Option<String>,

    /// Database URL for the sql backend
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// AMQP broker URL
    #[arg(long, global = true)]
    pub amqp_url: Option<String>,

    /// Log filter used when RUST_LOG is unset (e.g. info, debug)
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
pub enum Command {
    /// Publish due event notifications on a timer
    Scheduler {
        /// Seconds between dispatch ticks
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Consume and handle published notifications
    Sender {
        /// Number of concurrent consumer workers
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Apply database migrations and exit
    Migrate {
        /// Load migrations from this directory instead of the built-in set
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}
