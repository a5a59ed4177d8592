use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hostagent")]
#[command(version)]
#[command(about = "Host telemetry agent", long_about = None)]
pub(crate) struct Cli {
    /// Config file. Can also be set via HOSTAGENT_CONFIG env var.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level regardless of RUST_LOG
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the agent in the foreground
    Run,

    /// Send a command to the running agent's control socket
    Control {
        /// Command to send (version, metrics, active_checks, help)
        command: String,
    },

    /// Evaluate one item key locally and print the result
    Test {
        /// Item key, e.g. system.cpu.load[all,avg1]
        key: String,
    },
}
