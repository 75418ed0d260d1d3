use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about = "Operator CLI for socket-isolated energy measurement")]
pub struct Cli {
    /// Path to a TOML configuration file (defaults to JOULETRACE_CONFIG or built-in defaults).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Measure the idle power of a socket and persist a calibration profile.
    Calibrate {
        #[arg(short, long, default_value_t = 0)]
        socket: u32,

        /// Sampling duration, in seconds.
        #[arg(short, long)]
        duration: Option<f64>,

        /// Refuse to write the profile if CV% exceeds the warning threshold.
        #[arg(long)]
        strict: bool,
    },

    /// Run a measurement request (as JSON) against the isolated socket.
    Measure {
        /// Path to a JSON-encoded MeasurementRequest.
        #[arg(short, long)]
        request: PathBuf,
    },

    /// Print the discovered CPU/socket topology and exit.
    Topology,

    /// Report whether the serialization lock is currently held.
    LockStatus,
}
