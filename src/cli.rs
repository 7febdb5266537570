//! CLI argument parsing for the speed-bump diagnostic tool

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Output format for command reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "speed-bump")]
#[command(version)]
#[command(about = "Selective spin-delay injection: calibration and target diagnostics", long_about = None)]
pub struct Cli {
    /// Enable debug tracing output to stderr
    #[arg(long, global = true)]
    pub debug: bool,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text", global = true)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Measure clock-read overhead and the minimum honorable delay
    Calibrate,

    /// Validate a targets file and optionally test a module/name against it
    Check {
        /// Path to the targets file
        #[arg(value_name = "TARGETS")]
        targets: PathBuf,

        /// Module name to test (dot-separated)
        #[arg(short = 'm', long = "module", requires = "name")]
        module: Option<String>,

        /// Qualified name to test (e.g. LlamaAttention.forward)
        #[arg(short = 'n', long = "name", requires = "module")]
        name: Option<String>,
    },

    /// Run the spin delay repeatedly and report its accuracy
    Delay {
        /// Requested delay in nanoseconds
        #[arg(long = "ns", value_name = "NANOSECONDS")]
        ns: u64,

        /// Number of delays to run
        #[arg(short = 'i', long = "iterations", default_value = "100")]
        iterations: u32,
    },
}
