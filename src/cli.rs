//! CLI argument parsing using clap v4
//!
//! Defines the command-line interface for the dispatch adapter.

use clap::{Parser, Subcommand, ValueEnum};

/// OptEx Dispatch - External worker adapter
///
/// Receives one optimization task from the orchestrator on stdin,
/// launches or reuses the worker executable the task names, and reports
/// the worker's response on stdout.
#[derive(Parser, Debug)]
#[command(name = "optex-dispatch")]
#[command(author, version, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to configuration file
    #[arg(long, env = "OPTEX_CONFIG", global = true)]
    pub config: Option<String>,

    /// Write logs to this file in addition to stderr
    #[arg(long, env = "OPTEX_LOG_FILE", global = true)]
    pub log_file: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the dispatcher
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve one task: read it from stdin, run the worker, answer on stdout
    Run {
        /// Override the wire format the task requested (for worker testing)
        #[arg(long, value_enum)]
        mode: Option<ModeOverride>,
    },

    /// Resolve a worker executable under the security policy and report the verdict
    Check {
        /// Executable name or path, as a task's `path` setting would carry it
        path: String,
    },

    /// Display version and build information
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

/// Wire format override for `run --mode`
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeOverride {
    /// Tab-separated text lines
    Text,
    /// Length-framed JSON envelopes
    Binary,
}

impl ModeOverride {
    /// The `mode` setting value this override stands for
    pub fn as_setting(&self) -> &'static str {
        match self {
            ModeOverride::Text => "text",
            ModeOverride::Binary => "binary",
        }
    }
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the current configuration
    Show,

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate,
}
