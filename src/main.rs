//! OptEx Dispatch - External worker adapter
//!
//! This is the main entry point for the dispatcher binary. The
//! orchestrator starts one dispatcher per task; the dispatcher reads the
//! task from stdin, launches or reuses the worker executable the task
//! names, and writes the single terminal response back on stdout.

mod cli;
mod config;
mod dispatch;
mod error;
mod logging;
mod orchestrator;
mod protocol;
mod version;
mod worker;

use clap::Parser;
use tracing::{error, info, warn};

use crate::cli::{Cli, Commands, ConfigSubcommand, ModeOverride};
use crate::config::DispatchConfig;
use crate::dispatch::{stop_channel, Dispatcher, ExternalDispatcher, StopHandle};
use crate::error::{Error, Result};
use crate::protocol::Setting;
use crate::worker::resolve_executable;

fn main() -> Result<()> {
    // Parse CLI arguments first (before logging, so we know verbosity)
    let cli = Cli::parse();

    // For commands that don't need full logging, use simple setup
    match &cli.command {
        Commands::Version => {
            version::print_version();
            return Ok(());
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            return handle_config_command(subcommand.clone(), cli.config.as_deref());
        }
        _ => {}
    }

    // Load config (or use defaults)
    let mut config = match DispatchConfig::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprint!("{}", e.format_for_terminal());
            std::process::exit(e.exit_code());
        }
    };

    // --log-file wins over the configuration file
    if let Some(log_file) = &cli.log_file {
        config.logging.file = Some(log_file.clone());
    }

    // Initialize logging with config settings.
    // The guards must be kept alive for the lifetime of the program.
    let _log_guards = logging::init_logging(&config.logging, cli.verbose, cli.quiet)?;

    // Log version info at startup
    let build = version::build_info();
    info!(
        version = %build.full_version(),
        target = %build.target,
        profile = %build.profile,
        "Starting OptEx dispatcher"
    );

    // Execute the appropriate command
    match cli.command {
        Commands::Run { mode } => run_dispatch(config, mode),
        Commands::Check { path } => run_check(&config, &path),
        Commands::Version | Commands::Config { .. } => {
            // Already handled above
            unreachable!();
        }
    }
}

/// Serve one task end to end on a single-threaded runtime
fn run_dispatch(config: DispatchConfig, mode: Option<ModeOverride>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    runtime.block_on(serve_one_task(config, mode))
}

/// The dispatcher's whole life: one task in, one response out
async fn serve_one_task(config: DispatchConfig, mode: Option<ModeOverride>) -> Result<()> {
    let (stop_handle, stop_token) = stop_channel();
    tokio::spawn(watch_signals(stop_handle));

    let mut stdin = tokio::io::stdin();
    let mut task = match orchestrator::read_task(&mut stdin).await {
        Ok(task) => task,
        Err(e) => {
            error!(error = %e.format_for_log(), "Could not read task from orchestrator");
            std::process::exit(e.exit_code());
        }
    };

    if let Some(mode) = mode {
        // Setting lookups take the first match, so prepending makes the
        // override win over whatever the task asked for
        task.settings.insert(
            0,
            Setting {
                key: "mode".to_string(),
                value: mode.as_setting().to_string(),
            },
        );
        info!(mode = mode.as_setting(), "Wire mode forced from the command line");
    }

    let mut dispatcher = ExternalDispatcher::new(config, stop_token);
    let response = match dispatcher.run_task(&task).await {
        Some(response) => response,
        None => {
            info!(task_id = task.id, "Task cancelled by stop request");
            return Ok(());
        }
    };

    let mut sink = orchestrator::ResponseSink::new(tokio::io::stdout());
    if let Err(e) = sink.send(&response).await {
        error!(error = %e.format_for_log(), "Could not deliver the response");
        std::process::exit(e.exit_code());
    }

    if let Some(code) = dispatcher.failure_code() {
        // The orchestrator already has the Failed response; the exit
        // status repeats the verdict for process watchers
        std::process::exit(code.exit_code());
    }

    Ok(())
}

/// Resolve SIGTERM/SIGINT into a stop request
async fn watch_signals(handle: StopHandle) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(error = %e, "Could not install SIGTERM handler");
            return;
        }
    };
    let mut int = match signal(SignalKind::interrupt()) {
        Ok(int) => int,
        Err(e) => {
            warn!(error = %e, "Could not install SIGINT handler");
            return;
        }
    };

    tokio::select! {
        _ = term.recv() => info!("SIGTERM received"),
        _ = int.recv() => info!("SIGINT received"),
    }
    handle.stop();
}

/// Resolve a worker executable the way a task's `path` setting would be
fn run_check(config: &DispatchConfig, path: &str) -> Result<()> {
    match resolve_executable(path, config.security.secure) {
        Ok(resolved) => {
            println!("OK: {}", resolved.display());
            Ok(())
        }
        Err(e) => {
            eprint!("{}", e.format_for_terminal());
            std::process::exit(e.exit_code());
        }
    }
}

/// Handle configuration subcommands
fn handle_config_command(subcommand: ConfigSubcommand, config_path: Option<&str>) -> Result<()> {
    match subcommand {
        ConfigSubcommand::Show => {
            let cfg = DispatchConfig::load(config_path)?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            config::init_config(path.as_deref(), force)?;
        }
        ConfigSubcommand::Validate => match DispatchConfig::load(config_path) {
            Ok(_) => {
                println!("Configuration is valid.");
            }
            Err(e) => {
                eprint!("{}", e.format_for_terminal());
                std::process::exit(e.exit_code());
            }
        },
    }

    Ok(())
}
