//! Worker command construction
//!
//! Builds the tokio `Command` for a worker from the task settings:
//! shell-split arguments, comma-separated environment overrides, the
//! working directory and the dispatcher's marker variables. Workers are
//! placed in their own process group so teardown can signal the whole
//! tree.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::warn;

use crate::protocol::Task;

/// Marker set for every spawned worker
pub const ENV_EXTERNAL: &str = "OPTEX_EXTERNAL";

/// Carries the `persistent` setting value to persistent workers
pub const ENV_PERSISTENT: &str = "OPTEX_EXTERNAL_PERSISTENT";

/// Split an `arguments` setting using shell quoting rules
pub fn split_arguments(arguments: &str) -> Vec<String> {
    match shlex::split(arguments) {
        Some(args) => args,
        None => {
            warn!(arguments, "Ignoring arguments with unbalanced quoting");
            Vec::new()
        }
    }
}

/// Parse an `environment` setting: comma-separated KEY=VALUE entries.
/// An entry without `=` sets the key to the empty string.
pub fn parse_environment(environment: &str) -> Vec<(String, String)> {
    environment
        .split(',')
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (entry.to_string(), String::new()),
        })
        .collect()
}

/// Build the command for an ephemeral worker: piped stdin/stdout,
/// inherited stderr, killed if the dispatcher drops it early.
pub fn ephemeral_command(task: &Task, program: &Path) -> Command {
    let mut command = base_command(task, program, task.setting("environment"));
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    command
}

/// Build the command for a detached persistent worker: no pipes, and the
/// worker outlives the dispatcher.
pub fn persistent_command(task: &Task, program: &Path) -> Command {
    // persistent-env replaces environment when present
    let env_setting = task
        .setting("persistent-env")
        .or_else(|| task.setting("environment"));

    let mut command = base_command(task, program, env_setting);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    if let Some(persistent) = task.persistent() {
        command.env(ENV_PERSISTENT, persistent);
    }

    command
}

fn base_command(task: &Task, program: &Path, env_setting: Option<&str>) -> Command {
    let mut command = Command::new(program);

    if let Some(arguments) = task.setting("arguments") {
        command.args(split_arguments(arguments));
    }

    if let Some(environment) = env_setting {
        for (key, value) in parse_environment(environment) {
            command.env(key, value);
        }
    }

    command.env(ENV_EXTERNAL, "yes");

    if let Some(dir) = task.working_directory() {
        command.current_dir(dir);
    }

    // Own process group, so group signals reach worker children too
    command.process_group(0);

    command
}
