//! Worker process teardown
//!
//! Signals SIGTERM to the worker and its process group, waits a short
//! grace period for it to exit, then escalates to SIGKILL. Terminating
//! a process that is already gone is a no-op.

use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Graceful process terminator with a configurable escalation grace.
#[derive(Debug, Clone, Copy)]
pub struct Terminator {
    grace: Duration,
}

impl Terminator {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Terminate the child and its process group, reaping it.
    ///
    /// Sends SIGTERM to the pid and the group, waits up to the grace
    /// period for the child to exit, then sends SIGKILL to both. Safe to
    /// call on a child that already exited.
    pub async fn terminate(&self, child: &mut Child) -> Result<()> {
        let Some(pid) = child.id() else {
            // Already reaped
            return Ok(());
        };

        debug!(pid, "Terminating worker");
        signal_pair(pid, Signal::SIGTERM)?;

        match timeout(self.grace, child.wait()).await {
            Ok(status) => {
                trace!(pid, status = ?status.ok(), "Worker exited within grace period");
            }
            Err(_) => {
                debug!(pid, "Worker survived SIGTERM, escalating to SIGKILL");
                signal_pair(pid, Signal::SIGKILL)?;
                let _ = child.wait().await;
            }
        }

        Ok(())
    }
}

/// Send a signal to a pid and to its process group, ignoring processes
/// that no longer exist.
fn signal_pair(pid: u32, signal: Signal) -> Result<()> {
    let pid = Pid::from_raw(pid as i32);

    match kill(pid, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(source) => {
            return Err(Error::SignalFailed {
                pid: pid.as_raw(),
                source,
            })
        }
    }

    // Workers are spawned as group leaders; signal the group so worker
    // children are reached too
    match killpg(pid, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(source) => {
            return Err(Error::SignalFailed {
                pid: pid.as_raw(),
                source,
            })
        }
    }

    Ok(())
}
