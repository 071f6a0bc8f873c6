//! Ephemeral worker lifecycle
//!
//! Spawn the worker with piped stdio, write the task, close stdin and
//! read responses from stdout. After the first response the worker gets
//! a short grace window to exit on its own before it is killed. A
//! worker that dies without responding produces a worker-fault failure.

use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::dispatch::{DispatchState, ExternalDispatcher};
use crate::error::Error;
use crate::protocol::{encode_task_bytes, Response, ResponseDecoder, Task, WireMode};
use crate::worker::{ephemeral_command, Terminator};

/// How the read loop ended
enum Outcome {
    /// Worker responded and exited on its own
    Delivered(Response),
    /// Worker exited without ever responding
    Exited(String),
    /// Worker responded but had to be killed after the linger window
    LingerKill(Response),
    /// Worker sent bytes the decoder rejected
    Undecodable(Error),
    /// A stop request cancelled the task
    Stopped,
}

impl ExternalDispatcher {
    pub(crate) async fn run_ephemeral(&mut self, task: &Task, program: &Path) -> Option<Response> {
        let mode = WireMode::for_task(task);
        let encoded = match encode_task_bytes(task, mode) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.record_failure(&e);
                return Some(Response::dispatcher_failure(e.to_string()));
            }
        };

        let mut child = match ephemeral_command(task, program).spawn() {
            Ok(child) => child,
            Err(source) => {
                let e = Error::SpawnFailed {
                    program: program.to_path_buf(),
                    source,
                };
                error!(error = %e.format_for_log(), "Could not launch worker");
                self.record_failure(&e);
                return Some(Response::dispatcher_failure(e.to_string()));
            }
        };

        info!(pid = ?child.id(), task_id = task.id, "Launched ephemeral worker");

        let terminator = Terminator::new(self.config.launch.terminate_grace());

        // Send the task, then drop stdin so the worker sees EOF
        match child.stdin.take() {
            Some(mut stdin) => {
                if let Err(e) = stdin.write_all(&encoded).await {
                    // A worker may respond without ever reading its input
                    warn!(error = %e, "Could not write task to worker stdin");
                }
            }
            None => {
                let e = Error::PipeUnavailable { which: "stdin" };
                self.record_failure(&e);
                if let Err(kill_err) = terminator.terminate(&mut child).await {
                    warn!(error = %kill_err.format_for_log(), "Worker teardown failed");
                }
                return Some(Response::dispatcher_failure(e.to_string()));
            }
        }

        let Some(mut stdout) = child.stdout.take() else {
            let e = Error::PipeUnavailable { which: "stdout" };
            self.record_failure(&e);
            if let Err(kill_err) = terminator.terminate(&mut child).await {
                warn!(error = %kill_err.format_for_log(), "Worker teardown failed");
            }
            return Some(Response::dispatcher_failure(e.to_string()));
        };

        self.set_state(DispatchState::AwaitingResponse);

        let mut stop = self.stop.clone();
        let mut decoder = ResponseDecoder::new(mode);
        let mut buf = vec![0u8; 4096];

        let mut response: Option<Response> = None;
        let mut pipe_open = true;
        let mut exited: Option<String> = None;

        let linger = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(linger);
        let mut linger_armed = false;

        let outcome = loop {
            // Verdicts are taken between events so a worker that exits
            // right after writing still gets its pipe drained first
            if let Some(status) = exited.as_deref() {
                if let Some(response) = response.take() {
                    break Outcome::Delivered(response);
                }
                if !pipe_open {
                    break Outcome::Exited(status.to_string());
                }
            }

            tokio::select! {
                biased;

                // Response bytes win over exit notifications
                read = stdout.read(&mut buf), if pipe_open => match read {
                    Ok(0) => pipe_open = false,
                    Ok(n) => match decoder.feed(&buf[..n]) {
                        Ok(decoded) => {
                            for item in decoded {
                                if response.is_none() {
                                    response = Some(item);
                                    self.set_state(DispatchState::Lingering);
                                    if !linger_armed {
                                        linger.as_mut().reset(
                                            Instant::now() + self.config.launch.response_linger(),
                                        );
                                        linger_armed = true;
                                    }
                                } else {
                                    warn!(task_id = task.id, "Discarding extra response from worker");
                                }
                            }
                        }
                        Err(e) => break Outcome::Undecodable(e),
                    },
                    Err(e) => {
                        warn!(error = %e, "Error reading worker stdout");
                        pipe_open = false;
                    }
                },

                status = child.wait(), if exited.is_none() => {
                    let described = match status {
                        Ok(status) => describe_status(&status),
                        Err(e) => format!("wait failed: {}", e),
                    };
                    debug!(task_id = task.id, status = %described, "Worker exited");
                    exited = Some(described);
                }

                () = &mut linger, if linger_armed => {
                    if let Some(response) = response.take() {
                        break Outcome::LingerKill(response);
                    }
                    // The linger timer is only armed after a response
                    continue;
                }

                () = stop.stopped() => break Outcome::Stopped,
            }
        };

        match outcome {
            Outcome::Delivered(response) => Some(response),
            Outcome::Exited(status) => {
                debug!(task_id = task.id, "Worker produced no response");
                Some(Response::worker_failure(format!(
                    "worker exited without producing a response ({})",
                    status
                )))
            }
            Outcome::LingerKill(response) => {
                debug!(task_id = task.id, "Response linger expired, killing worker");
                if let Err(e) = terminator.terminate(&mut child).await {
                    warn!(error = %e.format_for_log(), "Worker teardown failed");
                }
                Some(response)
            }
            Outcome::Undecodable(e) => {
                error!(error = %e.format_for_log(), "Worker sent an undecodable response");
                self.record_failure(&e);
                if let Err(kill_err) = terminator.terminate(&mut child).await {
                    warn!(error = %kill_err.format_for_log(), "Worker teardown failed");
                }
                Some(Response::dispatcher_failure(e.to_string()))
            }
            Outcome::Stopped => {
                info!(task_id = task.id, "Stop requested, terminating worker");
                if let Err(e) = terminator.terminate(&mut child).await {
                    warn!(error = %e.format_for_log(), "Worker teardown failed");
                }
                None
            }
        }
    }
}

/// Render an exit status for failure messages
fn describe_status(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    if let Some(code) = status.code() {
        format!("exit code {}", code)
    } else if let Some(signal) = status.signal() {
        format!("terminated by signal {}", signal)
    } else {
        "unknown exit status".to_string()
    }
}
