//! Persistent worker connection
//!
//! A persistent worker is a long-lived server the orchestrator shares
//! across many tasks. Each task run dials the worker's socket, retrying
//! while the worker comes up, and spawns the worker itself at most once
//! if nothing is listening yet. The first response ends the exchange and
//! the worker is left running for the next task.

use std::path::Path;

use backoff::backoff::{Backoff, Constant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::Child;
use tracing::{debug, error, info, warn};

use crate::dispatch::{DispatchState, ExternalDispatcher};
use crate::error::{Error, ErrorCode, Result};
use crate::protocol::{encode_task_bytes, Response, ResponseDecoder, Task, WireMode};
use crate::worker::{persistent_command, Terminator};

/// Set by the orchestrator when it runs several workers side by side;
/// offsets the port a numeric `persistent` setting names.
pub const ENV_WORKER_INDEX: &str = "OPTEX_WORKER_INDEX";

/// Turn the `persistent` setting into a socket address.
///
/// A purely numeric value is a port on localhost, shifted by the worker
/// index when the environment carries one. Anything else is used as a
/// `host:port` address verbatim.
pub fn derive_address(persistent: &str) -> Result<String> {
    let index = std::env::var(ENV_WORKER_INDEX)
        .ok()
        .and_then(|raw| raw.trim().parse::<u32>().ok())
        .unwrap_or(0);
    derive_address_with_index(persistent, index)
}

fn derive_address_with_index(persistent: &str, index: u32) -> Result<String> {
    if persistent.is_empty() || !persistent.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(persistent.to_string());
    }

    let base: u32 = persistent
        .parse()
        .map_err(|_| Error::bad_address(persistent, "port out of range"))?;
    let port = base
        .checked_add(index)
        .filter(|p| (1..=u16::MAX as u32).contains(p))
        .ok_or_else(|| {
            Error::bad_address(persistent, format!("port with worker index {} out of range", index))
        })?;

    Ok(format!("127.0.0.1:{}", port))
}

impl ExternalDispatcher {
    pub(crate) async fn run_persistent(
        &mut self,
        task: &Task,
        program: &Path,
        persistent: &str,
    ) -> Option<Response> {
        let address = match derive_address(persistent) {
            Ok(address) => address,
            Err(e) => {
                error!(error = %e.format_for_log(), "Bad persistent address");
                self.record_failure(&e);
                return Some(Response::dispatcher_failure(e.to_string()));
            }
        };

        let mode = WireMode::for_task(task);
        let encoded = match encode_task_bytes(task, mode) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.record_failure(&e);
                return Some(Response::dispatcher_failure(e.to_string()));
            }
        };

        let terminator = Terminator::new(self.config.launch.terminate_grace());
        let mut stop = self.stop.clone();

        // Workers we spawn ourselves are torn down again unless they
        // deliver a response. Workers someone else started are never
        // touched.
        let mut spawned: Option<Child> = None;

        let attempts = self.config.connect.attempts.max(1);
        let per_attempt = self.config.connect.timeout();
        let mut pause = Constant::new(self.config.connect.retry_interval());

        let mut stream = None;
        for attempt in 1..=attempts {
            match tokio::time::timeout(per_attempt, TcpStream::connect(&address)).await {
                Ok(Ok(connected)) => {
                    debug!(address = %address, attempt, "Connected to persistent worker");
                    stream = Some(connected);
                    break;
                }
                Ok(Err(e)) => {
                    debug!(address = %address, attempt, error = %e, "Connect attempt failed")
                }
                Err(_) => {
                    let e = Error::ConnectTimeout {
                        address: address.clone(),
                        timeout_ms: self.config.connect.timeout_ms,
                    };
                    debug!(attempt, error = %e.format_for_log(), "Connect attempt timed out");
                }
            }

            if spawned.is_none() {
                match persistent_command(task, program).spawn() {
                    Ok(child) => {
                        info!(pid = ?child.id(), address = %address, "Spawned persistent worker");
                        spawned = Some(child);

                        if let Some(delay) = task.startup_delay() {
                            debug!(delay_ms = delay.as_millis() as u64, "Waiting out worker startup delay");
                            tokio::select! {
                                () = tokio::time::sleep(delay) => {}
                                () = stop.stopped() => {
                                    teardown(&terminator, &mut spawned).await;
                                    return None;
                                }
                            }
                        }
                    }
                    Err(source) => {
                        let e = Error::SpawnFailed {
                            program: program.to_path_buf(),
                            source,
                        };
                        error!(error = %e.format_for_log(), "Could not launch persistent worker");
                        self.record_failure(&e);
                        return Some(Response::dispatcher_failure(e.to_string()));
                    }
                }
            }

            if attempt < attempts {
                if let Some(delay) = pause.next_backoff() {
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = stop.stopped() => {
                            teardown(&terminator, &mut spawned).await;
                            return None;
                        }
                    }
                }
            }
        }

        let Some(stream) = stream else {
            teardown(&terminator, &mut spawned).await;
            let e = Error::ConnectExhausted {
                address: address.clone(),
                attempts,
            };
            error!(error = %e.format_for_log(), "Giving up on persistent worker");
            self.record_failure(&e);
            return Some(Response::dispatcher_failure(e.to_string()));
        };

        self.set_state(DispatchState::AwaitingResponse);

        let (mut reader, mut writer) = stream.into_split();

        if let Err(e) = writer.write_all(&encoded).await {
            self.record_failure_code(ErrorCode::ConnectFailed);
            teardown(&terminator, &mut spawned).await;
            return Some(Response::dispatcher_failure(format!(
                "could not send task to worker at {}: {}",
                address, e
            )));
        }
        if let Err(e) = writer.flush().await {
            self.record_failure_code(ErrorCode::ConnectFailed);
            teardown(&terminator, &mut spawned).await;
            return Some(Response::dispatcher_failure(format!(
                "could not send task to worker at {}: {}",
                address, e
            )));
        }
        if mode == WireMode::Text {
            // A text task is delimited by end of stream, so close our
            // write half; the frame of a binary task delimits itself.
            if let Err(e) = writer.shutdown().await {
                warn!(error = %e, "Could not close write half of worker socket");
            }
        }

        let mut decoder = ResponseDecoder::new(mode);
        let mut buf = vec![0u8; 4096];

        loop {
            tokio::select! {
                biased;

                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        self.record_failure_code(ErrorCode::ConnectFailed);
                        teardown(&terminator, &mut spawned).await;
                        return Some(Response::dispatcher_failure(format!(
                            "worker at {} closed the connection before responding",
                            address
                        )));
                    }
                    Ok(n) => match decoder.feed(&buf[..n]) {
                        Ok(mut decoded) => {
                            if decoded.len() > 1 {
                                warn!(
                                    task_id = task.id,
                                    extra = decoded.len() - 1,
                                    "Discarding extra responses from worker"
                                );
                            }
                            if let Some(response) = decoded.drain(..).next() {
                                // The worker stays up for the next task;
                                // dropping the socket is the goodbye.
                                return Some(response);
                            }
                        }
                        Err(e) => {
                            error!(error = %e.format_for_log(), "Worker sent an undecodable response");
                            self.record_failure(&e);
                            teardown(&terminator, &mut spawned).await;
                            return Some(Response::dispatcher_failure(e.to_string()));
                        }
                    },
                    Err(e) => {
                        self.record_failure_code(ErrorCode::ConnectFailed);
                        teardown(&terminator, &mut spawned).await;
                        return Some(Response::dispatcher_failure(format!(
                            "error reading from worker at {}: {}",
                            address, e
                        )));
                    }
                },

                () = stop.stopped() => {
                    info!(task_id = task.id, "Stop requested, abandoning persistent task");
                    teardown(&terminator, &mut spawned).await;
                    return None;
                }
            }
        }
    }
}

/// Kill a worker we spawned this run, if any.
async fn teardown(terminator: &Terminator, spawned: &mut Option<Child>) {
    if let Some(child) = spawned.as_mut() {
        if let Err(e) = terminator.terminate(child).await {
            warn!(error = %e.format_for_log(), "Worker teardown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::dispatch::stop_channel;
    use crate::protocol::{encode_envelope, Envelope, FailureKind, Fitness};

    fn fast_config(attempts: u32) -> DispatchConfig {
        let mut config = DispatchConfig::default();
        config.connect.attempts = attempts;
        config.connect.retry_interval_ms = 10;
        config.connect.timeout_ms = 500;
        config.launch.terminate_grace_ms = 50;
        config
    }

    fn dispatcher(attempts: u32) -> ExternalDispatcher {
        dispatcher_with(fast_config(attempts))
    }

    fn dispatcher_with(config: DispatchConfig) -> ExternalDispatcher {
        // Dropping the handle never fires the token, so tests that do
        // not exercise stop can let it go.
        let (_handle, token) = stop_channel();
        ExternalDispatcher::new(config, token)
    }

    /// Bind a throwaway listener just to find a port nothing listens on.
    async fn closed_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    // ─────────────────────────────────────────────────────────────
    // Address Derivation
    // ─────────────────────────────────────────────────────────────

    #[test]
    fn test_numeric_address_is_localhost_port() {
        assert_eq!(
            derive_address_with_index("9000", 0).unwrap(),
            "127.0.0.1:9000"
        );
    }

    #[test]
    fn test_worker_index_offsets_port() {
        assert_eq!(
            derive_address_with_index("9000", 3).unwrap(),
            "127.0.0.1:9003"
        );
    }

    #[test]
    fn test_non_numeric_address_used_verbatim() {
        assert_eq!(
            derive_address_with_index("worker-host:7777", 5).unwrap(),
            "worker-host:7777"
        );
    }

    #[test]
    fn test_port_zero_rejected() {
        assert!(derive_address_with_index("0", 0).is_err());
    }

    #[test]
    fn test_port_overflow_rejected() {
        assert!(derive_address_with_index("70000", 0).is_err());
        assert!(derive_address_with_index("65535", 1).is_err());
    }

    // ─────────────────────────────────────────────────────────────
    // Connection Runs
    // ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_binary_exchange_with_listening_worker() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Reads the task frame, answers with a success frame, hangs up.
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0);

            let response = Response::success(vec![Fitness::new("speed", 4.2)]);
            let frame = encode_envelope(&Envelope::Response(response)).unwrap();
            socket.write_all(&frame).await.unwrap();
        });

        let task = Task::new(7).with_setting("persistent", port.to_string());
        let mut dispatcher = dispatcher(3);
        let response = dispatcher
            .run_persistent(&task, Path::new("/bin/false"), &port.to_string())
            .await
            .unwrap();

        match response {
            Response::Success { fitness } => {
                assert_eq!(fitness.len(), 1);
                assert_eq!(fitness[0].name, "speed");
            }
            other => panic!("expected success, got {:?}", other),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_text_exchange_closes_write_half() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // A text worker reads the task until EOF, then answers in kind.
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut task_bytes = Vec::new();
            socket.read_to_end(&mut task_bytes).await.unwrap();
            assert!(String::from_utf8_lossy(&task_bytes).contains("setting\tpersistent"));

            socket.write_all(b"success\nspeed 2\n\n").await.unwrap();
        });

        let task = Task::new(7)
            .with_setting("mode", "text")
            .with_setting("persistent", port.to_string());
        let mut dispatcher = dispatcher(3);
        let response = dispatcher
            .run_persistent(&task, Path::new("/bin/false"), &port.to_string())
            .await
            .unwrap();

        assert!(response.is_success());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_gives_up_after_configured_attempts() {
        let port = closed_port().await;
        let task = Task::new(7).with_setting("persistent", port.to_string());

        let mut dispatcher = dispatcher(2);
        let response = dispatcher
            .run_persistent(&task, Path::new("/bin/true"), &port.to_string())
            .await
            .unwrap();

        match response {
            Response::Failed { kind, message } => {
                assert_eq!(kind, FailureKind::Dispatcher);
                assert!(message.contains("2 attempts"), "message: {}", message);
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_spawns_worker_at_most_once() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("spawned");

        let port = closed_port().await;
        let task = Task::new(7)
            .with_setting("persistent", port.to_string())
            .with_setting("arguments", format!("-c 'echo x >> {}'", marker.display()));

        // Slower retries leave the short-lived "worker" time to write
        // its marker before the give-up teardown signals it.
        let mut config = fast_config(4);
        config.connect.retry_interval_ms = 100;
        let mut dispatcher = dispatcher_with(config);
        let response = dispatcher
            .run_persistent(&task, Path::new("/bin/sh"), &port.to_string())
            .await
            .unwrap();
        assert!(!response.is_success());

        let content = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(content, "x\n", "worker spawned more than once");
    }

    #[tokio::test]
    async fn test_eof_before_response_is_dispatcher_fault() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Consume the task so the hangup is a clean EOF, not a reset.
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0);
        });

        let task = Task::new(7).with_setting("persistent", port.to_string());
        let mut dispatcher = dispatcher(3);
        let response = dispatcher
            .run_persistent(&task, Path::new("/bin/false"), &port.to_string())
            .await
            .unwrap();

        match response {
            Response::Failed { kind, message } => {
                assert_eq!(kind, FailureKind::Dispatcher);
                assert!(message.contains("closed the connection"), "message: {}", message);
            }
            other => panic!("expected failure, got {:?}", other),
        }
        server.await.unwrap();
    }
}
