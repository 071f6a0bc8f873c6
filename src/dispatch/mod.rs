//! Task dispatch
//!
//! One task in, exactly one terminal response out. The dispatcher
//! resolves the worker executable, picks the ephemeral or persistent
//! lifecycle from the task settings, and drives the exchange to a
//! single `Response` whatever the worker does in between.

mod ephemeral;
mod persistent;

pub use persistent::{derive_address, ENV_WORKER_INDEX};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error};

use crate::config::DispatchConfig;
use crate::error::{Error, ErrorCode};
use crate::protocol::{Response, Task};
use crate::worker::resolve_executable;

// ─────────────────────────────────────────────────────────────────
// Stop signalling
// ─────────────────────────────────────────────────────────────────

/// Requests cancellation of the in-flight task
#[derive(Debug)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

/// Observes cancellation requests
#[derive(Debug, Clone)]
pub struct StopToken {
    rx: watch::Receiver<bool>,
}

/// Create a linked stop handle/token pair
pub fn stop_channel() -> (StopHandle, StopToken) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx }, StopToken { rx })
}

impl StopHandle {
    /// Request a stop. Idempotent.
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

impl StopToken {
    /// Whether a stop has been requested
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until a stop is requested. Never resolves if the handle is
    /// dropped without stopping.
    pub async fn stopped(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Handle gone, no stop can arrive anymore
                std::future::pending::<()>().await;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────

/// Progress of a task through the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// No task accepted yet
    Idle,
    /// Resolving the worker executable
    Resolving,
    /// Spawning an ephemeral worker
    Launching,
    /// Reaching a persistent worker
    Connecting,
    /// Task sent, waiting for the response
    AwaitingResponse,
    /// Response delivered, waiting for an ephemeral worker to exit
    Lingering,
    /// Terminal response produced (or the task was cancelled)
    Done,
}

/// Drives one task to its terminal response.
#[async_trait]
pub trait Dispatcher {
    /// Execute the task. Returns `None` only when a stop request
    /// cancelled the task before a response was produced.
    async fn run_task(&mut self, task: &Task) -> Option<Response>;
}

/// Dispatcher that delegates evaluation to an external worker process.
pub struct ExternalDispatcher {
    config: DispatchConfig,
    stop: StopToken,
    state: DispatchState,
    failure: Option<ErrorCode>,
}

impl ExternalDispatcher {
    pub fn new(config: DispatchConfig, stop: StopToken) -> Self {
        Self {
            config,
            stop,
            state: DispatchState::Idle,
            failure: None,
        }
    }

    /// Current progress of the in-flight task
    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// Error code behind a dispatcher-fault response, if the last task
    /// failed on our side. Drives the process exit status.
    pub fn failure_code(&self) -> Option<ErrorCode> {
        self.failure
    }

    fn set_state(&mut self, state: DispatchState) {
        debug!(from = ?self.state, to = ?state, "Dispatch state change");
        self.state = state;
    }

    pub(crate) fn record_failure(&mut self, e: &Error) {
        self.failure = Some(e.code());
    }

    pub(crate) fn record_failure_code(&mut self, code: ErrorCode) {
        self.failure = Some(code);
    }
}

#[async_trait]
impl Dispatcher for ExternalDispatcher {
    async fn run_task(&mut self, task: &Task) -> Option<Response> {
        self.failure = None;
        self.set_state(DispatchState::Resolving);

        let Some(path) = task.path() else {
            self.record_failure_code(ErrorCode::WorkerNotFound);
            self.set_state(DispatchState::Done);
            return Some(Response::dispatcher_failure("task has no `path` setting"));
        };

        let program = match resolve_executable(path, self.config.security.secure) {
            Ok(program) => program,
            Err(e) => {
                error!(error = %e.format_for_log(), "Could not resolve worker executable");
                self.record_failure(&e);
                self.set_state(DispatchState::Done);
                return Some(Response::dispatcher_failure(e.to_string()));
            }
        };

        let response = match task.persistent() {
            Some(persistent) => {
                let persistent = persistent.to_string();
                self.set_state(DispatchState::Connecting);
                self.run_persistent(task, &program, &persistent).await
            }
            None => {
                self.set_state(DispatchState::Launching);
                self.run_ephemeral(task, &program).await
            }
        };

        self.set_state(DispatchState::Done);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FailureKind;

    fn dispatcher() -> ExternalDispatcher {
        let (_handle, token) = stop_channel();
        ExternalDispatcher::new(DispatchConfig::default(), token)
    }

    #[tokio::test]
    async fn test_missing_path_setting_fails() {
        let mut dispatcher = dispatcher();
        let task = Task::new(1);

        let response = dispatcher.run_task(&task).await.unwrap();
        match response {
            Response::Failed { kind, message } => {
                assert_eq!(kind, FailureKind::Dispatcher);
                assert!(message.contains("path"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(dispatcher.state(), DispatchState::Done);
        assert_eq!(dispatcher.failure_code(), Some(ErrorCode::WorkerNotFound));
    }

    #[tokio::test]
    async fn test_unresolvable_path_fails() {
        let mut dispatcher = dispatcher();
        let task = Task::new(1).with_setting("path", "/nonexistent/worker-binary");

        let response = dispatcher.run_task(&task).await.unwrap();
        match response {
            Response::Failed { kind, .. } => assert_eq!(kind, FailureKind::Dispatcher),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_token_signals() {
        let (handle, mut token) = stop_channel();
        assert!(!token.is_stopped());

        handle.stop();
        token.stopped().await;
        assert!(token.is_stopped());

        // Idempotent
        handle.stop();
        assert!(token.is_stopped());
    }

    #[tokio::test]
    async fn test_stop_token_pending_without_stop() {
        let (_handle, mut token) = stop_channel();
        let waited = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            token.stopped(),
        )
        .await;
        assert!(waited.is_err());
    }
}
