//! Task and response definitions
//!
//! The data model exchanged between the orchestrator, the dispatcher and
//! the worker. Serialized as JSON inside framed envelopes on the binary
//! wire; rendered as tab-separated lines in text mode.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────
// Task
// ─────────────────────────────────────────────────────────────────

/// A single key/value task setting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
    /// Setting key (case-sensitive)
    pub key: String,

    /// Setting value
    pub value: String,
}

/// A named parameter with its value and bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    /// Parameter name
    pub name: String,

    /// Current value
    pub value: f64,

    /// Lower bound
    pub min: f64,

    /// Upper bound
    pub max: f64,
}

/// One unit of work handed to the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task identifier assigned by the orchestrator
    pub id: u32,

    /// Ordered settings; duplicate keys are allowed and preserved
    #[serde(default)]
    pub settings: Vec<Setting>,

    /// Parameters to evaluate
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

impl Task {
    /// Create an empty task
    pub fn new(id: u32) -> Self {
        Self {
            id,
            settings: Vec::new(),
            parameters: Vec::new(),
        }
    }

    /// Append a setting (builder style)
    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.push(Setting {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Append a parameter (builder style)
    pub fn with_parameter(mut self, name: impl Into<String>, value: f64, min: f64, max: f64) -> Self {
        self.parameters.push(Parameter {
            name: name.into(),
            value,
            min,
            max,
        });
        self
    }

    /// Look up a setting by key. Returns the first match; lookups are
    /// case-sensitive.
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings
            .iter()
            .find(|s| s.key == key)
            .map(|s| s.value.as_str())
    }

    /// Worker executable path from the `path` setting
    pub fn path(&self) -> Option<&str> {
        self.setting("path")
    }

    /// Whether the task requests the text wire format (`mode = "text"`)
    pub fn text_mode(&self) -> bool {
        self.setting("mode").map(|m| m == "text").unwrap_or(false)
    }

    /// The `persistent` setting, if present and non-empty
    pub fn persistent(&self) -> Option<&str> {
        self.setting("persistent").filter(|v| !v.is_empty())
    }

    /// Working directory for the spawned worker
    pub fn working_directory(&self) -> Option<&str> {
        self.setting("working-directory").filter(|v| !v.is_empty())
    }

    /// Startup delay to honor after spawning a persistent worker
    pub fn startup_delay(&self) -> Option<Duration> {
        self.setting("startup-delay")
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|secs| *secs > 0.0)
            .map(Duration::from_secs_f64)
    }
}

// ─────────────────────────────────────────────────────────────────
// Response
// ─────────────────────────────────────────────────────────────────

/// Which side is at fault for a failed task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// The dispatcher could not resolve, launch, reach or understand
    /// the worker
    Dispatcher,

    /// The worker itself failed (e.g. exited without a response)
    Worker,
}

/// A single named fitness value reported by the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fitness {
    /// Fitness name (e.g. "speed", "distance")
    pub name: String,

    /// Fitness value
    pub value: f64,
}

impl Fitness {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Terminal outcome of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Response {
    /// The worker evaluated the task
    Success {
        /// Reported fitness values
        #[serde(default)]
        fitness: Vec<Fitness>,
    },

    /// The task could not be evaluated
    Failed {
        /// Who is at fault
        kind: FailureKind,

        /// Human-readable description
        message: String,
    },
}

impl Response {
    /// Create a success response
    pub fn success(fitness: Vec<Fitness>) -> Self {
        Response::Success { fitness }
    }

    /// Create a failed response
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Response::Failed {
            kind,
            message: message.into(),
        }
    }

    /// Create a dispatcher-fault response
    pub fn dispatcher_failure(message: impl Into<String>) -> Self {
        Response::failed(FailureKind::Dispatcher, message)
    }

    /// Create a worker-fault response
    pub fn worker_failure(message: impl Into<String>) -> Self {
        Response::failed(FailureKind::Worker, message)
    }

    /// Whether this is a success response
    pub fn is_success(&self) -> bool {
        matches!(self, Response::Success { .. })
    }
}
