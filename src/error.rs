//! Error types for the Optex dispatcher
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - User-friendly messages with suggestions
//! - Error context and chaining
//! - Exit codes for CLI

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for dispatcher operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // Executable resolution errors (2xx)
    WorkerNotFound = 200,
    WorkerNotTrusted = 201,

    // Process errors (3xx)
    SpawnFailed = 300,
    PipeUnavailable = 301,
    SignalFailed = 302,

    // Connection errors (4xx)
    ConnectFailed = 400,
    ConnectTimeout = 401,
    ConnectExhausted = 402,
    BadAddress = 403,

    // Protocol errors (5xx)
    FrameTooLarge = 500,
    EnvelopeMalformed = 501,
    EnvelopeUnexpected = 502,

    // Orchestrator link errors (6xx)
    TaskRead = 600,
    ResponseWrite = 601,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10, // Config errors
            200..=299 => 20, // Resolution errors
            300..=399 => 30, // Process errors
            400..=499 => 40, // Connection errors
            500..=599 => 50, // Protocol errors
            600..=699 => 60, // Orchestrator link errors
            900..=999 => 90, // Internal errors
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reason a resolved executable failed the security policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustViolation {
    /// The resolved path does not exist
    Missing,
    /// The file is not owned by the invoking user
    WrongOwner,
    /// The file lives outside the user's home directory
    OutsideHome,
}

impl fmt::Display for TrustViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            TrustViolation::Missing => "does not exist",
            TrustViolation::WrongOwner => "is not owned by the user",
            TrustViolation::OutsideHome => "is not in the user home directory",
        };
        write!(f, "{}", reason)
    }
}

/// Main error type for the dispatcher
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {}", path.display())]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    // ─────────────────────────────────────────────────────────────
    // Executable Resolution Errors
    // ─────────────────────────────────────────────────────────────

    /// Worker executable could not be located
    #[error("Could not find worker executable: {path}")]
    WorkerNotFound { path: String },

    /// Worker executable failed the security policy
    #[error("Worker executable `{}` {reason}", path.display())]
    WorkerNotTrusted { path: PathBuf, reason: TrustViolation },

    // ─────────────────────────────────────────────────────────────
    // Process Errors
    // ─────────────────────────────────────────────────────────────

    /// Spawning the worker process failed
    #[error("Failed to spawn worker `{}`", program.display())]
    SpawnFailed {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A stdio handle was missing after spawn
    #[error("Worker {which} pipe unavailable after spawn")]
    PipeUnavailable { which: &'static str },

    /// Sending a signal to the worker failed
    #[error("Failed to signal worker process {pid}")]
    SignalFailed {
        pid: i32,
        #[source]
        source: nix::Error,
    },

    // ─────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────

    /// Single connection attempt failed
    #[error("Failed to connect to {address}: {message}")]
    ConnectFailed { address: String, message: String },

    /// Connection attempt timed out
    #[error("Connection to {address} timed out after {timeout_ms}ms")]
    ConnectTimeout { address: String, timeout_ms: u64 },

    /// All connection attempts to a persistent worker failed
    #[error("Could not connect to persistent worker at {address} after {attempts} attempts")]
    ConnectExhausted { address: String, attempts: u32 },

    /// The persistent address could not be derived
    #[error("Invalid persistent worker address `{address}`: {message}")]
    BadAddress { address: String, message: String },

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────

    /// Frame length exceeds the wire limit
    #[error("Frame of {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// Envelope payload failed to decode
    #[error("Malformed envelope: {message}")]
    Envelope {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    /// A well-formed envelope of the wrong kind arrived
    #[error("Unexpected envelope: expected {expected}")]
    EnvelopeUnexpected { expected: &'static str },

    // ─────────────────────────────────────────────────────────────
    // Orchestrator Link Errors
    // ─────────────────────────────────────────────────────────────

    /// Reading the task from the orchestrator failed
    #[error("Failed to read task from orchestrator: {message}")]
    TaskRead {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Writing the response to the orchestrator failed
    #[error("Failed to write response to orchestrator")]
    ResponseWrite {
        #[source]
        source: std::io::Error,
    },

    // ─────────────────────────────────────────────────────────────
    // Generic / Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,

            Error::WorkerNotFound { .. } => ErrorCode::WorkerNotFound,
            Error::WorkerNotTrusted { .. } => ErrorCode::WorkerNotTrusted,

            Error::SpawnFailed { .. } => ErrorCode::SpawnFailed,
            Error::PipeUnavailable { .. } => ErrorCode::PipeUnavailable,
            Error::SignalFailed { .. } => ErrorCode::SignalFailed,

            Error::ConnectFailed { .. } => ErrorCode::ConnectFailed,
            Error::ConnectTimeout { .. } => ErrorCode::ConnectTimeout,
            Error::ConnectExhausted { .. } => ErrorCode::ConnectExhausted,
            Error::BadAddress { .. } => ErrorCode::BadAddress,

            Error::FrameTooLarge { .. } => ErrorCode::FrameTooLarge,
            Error::Envelope { .. } => ErrorCode::EnvelopeMalformed,
            Error::EnvelopeUnexpected { .. } => ErrorCode::EnvelopeUnexpected,

            Error::TaskRead { .. } => ErrorCode::TaskRead,
            Error::ResponseWrite { .. } => ErrorCode::ResponseWrite,

            Error::Io(_) => ErrorCode::InternalError,
            Error::Toml(_) => ErrorCode::ConfigParseError,
            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if the error is retryable (another attempt may succeed)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectFailed { .. } | Error::ConnectTimeout { .. } | Error::Io(_)
        )
    }

    /// Check if the error is fatal (the dispatcher should exit immediately)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::TaskRead { .. }
                | Error::ResponseWrite { .. }
                | Error::Internal(_)
        )
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'optex-dispatch config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'optex-dispatch config validate' to see details."
            ),
            Error::ConfigValidation { .. } => Some(
                "Review the configuration file and fix the invalid values. See documentation for valid options."
            ),

            Error::WorkerNotFound { .. } => Some(
                "Check the 'path' task setting. Bare names are searched on PATH; relative paths resolve against the dispatcher's working directory."
            ),
            Error::WorkerNotTrusted { .. } => Some(
                "Install the worker under /usr or your home directory, or set [security] secure = false to disable the policy."
            ),

            Error::SpawnFailed { .. } => Some(
                "Verify the worker executable has execute permission and its interpreter (shebang) exists."
            ),

            Error::ConnectExhausted { .. } => Some(
                "Check that the persistent worker can start and listen on the derived address. The attempt count is '[connect] attempts' in the configuration."
            ),
            Error::BadAddress { .. } => Some(
                "The 'persistent' setting must be a numeric port or a host:port pair."
            ),

            Error::FrameTooLarge { .. } => Some(
                "The worker sent an oversized frame. Check that it speaks the framed envelope protocol."
            ),
            Error::Envelope { .. } => Some(
                "The worker sent bytes that are not a valid envelope. A text-mode worker needs mode = \"text\" in the task settings."
            ),

            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let code = self.code();
        let suggestion = self.suggestion();

        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            code.as_str(),
            self
        );

        if let Some(hint) = suggestion {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        let code = self.code();
        format!("[{}] {}", code.as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors (for ergonomic error creation)
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config not found error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound {
            path: path.into(),
            source: None,
        }
    }

    /// Create a config parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Error::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config validation error
    pub fn config_validation(message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a worker not found error
    pub fn worker_not_found(path: impl Into<String>) -> Self {
        Error::WorkerNotFound { path: path.into() }
    }

    /// Create a worker not trusted error
    pub fn worker_not_trusted(path: impl Into<PathBuf>, reason: TrustViolation) -> Self {
        Error::WorkerNotTrusted {
            path: path.into(),
            reason,
        }
    }

    /// Create a connect failed error
    pub fn connect_failed(address: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConnectFailed {
            address: address.into(),
            message: message.into(),
        }
    }

    /// Create a bad address error
    pub fn bad_address(address: impl Into<String>, message: impl Into<String>) -> Self {
        Error::BadAddress {
            address: address.into(),
            message: message.into(),
        }
    }

    /// Create a malformed envelope error
    pub fn envelope(message: impl Into<String>) -> Self {
        Error::Envelope {
            message: message.into(),
            source: None,
        }
    }

    /// Create a task read error
    pub fn task_read(message: impl Into<String>) -> Self {
        Error::TaskRead {
            message: message.into(),
            source: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
