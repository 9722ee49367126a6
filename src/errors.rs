//! Error taxonomy and categorization.
//!
//! `ErrorKind` is the per-outcome classification; `ConfigError`, `RunError`
//! and `ApiError` are the module-boundary error types the rest of the
//! daemon propagates with `?`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classification of a completed transfer's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    None,
    Timeout,
    Dns,
    Connect,
    Tls,
    InvalidUrl,
    InvalidMethod,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Classify a `reqwest::Error`. Mirrors the decision tree a prior
    /// load-testing tool used for its own `ErrorCategory`, narrowed to this
    /// daemon's smaller taxonomy.
    pub fn from_reqwest_error(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            return ErrorKind::Timeout;
        }
        if error.is_connect() {
            return ErrorKind::Connect;
        }
        if error.is_request() || error.is_body() || error.is_decode() {
            let msg = error.to_string().to_lowercase();
            if msg.contains("dns") || msg.contains("resolve") {
                return ErrorKind::Dns;
            }
            return ErrorKind::Connect;
        }

        let msg = error.to_string().to_lowercase();
        if msg.contains("certificate") || msg.contains("tls") || msg.contains("ssl") {
            ErrorKind::Tls
        } else if msg.contains("dns") || msg.contains("resolve") {
            ErrorKind::Dns
        } else if msg.contains("timeout") {
            ErrorKind::Timeout
        } else if msg.contains("connect") || msg.contains("connection") {
            ErrorKind::Connect
        } else {
            ErrorKind::Internal
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::None => "none",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Dns => "dns",
            ErrorKind::Connect => "connect",
            ErrorKind::Tls => "tls",
            ErrorKind::InvalidUrl => "invalid_url",
            ErrorKind::InvalidMethod => "invalid_method",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Errors raised while loading and validating daemon configuration. Maps to
/// process exit code 1.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },

    #[error("mTLS configuration incomplete: both CLIENT_CERT_PATH and CLIENT_KEY_PATH must be set together, or neither")]
    IncompleteMtls,

    #[error("another loadgend daemon is already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("failed to access lock file at {path}: {message}")]
    LockFileIo { path: String, message: String },
}

/// Fatal run-level failures ("failure to construct a worker at start",
/// "exhaustion of a bounded resource with no recovery path", "unrecoverable
/// aggregator corruption"). A `RunError` transitions a run to `failed`.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("failed to construct worker {worker_id}: {message}")]
    WorkerConstruction { worker_id: usize, message: String },

    #[error("aggregator ingress channel closed unexpectedly")]
    AggregatorChannelClosed,

    #[error("invalid run profile: {0}")]
    InvalidProfile(String),
}

/// Errors the HTTP API surface maps to a JSON body and status code.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("malformed request body: {0}")]
    BadRequest(String),

    #[error("no run with id {0}")]
    RunNotFound(uuid::Uuid),

    #[error("run {0} has already terminated")]
    RunAlreadyTerminal(uuid::Uuid),

    #[error("internal error: {0}")]
    Internal(String),
}
