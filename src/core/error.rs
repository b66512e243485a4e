use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure of one remote invocation. Scans turn these into an unreachable marker
/// for the machine; they never abort a whole request.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("failed to start ssh: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A single line of remote output that does not fit the expected column layout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}: {line:?}")]
pub struct ParseError {
    pub line: String,
    pub reason: String,
}

impl ParseError {
    pub fn new(line: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            reason: reason.into(),
        }
    }
}

/// Request rejected before any remote call is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("selecting jobs by pid requires exactly one machine, got {0}")]
    PidNeedsSingleMachine(usize),
    #[error("only root can kill jobs of {target} (running as {invoker})")]
    ForeignKillNeedsRoot { invoker: String, target: String },
    #[error("at most {cap} jobs can be dispatched at once, requested {requested}")]
    DispatchCapExceeded { requested: usize, cap: usize },
    #[error("dispatch limit must be at least 1")]
    EmptyDispatch,
    #[error("no such machine group: {0}")]
    UnknownGroup(String),
    #[error("no such machine: {0}")]
    UnknownMachine(String),
    #[error("user '{0}' is not registered")]
    UnregisteredUser(String),
    #[error("invalid machine range {start}..{end}")]
    InvalidRange { start: u32, end: u32 },
    #[error("command must not be empty")]
    EmptyCommand,
    #[error("command already ends with a background modifier '&': {0}")]
    BackgroundModifier(String),
    #[error("invalid time window '{0}'")]
    InvalidTimeWindow(String),
}

/// Unusable registry or configuration. Nothing can proceed without it.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read registry file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed registry file {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid machine entry '{machine}' in {path}: {reason}")]
    InvalidMachine {
        path: PathBuf,
        machine: String,
        reason: String,
    },
    #[error("duplicate machine name '{0}'")]
    DuplicateMachine(String),
}
