//! Error taxonomy for the supervisor.
//!
//! Child-scoped failures (spawn, port resolution) are contained to the child
//! that produced them and end up as that child's `Dead` reason. Only
//! [`ConfigError`] at load and [`SupervisorError::Fault`] stop the process.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Malformed or unreadable service set. Detected before anything is spawned.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("service set is empty")]
    NoServices,

    #[error("service name must not be empty")]
    EmptyName,

    #[error("duplicate service name '{0}'")]
    DuplicateName(String),

    #[error("service '{0}' has an empty command")]
    EmptyCommand(String),

    #[error("service '{name}': desired_port {port} is outside 1..=65535")]
    InvalidPort { name: String, port: u16 },

    #[error("services '{first}' and '{second}' both require exact port {port}")]
    ConflictingExactPort {
        port: u16,
        first: String,
        second: String,
    },

    #[error("service '{name}': invalid health_url '{url}': {reason}")]
    InvalidHealthUrl {
        name: String,
        url: String,
        reason: String,
    },

    #[error("service '{name}': working_directory {path} is not absolute")]
    RelativeWorkingDirectory { name: String, path: PathBuf },

    #[error("service '{name}': {field} must be a non-negative number of seconds in range")]
    InvalidDuration { name: String, field: &'static str },

    #[error("supervisor setting {0} must be greater than zero")]
    InvalidSetting(&'static str),
}

/// The OS refused to create the child process.
#[derive(Debug, Error)]
#[error("failed to spawn '{program}': {source}")]
pub struct SpawnError {
    pub program: String,
    #[source]
    pub source: io::Error,
}

/// Port availability could not be determined. "Address in use" is not an
/// error; it is the normal `false` answer of [`crate::arbiter::PortArbiter::is_free`].
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("permission denied binding port {port}")]
    PermissionDenied { port: u16 },

    #[error("unexpected error probing port {port}: {source}")]
    Os {
        port: u16,
        #[source]
        source: io::Error,
    },
}

/// The desired port could not be made available for a child.
#[derive(Debug, Error)]
pub enum PortResolutionError {
    #[error("port {0} is in use")]
    InUse(u16),

    #[error("port {port} could not be vacated ({outcome})")]
    NotVacated { port: u16, outcome: String },

    #[error("no free port in {start}..{end}")]
    NoneFree { start: u16, end: u32 },

    #[error(transparent)]
    Probe(#[from] ProbeError),
}

/// Failures of the out-of-process control channel.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control socket {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed control message: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("control socket closed without a response")]
    NoResponse,
}

/// Errors that escape the supervisor loop.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Control(#[from] ControlError),

    /// Internal invariant violation. Children are terminated best-effort and
    /// the process exits with a code above 1.
    #[error("supervisor fault: {0}")]
    Fault(String),
}

pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;
