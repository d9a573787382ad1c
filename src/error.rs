// ABOUTME: Error types for SSH command endpoints.
// ABOUTME: Covers dial, host key, authentication, channel and exec failures.

use std::path::PathBuf;
use thiserror::Error;

/// Everything that can go wrong while setting up or running a remote command.
///
/// The enum is `Clone` because a host key failure is recorded while the
/// connection is being secured and surfaced later, when the connection drops.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("host key rejected for {host}: {reason}")]
    HostKeyRejected { host: String, reason: String },

    #[error("known_hosts error: {0}")]
    KnownHosts(String),

    #[error("authentication failed: no valid credentials")]
    AuthenticationFailed,

    #[error("failed to open session channel: {0}")]
    ChannelOpenFailed(String),

    #[error("server refused to execute command: {0}")]
    ExecRejected(String),

    #[error("connection closed: {0}")]
    ConnectionDone(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("SSH agent not available: {0}")]
    AgentUnavailable(String),

    #[error("failed to load key from {path}: {reason}")]
    KeyLoadFailed { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("SSH protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("YAML parse error: {0}")]
    Yaml(String),
}

/// Error kind for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The TCP connection could not be established.
    DialFailure,
    /// The server's host key was not trusted.
    HostKeyRejected,
    /// Every offered credential was rejected.
    AuthenticationFailed,
    /// The server would not open a session channel.
    ChannelOpenFailed,
    /// The server declined to run the command.
    ExecRejected,
    /// The channel or connection closed after the command was running.
    NormalClose,
    /// The connection dropped for a reason not attributed to any setup step.
    Disconnected,
    /// Local setup problem: keys, agent, configuration.
    Setup,
}

impl Error {
    /// Returns the error kind for programmatic handling.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection(_) => ErrorKind::DialFailure,
            Error::HostKeyRejected { .. } | Error::KnownHosts(_) => ErrorKind::HostKeyRejected,
            Error::AuthenticationFailed => ErrorKind::AuthenticationFailed,
            Error::ChannelOpenFailed(_) => ErrorKind::ChannelOpenFailed,
            Error::ExecRejected(_) => ErrorKind::ExecRejected,
            Error::ConnectionDone(_) => ErrorKind::NormalClose,
            Error::ConnectionLost(_) | Error::Protocol(_) | Error::Io(_) => {
                ErrorKind::Disconnected
            }
            Error::AgentUnavailable(_)
            | Error::KeyLoadFailed { .. }
            | Error::InvalidConfig(_)
            | Error::MissingEnvVar(_)
            | Error::Yaml(_) => ErrorKind::Setup,
        }
    }

    pub(crate) fn host_key_rejected(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::HostKeyRejected {
            host: host.into(),
            reason: reason.into(),
        }
    }
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Error::Protocol(err.to_string())
    }
}

impl From<russh::keys::Error> for Error {
    fn from(err: russh::keys::Error) -> Self {
        Error::Protocol(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Yaml(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
