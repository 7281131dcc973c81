//! Error types for session handles and remote connections.

use std::fmt;

/// Authentication method attempted against a remote host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    Password,
    Key,
    Agent,
}

impl fmt::Display for AuthKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthKind::Password => write!(f, "password"),
            AuthKind::Key => write!(f, "key"),
            AuthKind::Agent => write!(f, "agent"),
        }
    }
}

/// Errors from a live session handle or its backing transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("failed to spawn session: {0}")]
    SpawnFailed(String),

    #[error("session is closed")]
    Closed,

    #[error("failed to write to session: {0}")]
    WriteFailed(String),

    #[error("failed to resize session: {0}")]
    ResizeFailed(String),

    #[error("command execution failed: {0}")]
    ExecFailed(String),

    #[error("channel error: {0}")]
    ChannelError(String),
}

impl From<anyhow::Error> for SessionError {
    fn from(err: anyhow::Error) -> Self {
        SessionError::SpawnFailed(err.to_string())
    }
}

/// Why a remote connection could not be established.
///
/// Every failure a caller can see maps into one of these categories with a
/// human-readable message; transport internals never leak through.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectError {
    #[error("authentication rejected ({method})")]
    AuthRejected { method: AuthKind },

    #[error("connection refused by {host}:{port}")]
    Refused { host: String, port: u16 },

    #[error("could not resolve host {0}")]
    HostUnresolved(String),

    #[error("connection timed out")]
    TimedOut,

    #[error("host unreachable")]
    Unreachable,

    #[error("connection reset by peer")]
    Reset,

    #[error("key file not found: {0}")]
    KeyFileMissing(String),

    #[error("ssh error: {0}")]
    Protocol(String),
}

impl ConnectError {
    /// Stable machine-readable category for protocol error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthRejected { .. } => "auth_rejected",
            Self::Refused { .. } => "connection_refused",
            Self::HostUnresolved(_) => "host_unresolved",
            Self::TimedOut => "timed_out",
            Self::Unreachable => "unreachable",
            Self::Reset => "connection_reset",
            Self::KeyFileMissing(_) => "key_file_missing",
            Self::Protocol(_) => "ssh_error",
        }
    }

    /// Classify a transport-level I/O failure against `host:port`.
    pub fn from_io(err: &std::io::Error, host: &str, port: u16) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => Self::Refused {
                host: host.to_string(),
                port,
            },
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Self::TimedOut,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                Self::Reset
            }
            ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable => Self::Unreachable,
            ErrorKind::NotFound => Self::HostUnresolved(host.to_string()),
            _ => Self::Protocol(err.to_string()),
        }
    }

    /// Classify an SSH library failure against `host:port`.
    pub fn from_ssh(err: russh::Error, host: &str, port: u16) -> Self {
        match err {
            russh::Error::IO(e) => Self::from_io(&e, host, port),
            russh::Error::Disconnect => Self::Reset,
            other => Self::Protocol(other.to_string()),
        }
    }
}
