//! Error types for the reactor and its connections.
//!
//! Reactor-level errors cover loop lifecycle misuse; connection-level errors
//! form a closed taxonomy that every OS-level socket failure is translated
//! into before it reaches a handler.

use std::io;

use thiserror::Error;

/// Lifecycle errors raised by reactor operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReactorError {
    /// The loop was started while another loop thread is active.
    #[error("reactor is already running")]
    AlreadyRunning,

    /// A scheduling or loop-thread query was made with no loop thread active.
    #[error("reactor is not running")]
    NotRunning,
}

/// Failure reasons delivered to `on_close` and raised by `listen_*`.
///
/// OS errors are funneled through [`ConnectionError::from`] so handlers only
/// ever match on this closed set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The host could not be resolved, or a UNIX socket path does not exist.
    #[error("host not found")]
    HostNotFound,

    /// The peer actively refused the connection.
    #[error("connection refused")]
    Refused,

    /// Binding or connecting was denied by the OS.
    #[error("permission denied")]
    Permission,

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// The peer hung up during I/O.
    #[error("connection closed by peer")]
    Closed,

    /// The connection was reset by the peer.
    #[error("connection reset by peer")]
    Reset,

    /// A write hit a pipe whose read side is gone.
    #[error("broken pipe")]
    BrokenPipe,

    /// Anything the taxonomy does not name.
    #[error("connection error: {0}")]
    Other(String),
}

impl From<&io::Error> for ConnectionError {
    fn from(err: &io::Error) -> Self {
        use io::ErrorKind::*;

        match err.kind() {
            NotFound | HostUnreachable => ConnectionError::HostNotFound,
            ConnectionRefused => ConnectionError::Refused,
            PermissionDenied => ConnectionError::Permission,
            TimedOut => ConnectionError::Timeout,
            ConnectionReset | ConnectionAborted => ConnectionError::Reset,
            BrokenPipe => ConnectionError::BrokenPipe,
            UnexpectedEof | NotConnected => ConnectionError::Closed,
            _ => ConnectionError::Other(err.to_string()),
        }
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        ConnectionError::from(&err)
    }
}

/// Errors raised synchronously by `listen_tcp` / `listen_unix`.
///
/// Listening is more prepared than `connect` to signal configuration problems
/// to the caller: a bad bind address is a programmer error, not a runtime
/// condition, so it surfaces here instead of through `on_close`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ListenError {
    #[error(transparent)]
    Reactor(#[from] ReactorError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}
