use std::fmt;

/// Errors that can occur while talking to the operator.
#[derive(Debug)]
pub enum ConnectionError {
    /// WebSocket connection could not be established.
    Connect(String),

    /// Connection attempt exceeded the configured timeout.
    ConnectTimeout,

    /// Outbound queue is full (bounded queue, drop-oldest is
    /// not acceptable for commands, so senders get this back instead).
    QueueFull,

    /// The connection is closed and no reconnect is in flight to retry against.
    Closed,

    /// Internal error (e.g., transport task died or channel closed).
    Internal(String),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(msg) => write!(f, "operator connection error: {msg}"),
            Self::ConnectTimeout => write!(f, "operator connection timed out"),
            Self::QueueFull => write!(f, "outbound queue is full"),
            Self::Closed => write!(f, "operator connection closed"),
            Self::Internal(msg) => write!(f, "connection internal error: {msg}"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<ConnectionError> for crate::error::AppError {
    fn from(e: ConnectionError) -> Self {
        use crate::error::ExitCode;
        Self {
            message: e.to_string(),
            code: ExitCode::GeneralError,
        }
    }
}
