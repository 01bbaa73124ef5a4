//! Error types for AMI and AGI sessions.

use thiserror::Error;

/// Crate-wide error type.
///
/// Every variant is cloneable so that a [`Handle`](crate::Handle) can
/// retain its outcome and replay it to sinks attached after fulfilment.
/// I/O failures are therefore carried as messages (`std::io::Error` is
/// not `Clone`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    /// Unparseable frame, missing banner, or unexpected block shape.
    /// Fatal for the connection: the transport is closed and every
    /// pending handle is failed.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// A send was attempted outside the state that allows it, or after
    /// the connection closed.
    #[error("not connected")]
    NotConnected,

    /// The connection was lost with every request still pending.
    #[error("connection lost{}", .cause.as_deref().map(|c| format!(": {c}")).unwrap_or_default())]
    ConnectionLost { cause: Option<String> },

    /// The switch answered an action with `Response: Error`.
    #[error("action failed: {message}")]
    Action { message: String },

    /// An AGI command was rejected with the given status code.
    #[error("AGI command rejected ({code}): {message}")]
    AgiCommand { code: u16, message: String },

    /// Status 511: the channel is dead. Every subsequent command on the
    /// session fails with this error as well.
    #[error("AGI channel is dead: {message}")]
    AgiChannelDead { message: String },

    /// Status 520: invalid command syntax, with the usage text Asterisk
    /// returned.
    #[error("AGI usage error: {}", .usage.first().map(String::as_str).unwrap_or(""))]
    AgiUsage { usage: Vec<String> },

    /// Programmer error: a handle was fulfilled twice, or a sink was
    /// attached twice.
    #[error("invalid state: {message}")]
    InvalidState { message: String },

    /// A transport write failed.
    #[error("I/O error: {message}")]
    Io { message: String },
}

impl Error {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        Error::InvalidState {
            message: message.into(),
        }
    }

    pub(crate) fn connection_lost(cause: Option<&Error>) -> Self {
        Error::ConnectionLost {
            cause: cause.map(|c| c.to_string()),
        }
    }

    /// `true` for errors that end the connection rather than a single
    /// request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Protocol { .. } | Error::ConnectionLost { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, Error>;
