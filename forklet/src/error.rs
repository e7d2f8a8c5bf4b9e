//! Error family surfaced by blocking accessors on a [`ProcFuture`](crate::ProcFuture).
//!
//! Errors are cached on the future and handed out again on every later call,
//! so everything here is `Clone`.

use crate::bridge::protocol::ErrorValue;

/// Why a unit of work did not produce a value.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FutureError {
    /// The unit of work raised (returned `Err` or panicked).
    #[error("child process raised {0}")]
    Child(#[source] ErrorValue),

    /// The return value or the raised error could not be serialized.
    #[error("{reason}: {type_name}")]
    ResultType { reason: String, type_name: String },

    /// Protocol- or environment-level failure moving the result across.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl FutureError {
    pub fn result_type(reason: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self::ResultType {
            reason: reason.into(),
            type_name: type_name.into(),
        }
    }

    /// The error raised by the unit of work, if that is what happened.
    pub fn raised(&self) -> Option<&ErrorValue> {
        match self {
            Self::Child(raised) => Some(raised),
            _ => None,
        }
    }

    pub fn is_child(&self) -> bool {
        matches!(self, Self::Child(_))
    }

    pub fn is_result_type(&self) -> bool {
        matches!(self, Self::ResultType { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Transport-level failures: the child never delivered a well-formed outcome.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("failed to spawn child process: {0}")]
    Spawn(String),

    #[error("{context} failed: {message}")]
    Io {
        context: &'static str,
        message: String,
    },

    #[error("child process {pid} terminated abnormally ({status})")]
    AbnormalExit { pid: i32, status: String },

    #[error("child process {pid} exited without producing a result")]
    EmptyResult { pid: i32 },

    #[error("malformed result from child process: {0}")]
    Protocol(String),
}

impl TransportError {
    pub fn spawn(err: impl std::fmt::Display) -> Self {
        Self::Spawn(err.to_string())
    }

    pub fn io(context: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Io {
            context,
            message: err.to_string(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}
