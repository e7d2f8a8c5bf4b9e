//! Wire protocol types for child-to-parent result transport.
//!
//! A child writes exactly one [`Outcome`] frame before it exits. The explicit
//! `success` tag keeps "the work returned an error-like value" distinct from
//! "the work raised".

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::FutureError;

/// Reason recorded when the successful return value cannot be encoded.
pub const RESULT_UNENCODABLE: &str = "result type cannot be serialized";

/// Reason recorded when the raised error itself cannot be encoded.
pub const PAYLOAD_UNENCODABLE: &str = "exception payload cannot be serialized";

/// Kind recorded for a unit of work that panicked.
pub const PANIC_KIND: &str = "panic";

/// Kind recorded for entries of an error's `source()` chain.
pub const SOURCE_KIND: &str = "source";

/// Terminal result of running one unit of work in a child process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outcome<T> {
    /// The closure returned normally.
    Success { value: T },

    /// The closure raised (returned `Err` or panicked).
    Failure { raised: ErrorValue },

    /// Neither the value nor the raised error could be encoded.
    Unencodable {
        reason: String,
        attempted_kind: String,
    },
}

impl<T> Outcome<T> {
    pub fn success(value: T) -> Self {
        Self::Success { value }
    }

    pub fn failure(raised: ErrorValue) -> Self {
        Self::Failure { raised }
    }

    pub fn unencodable(reason: impl Into<String>, attempted_kind: impl Into<String>) -> Self {
        Self::Unencodable {
            reason: reason.into(),
            attempted_kind: attempted_kind.into(),
        }
    }

    /// Classify the outcome as the parent sees it.
    pub fn into_result(self) -> Result<T, FutureError> {
        match self {
            Self::Success { value } => Ok(value),
            Self::Failure { raised } => Err(FutureError::Child(raised)),
            Self::Unencodable {
                reason,
                attempted_kind,
            } => Err(FutureError::result_type(reason, attempted_kind)),
        }
    }
}

/// Structured record of an error raised inside a child process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorValue {
    /// Type name of the raised error, or [`PANIC_KIND`].
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorValue>>,
    /// The raised error itself, serialized, so the parent can rebuild it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl ErrorValue {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            cause: None,
            payload: None,
        }
    }

    pub fn with_cause(mut self, cause: ErrorValue) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Capture a raised error, including its `source()` chain and payload.
    ///
    /// Fails when the error value itself cannot be serialized.
    pub fn from_error<E>(err: &E) -> Result<Self, serde_json::Error>
    where
        E: std::error::Error + Serialize,
    {
        let payload = serde_json::to_value(err)?;
        let mut value = Self::new(std::any::type_name::<E>(), err.to_string());
        value.cause = err.source().map(|source| Box::new(Self::from_source(source)));
        value.payload = Some(payload);
        Ok(value)
    }

    fn from_source(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut value = Self::new(SOURCE_KIND, err.to_string());
        value.cause = err.source().map(|source| Box::new(Self::from_source(source)));
        value
    }

    /// Capture the payload of a caught panic.
    pub fn from_panic(panic: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = panic.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = panic.downcast_ref::<String>() {
            s.clone()
        } else {
            "Box<dyn Any>".to_string()
        };
        Self::new(PANIC_KIND, message)
    }

    pub fn is_panic(&self) -> bool {
        self.kind == PANIC_KIND
    }

    /// Rebuild the original error value from its payload.
    pub fn downcast<E: DeserializeOwned>(&self) -> Option<E> {
        let payload = self.payload.clone()?;
        serde_json::from_value(payload).ok()
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ErrorValue {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}
