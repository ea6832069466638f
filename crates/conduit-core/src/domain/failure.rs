use crate::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::error::Error;
use std::fmt;

/// Category of a connector failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// The connector body failed or panicked
    Execution,
    /// The connector outputs could not be serialized or applied
    Serialization,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Execution => f.write_str("EXECUTION"),
            FailureKind::Serialization => f.write_str("SERIALIZATION"),
        }
    }
}

/// Diagnostic captured when a connector fails.
///
/// Immutable once recorded. `causes` holds the error's source chain,
/// outermost first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    /// Failure category
    pub kind: FailureKind,
    /// Top-level message
    pub message: String,
    /// Summaries of the causal chain
    pub causes: Vec<String>,
    /// When the failure was recorded
    pub occurred_at: DateTime<Utc>,
}

impl FailureInfo {
    /// Failure without a causal chain
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            causes: Vec::new(),
            occurred_at: Utc::now(),
        }
    }

    /// Append one cause to the chain
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    /// Capture an error and its full `source()` chain
    pub fn from_error(kind: FailureKind, err: &(dyn Error + 'static)) -> Self {
        let mut info = Self::new(kind, err.to_string());
        let mut source = err.source();
        while let Some(cause) = source {
            info.causes.push(cause.to_string());
            source = cause.source();
        }
        info
    }

    /// Capture a panic payload
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let detail = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::new(FailureKind::Execution, "connector panicked").with_cause(detail)
    }

    /// Map an engine error raised while running a connector
    pub fn from_core_error(err: &CoreError) -> Self {
        let kind = match err {
            CoreError::SerializationFailure(_) => FailureKind::Serialization,
            _ => FailureKind::Execution,
        };
        Self::new(kind, err.to_string())
    }

    /// Text rendering of the chain, persisted as the stack trace column
    pub fn stack_trace(&self) -> String {
        let mut out = format!("{}: {}", self.kind, self.message);
        for cause in &self.causes {
            out.push_str("\nCaused by: ");
            out.push_str(cause);
        }
        out
    }
}

impl fmt::Display for FailureInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure: {}", self.kind, self.message)
    }
}
