use crate::step::StepName;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Errors that can occur while running a chunked workflow.
///
/// Each variant carries enough context to build an [`ErrorRecord`] for the
/// run's error log. Retryable variants are re-attempted by the retry policy;
/// fatal variants route the run to the error branch immediately.
///
/// # Non-Exhaustive
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code. When matching
/// on this error, always include a wildcard pattern.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EngineError {
    /// The input document was malformed (for example, empty). Fatal.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The external capability executor failed. Retryable.
    #[error("external call failed in step '{step_name}': {details}")]
    ExternalCall {
        /// The step whose capability call failed
        step_name: StepName,
        /// Details reported by the executor
        details: String,
    },

    /// A capability call exceeded its timeout. Retryable, reported under
    /// the external-call kind.
    #[error("call timed out in step '{step_name}'")]
    Timeout {
        /// The step whose call timed out
        step_name: StepName,
    },

    /// A capability response could not be parsed as structured data.
    ///
    /// Not retried at the chunk level. At the aggregation level this
    /// degrades to a raw-text fallback instead of propagating.
    #[error("could not parse capability response: {0}")]
    Parse(String),

    /// The final synthesis step failed irrecoverably. Fatal.
    #[error("aggregation failed: {0}")]
    Aggregation(String),

    /// Routing exceeded the iteration cap. Fatal; indicates a
    /// misconfigured routing function.
    #[error("routing exceeded the iteration cap of {cap} steps")]
    GraphNontermination {
        /// The configured iteration cap
        cap: u64,
    },

    /// A referenced step was not registered in the graph.
    #[error("step not found: {0}")]
    StepNotFound(StepName),

    /// The graph or pipeline configuration is invalid.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A step failed in an unanticipated way. The run loop catches this
    /// at the invocation boundary so the error branch stays reachable.
    #[error("step '{step_name}' failed: {details}")]
    Execution {
        /// The step that failed
        step_name: StepName,
        /// Details about the failure
        details: String,
    },

    /// The run was cancelled before the work completed.
    #[error("run cancelled")]
    Cancelled,
}

impl EngineError {
    /// Returns the error-log kind for this error.
    ///
    /// Timeouts classify as external-call failures: at the record level the
    /// two are indistinguishable to the caller and both are retryable.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::ExternalCall { .. } | EngineError::Timeout { .. } => {
                ErrorKind::ExternalCall
            }
            EngineError::Parse(_) => ErrorKind::Parse,
            EngineError::Aggregation(_) => ErrorKind::Aggregation,
            EngineError::GraphNontermination { .. } => ErrorKind::GraphNontermination,
            EngineError::StepNotFound(_) | EngineError::Configuration(_) => {
                ErrorKind::Configuration
            }
            EngineError::Execution { .. } => ErrorKind::Execution,
            EngineError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Returns `true` if the retry policy may re-attempt after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ExternalCall { .. } | EngineError::Timeout { .. }
        )
    }
}

/// Classification of a recorded error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input
    Validation,
    /// Capability executor failure or timeout
    ExternalCall,
    /// Unparseable capability response
    Parse,
    /// Final synthesis failure
    Aggregation,
    /// Iteration cap exceeded
    GraphNontermination,
    /// Invalid graph or pipeline configuration
    Configuration,
    /// Unanticipated step failure caught at the invocation boundary
    Execution,
    /// Run cancelled before completion
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::ExternalCall => "external_call_error",
            ErrorKind::Parse => "parse_error",
            ErrorKind::Aggregation => "aggregation_error",
            ErrorKind::GraphNontermination => "graph_nontermination",
            ErrorKind::Configuration => "configuration_error",
            ErrorKind::Execution => "execution_error",
            ErrorKind::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// One entry in a run's append-only error log.
///
/// Records are appended as failures surface and are never mutated or
/// removed; the most recent record drives the user-facing error summary.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    /// Classification of the failure
    pub kind: ErrorKind,
    /// Human-readable failure message
    pub message: String,
    /// The step in which the failure surfaced
    pub step: StepName,
    /// When the failure was recorded
    pub timestamp: DateTime<Utc>,
    /// Whether the retry policy could have re-attempted this failure
    pub retryable: bool,
    /// Total invocations made before the failure surfaced (1 = no retries)
    pub attempt: u32,
}

impl ErrorRecord {
    /// Creates a record with the current timestamp.
    pub fn new(
        kind: ErrorKind,
        message: impl Into<String>,
        step: impl Into<StepName>,
        retryable: bool,
        attempt: u32,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            step: step.into(),
            timestamp: Utc::now(),
            retryable,
            attempt,
        }
    }

    /// Builds a record from an [`EngineError`] surfaced by a step.
    ///
    /// `attempt` is the total invocation count for the failed call.
    pub fn from_engine(error: &EngineError, step: impl Into<StepName>, attempt: u32) -> Self {
        Self::new(
            error.kind(),
            error.to_string(),
            step,
            error.is_retryable(),
            attempt,
        )
    }
}
