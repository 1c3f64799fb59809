use crate::error::EngineError;
use crate::retry::RetryPolicy;
use crate::state::{StateUpdate, WorkflowState};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Type-safe step name wrapper.
///
/// Provides compile-time safety for step identifiers, preventing
/// typos and mismatched step names at the API level.
///
/// # Examples
///
/// ```
/// use kizami::StepName;
///
/// let name = StepName::new("process_chunks");
/// assert_eq!(name.as_str(), "process_chunks");
///
/// // From trait for ergonomic conversion
/// let name: StepName = "aggregate".into();
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StepName(String);

impl StepName {
    /// Creates a new StepName
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the step name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StepName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for StepName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for StepName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Configuration for a workflow step.
///
/// Controls the per-invocation timeout and retry behavior applied by the
/// run loop when the step executes.
#[derive(Debug, Clone)]
pub struct StepConfig {
    /// Maximum time allowed for one step invocation. `None` means no
    /// timeout. Default: 30 seconds.
    pub timeout: Option<Duration>,
    /// Retry policy when the step fails retryably. Default: no retry.
    pub retry_policy: RetryPolicy,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            retry_policy: RetryPolicy::None,
        }
    }
}

/// A named unit of work in a workflow graph.
///
/// A step reads the current [`WorkflowState`] and returns a sparse
/// [`StateUpdate`] that the run loop merges back. Steps never mutate shared
/// state directly, which is what makes per-chunk work safe to fan out.
/// Routing is deliberately not a step concern: the graph's routing function
/// decides the next step after every merge.
///
/// # Type Parameter
///
/// * `D` - The domain-specific portion of the workflow state
///
/// # Examples
///
/// ```
/// use kizami::prelude::*;
/// use async_trait::async_trait;
///
/// struct MarkReady;
///
/// #[async_trait]
/// impl Step<()> for MarkReady {
///     async fn execute(
///         &self,
///         _state: &WorkflowState<()>,
///     ) -> Result<StateUpdate<()>, EngineError> {
///         Ok(StateUpdate::new().status(RunStatus::Ready))
///     }
/// }
/// ```
#[async_trait]
pub trait Step<D>: Send + Sync {
    /// Executes the step logic.
    ///
    /// # Returns
    ///
    /// - `Ok(update)` - Partial update to merge into the run state
    /// - `Err(error)` - Step failed; the run loop records the error and
    ///   forces the error branch (retryable errors may be re-attempted
    ///   first, per [`StepConfig`])
    async fn execute(&self, state: &WorkflowState<D>) -> Result<StateUpdate<D>, EngineError>;

    /// Returns the step configuration.
    ///
    /// Override to customize timeout and retry behavior.
    fn config(&self) -> StepConfig {
        StepConfig::default()
    }
}

/// Routing decision returned after every step completes.
///
/// `End` and `Error` are the reserved terminal sentinels; everything else
/// names the next step to run. Expressing the sentinels as enum variants
/// makes routing total by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    /// Continue with the named step
    Step(StepName),
    /// Finish the run successfully
    End,
    /// Take the error branch
    Error,
}

impl Next {
    /// Creates a `Next::Step` decision.
    pub fn step(name: impl Into<StepName>) -> Self {
        Next::Step(name.into())
    }
}

/// Selects the next step from the current state.
///
/// Evaluated by the run loop after every step merge. Implementations must
/// only inspect state; raising domain errors from routing is a bug, which
/// is why the signature gives no way to return one.
///
/// Any `Fn(&WorkflowState<D>) -> Next` closure is a `Route<D>`.
pub trait Route<D>: Send + Sync {
    /// Returns the next step (or a terminal sentinel) for `state`.
    fn next(&self, state: &WorkflowState<D>) -> Next;
}

impl<D, F> Route<D> for F
where
    F: Fn(&WorkflowState<D>) -> Next + Send + Sync,
{
    fn next(&self, state: &WorkflowState<D>) -> Next {
        self(state)
    }
}
