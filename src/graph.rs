//! The workflow graph and its run loop.

use crate::error::{EngineError, ErrorRecord};
use crate::retry::invoke_with_retry;
use crate::state::{RunMetrics, RunStatus, WorkflowState};
use crate::step::{Next, Route, Step, StepName};
use crate::trace::{NoopTrace, TraceSink};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default cap on run-loop iterations.
///
/// Generous enough for any sane graph; a run that hits it has a routing
/// bug, not a long document.
pub const DEFAULT_MAX_ITERATIONS: u64 = 10_000;

/// A finite-state machine over named steps with conditional routing.
///
/// After every step the routing function inspects the merged state and
/// returns the next step name or a terminal sentinel ([`Next::End`] /
/// [`Next::Error`]). This one mechanism covers both linear pipelines and
/// bounded loops (process chunk, check for more, loop back).
///
/// A graph is immutable once built and may be run concurrently for
/// independent runs; each run owns its own [`WorkflowState`].
pub struct WorkflowGraph<D> {
    steps: HashMap<StepName, Box<dyn Step<D>>>,
    route: Box<dyn Route<D>>,
    start_step: StepName,
    max_iterations: u64,
    trace: Arc<dyn TraceSink<D>>,
}

impl<D> fmt::Debug for WorkflowGraph<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowGraph")
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .field("start_step", &self.start_step)
            .field("max_iterations", &self.max_iterations)
            .finish()
    }
}

/// The well-formed result every run hands back to the caller.
///
/// The engine never propagates expected failures past [`WorkflowGraph::run`]:
/// a failed run still reports its metrics, full error log, and whatever
/// partial results survived.
#[derive(Debug)]
pub struct RunOutcome<D> {
    /// `true` when the run completed
    pub success: bool,
    /// The aggregated final result, when one was produced
    pub output: Option<Value>,
    /// Human-readable summary of the most recent error, on failure
    pub error_summary: Option<String>,
    /// Accumulated run counters
    pub metrics: RunMetrics,
    /// The full terminal state (errors, partials, metadata)
    pub state: WorkflowState<D>,
}

impl<D> RunOutcome<D> {
    /// Chunks that produced a partial result, even on a failed run.
    pub fn chunks_completed(&self) -> usize {
        self.state.partials.len()
    }

    /// The run's append-only error log.
    pub fn errors(&self) -> &[ErrorRecord] {
        &self.state.errors
    }
}

impl<D> WorkflowGraph<D>
where
    D: Clone + Send + Sync + 'static,
{
    /// Creates a new graph builder.
    pub fn builder() -> GraphBuilder<D> {
        GraphBuilder::new()
    }

    /// Returns `true` if a step with the given name exists.
    pub fn has_step(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    /// Returns the number of registered steps.
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Runs the graph to a terminal state.
    ///
    /// On each iteration: look up the current step, invoke it through its
    /// retry policy and timeout, merge the returned update, and consult
    /// routing. A step that returns an error (after any retries) has the
    /// error recorded and the status forced to [`RunStatus::ErrorHandling`]
    /// before routing runs, so the error branch is always reachable.
    ///
    /// Terminal sentinels invoke the idempotent finalizers: `End` completes
    /// the run, `Error` builds the user-facing summary and marks it failed.
    pub async fn run(&self, mut state: WorkflowState<D>) -> RunOutcome<D> {
        let run_id = state.run_id.clone();
        info!(run_id = %run_id, start = %self.start_step, "run started");
        self.trace.on_run_start(&run_id, &state);

        let mut current = self.start_step.clone();
        let mut iterations: u64 = 0;

        loop {
            iterations += 1;
            if iterations > self.max_iterations {
                let error = EngineError::GraphNontermination {
                    cap: self.max_iterations,
                };
                warn!(run_id = %run_id, step = %current, "{error}");
                state.push_error(ErrorRecord::from_engine(&error, current.clone(), 1));
                state.status = RunStatus::ErrorHandling;
                Self::error_handler(&mut state);
                break;
            }

            let Some(step) = self.steps.get(&current) else {
                let error = EngineError::StepNotFound(current.clone());
                warn!(run_id = %run_id, "{error}");
                state.push_error(ErrorRecord::from_engine(&error, current.clone(), 1));
                state.status = RunStatus::ErrorHandling;
                Self::error_handler(&mut state);
                break;
            };

            let before = state.clone();
            let config = step.config();
            let (result, attempts) = invoke_with_retry(
                &config.retry_policy,
                config.timeout,
                &current,
                |_| step.execute(&state),
            )
            .await;

            state.metrics.steps_executed += 1;
            state.metrics.retries += u64::from(attempts.saturating_sub(1));

            match result {
                Ok(update) => {
                    debug!(run_id = %run_id, step = %current, "step completed");
                    state.apply(update);
                }
                Err(error) => {
                    warn!(run_id = %run_id, step = %current, attempts, "step failed: {error}");
                    state.push_error(ErrorRecord::from_engine(&error, current.clone(), attempts));
                    state.status = RunStatus::ErrorHandling;
                }
            }

            self.trace.on_transition(&current, &before, &state);

            match self.route.next(&state) {
                Next::Step(name) => current = name,
                Next::End => {
                    Self::complete(&mut state);
                    break;
                }
                Next::Error => {
                    Self::error_handler(&mut state);
                    break;
                }
            }
        }

        self.trace.on_run_end(&run_id, &state);
        info!(
            run_id = %run_id,
            status = %state.status,
            steps = state.metrics.steps_executed,
            errors = state.error_count,
            "run finished"
        );

        let success = state.status == RunStatus::Completed;
        RunOutcome {
            success,
            output: state.final_result.clone(),
            error_summary: state
                .metadata
                .get("error_summary")
                .and_then(|v| v.as_str())
                .map(String::from),
            metrics: state.metrics.clone(),
            state,
        }
    }

    /// Terminal finalizer for successful runs.
    ///
    /// Stamps the end time and wall-clock duration and marks the run
    /// completed. No-op on an already-terminal state.
    fn complete(state: &mut WorkflowState<D>) {
        if state.is_terminal() {
            return;
        }
        Self::stamp_end(state);
        state.status = RunStatus::Completed;
    }

    /// Terminal finalizer for the error branch.
    ///
    /// Builds a single human-readable summary from the most recent error
    /// record without discarding the full error log, then marks the run
    /// failed. No-op on an already-terminal state.
    fn error_handler(state: &mut WorkflowState<D>) {
        if state.is_terminal() {
            return;
        }
        let summary = match state.errors.last() {
            Some(record) => format!(
                "run failed in step '{}' ({}): {}; {} of {} chunks completed",
                record.step,
                record.kind,
                record.message,
                state.partials.len(),
                state.chunks.len(),
            ),
            None => "run failed with no recorded error".to_string(),
        };
        state
            .metadata
            .insert("error_summary".to_string(), Value::String(summary));
        Self::stamp_end(state);
        state.status = RunStatus::Failed;
    }

    fn stamp_end(state: &mut WorkflowState<D>) {
        let now = Utc::now();
        state.ended_at = Some(now);
        state.metrics.execution_time_ms =
            (now - state.started_at).num_milliseconds().max(0) as u64;
    }
}

/// Builder for constructing [`WorkflowGraph`] instances.
pub struct GraphBuilder<D> {
    steps: HashMap<StepName, Box<dyn Step<D>>>,
    route: Option<Box<dyn Route<D>>>,
    start_step: Option<StepName>,
    max_iterations: u64,
    trace: Arc<dyn TraceSink<D>>,
}

impl<D> Default for GraphBuilder<D>
where
    D: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<D> GraphBuilder<D>
where
    D: Clone + Send + Sync + 'static,
{
    /// Creates a new empty graph builder.
    pub fn new() -> Self {
        Self {
            steps: HashMap::new(),
            route: None,
            start_step: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            trace: Arc::new(NoopTrace),
        }
    }

    /// Adds a step under the given name.
    pub fn add_step<S: Step<D> + 'static>(mut self, name: impl Into<StepName>, step: S) -> Self {
        self.steps.insert(name.into(), Box::new(step));
        self
    }

    /// Sets the routing function consulted after every step.
    pub fn route<R: Route<D> + 'static>(mut self, route: R) -> Self {
        self.route = Some(Box::new(route));
        self
    }

    /// Sets the start step by name.
    pub fn start_with(mut self, step_name: impl Into<StepName>) -> Self {
        self.start_step = Some(step_name.into());
        self
    }

    /// Overrides the iteration cap (default: 10,000).
    pub fn max_iterations(mut self, cap: u64) -> Self {
        self.max_iterations = cap;
        self
    }

    /// Installs a trace sink (default: no-op).
    pub fn trace(mut self, sink: Arc<dyn TraceSink<D>>) -> Self {
        self.trace = sink;
        self
    }

    /// Builds the graph.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] when the start step or the
    /// routing function is missing, or [`EngineError::StepNotFound`] when
    /// the start step names an unregistered step.
    pub fn build(self) -> Result<WorkflowGraph<D>, EngineError> {
        let start_step = self.start_step.ok_or_else(|| {
            EngineError::Configuration("start step must be specified".to_string())
        })?;
        let route = self.route.ok_or_else(|| {
            EngineError::Configuration("routing function must be specified".to_string())
        })?;

        if !self.steps.contains_key(&start_step) {
            return Err(EngineError::StepNotFound(start_step));
        }
        if self.max_iterations == 0 {
            return Err(EngineError::Configuration(
                "iteration cap must be greater than 0".to_string(),
            ));
        }

        Ok(WorkflowGraph {
            steps: self.steps,
            route,
            start_step,
            max_iterations: self.max_iterations,
            trace: self.trace,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::state::StateUpdate;
    use async_trait::async_trait;
    use serde_json::json;

    struct MarkReady;

    #[async_trait]
    impl Step<()> for MarkReady {
        async fn execute(
            &self,
            _state: &WorkflowState<()>,
        ) -> Result<StateUpdate<()>, EngineError> {
            Ok(StateUpdate::new()
                .status(RunStatus::Ready)
                .metadata("ready", json!(true)))
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl Step<()> for AlwaysFails {
        async fn execute(
            &self,
            _state: &WorkflowState<()>,
        ) -> Result<StateUpdate<()>, EngineError> {
            Err(EngineError::Validation("intentional failure".to_string()))
        }
    }

    fn end_route(state: &WorkflowState<()>) -> Next {
        match state.status {
            RunStatus::ErrorHandling => Next::Error,
            _ => Next::End,
        }
    }

    #[tokio::test]
    async fn test_linear_run_completes() {
        let graph = WorkflowGraph::builder()
            .add_step("ready", MarkReady)
            .route(end_route)
            .start_with("ready")
            .build()
            .expect("valid graph");

        let outcome = graph.run(WorkflowState::new("doc", ())).await;
        assert!(outcome.success);
        assert_eq!(outcome.state.status, RunStatus::Completed);
        assert!(outcome.state.ended_at.is_some());
        assert_eq!(outcome.state.metadata.get("ready"), Some(&json!(true)));
        assert_eq!(outcome.metrics.steps_executed, 1);
    }

    #[tokio::test]
    async fn test_step_error_forces_error_branch() {
        let graph = WorkflowGraph::builder()
            .add_step("fail", AlwaysFails)
            .route(end_route)
            .start_with("fail")
            .build()
            .expect("valid graph");

        let outcome = graph.run(WorkflowState::new("doc", ())).await;
        assert!(!outcome.success);
        assert_eq!(outcome.state.status, RunStatus::Failed);
        assert_eq!(outcome.errors().len(), 1);
        assert_eq!(outcome.errors()[0].kind, ErrorKind::Validation);
        let summary = outcome.error_summary.expect("summary");
        assert!(summary.contains("fail"));
        assert!(summary.contains("0 of 0 chunks completed"));
    }

    #[tokio::test]
    async fn test_unknown_next_step_fails_the_run() {
        let graph = WorkflowGraph::builder()
            .add_step("ready", MarkReady)
            .route(|state: &WorkflowState<()>| match state.status {
                RunStatus::Ready => Next::step("missing"),
                RunStatus::ErrorHandling => Next::Error,
                _ => Next::End,
            })
            .start_with("ready")
            .build()
            .expect("valid graph");

        let outcome = graph.run(WorkflowState::new("doc", ())).await;
        assert!(!outcome.success);
        assert_eq!(outcome.errors()[0].kind, ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_iteration_cap_aborts_looping_route() {
        // A route that never terminates.
        let graph = WorkflowGraph::builder()
            .add_step("ready", MarkReady)
            .route(|state: &WorkflowState<()>| match state.status {
                RunStatus::ErrorHandling => Next::Error,
                _ => Next::step("ready"),
            })
            .start_with("ready")
            .max_iterations(25)
            .build()
            .expect("valid graph");

        let outcome = graph.run(WorkflowState::new("doc", ())).await;
        assert!(!outcome.success);
        assert_eq!(outcome.errors()[0].kind, ErrorKind::GraphNontermination);
        assert!(outcome.metrics.steps_executed <= 25);
    }

    #[tokio::test]
    async fn test_builder_validation() {
        let missing_start = WorkflowGraph::<()>::builder()
            .add_step("ready", MarkReady)
            .route(end_route)
            .build();
        assert!(matches!(
            missing_start,
            Err(EngineError::Configuration(_))
        ));

        let missing_route = WorkflowGraph::<()>::builder()
            .add_step("ready", MarkReady)
            .start_with("ready")
            .build();
        assert!(matches!(
            missing_route,
            Err(EngineError::Configuration(_))
        ));

        let unknown_start = WorkflowGraph::<()>::builder()
            .add_step("ready", MarkReady)
            .route(end_route)
            .start_with("other")
            .build();
        assert!(matches!(unknown_start, Err(EngineError::StepNotFound(_))));
    }

    #[tokio::test]
    async fn test_graph_is_reusable_across_concurrent_runs() {
        let graph = Arc::new(
            WorkflowGraph::builder()
                .add_step("ready", MarkReady)
                .route(end_route)
                .start_with("ready")
                .build()
                .expect("valid graph"),
        );

        let mut handles = Vec::new();
        for i in 0..8 {
            let graph = graph.clone();
            handles.push(tokio::spawn(async move {
                graph.run(WorkflowState::new(format!("doc-{i}"), ())).await
            }));
        }
        for handle in handles {
            let outcome = handle.await.expect("task");
            assert!(outcome.success);
        }
    }

    #[tokio::test]
    async fn test_bounded_loop_shape() {
        // A counting loop driven entirely by routing: the loop body runs
        // until the counter in the domain reaches 3.
        #[derive(Clone, Default)]
        struct Counter {
            n: u32,
        }

        struct Increment;

        #[async_trait]
        impl Step<Counter> for Increment {
            async fn execute(
                &self,
                _state: &WorkflowState<Counter>,
            ) -> Result<StateUpdate<Counter>, EngineError> {
                Ok(StateUpdate::new().domain(|d: &mut Counter| d.n += 1))
            }
        }

        let graph = WorkflowGraph::builder()
            .add_step("increment", Increment)
            .route(|state: &WorkflowState<Counter>| {
                if state.status == RunStatus::ErrorHandling {
                    Next::Error
                } else if state.domain.n < 3 {
                    Next::step("increment")
                } else {
                    Next::End
                }
            })
            .start_with("increment")
            .build()
            .expect("valid graph");

        let outcome = graph.run(WorkflowState::new("doc", Counter::default())).await;
        assert!(outcome.success);
        assert_eq!(outcome.state.domain.n, 3);
        assert_eq!(outcome.metrics.steps_executed, 3);
    }

    #[tokio::test]
    async fn test_finalizers_are_idempotent() {
        let mut state = WorkflowState::new("doc", ());
        WorkflowGraph::<()>::complete(&mut state);
        let ended = state.ended_at;
        assert_eq!(state.status, RunStatus::Completed);

        // Both finalizers are no-ops on a terminal state.
        WorkflowGraph::<()>::error_handler(&mut state);
        WorkflowGraph::<()>::complete(&mut state);
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.ended_at, ended);
        assert!(!state.metadata.contains_key("error_summary"));
    }
}
