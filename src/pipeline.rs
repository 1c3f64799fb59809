//! The assembled chunked document pipeline.
//!
//! Wires the chunker, concurrency limiter, retry policy, aggregator, and
//! the workflow graph into one engine: initialize (validate + chunk),
//! process chunks in bounded concurrent windows, check for more, aggregate,
//! store. Errors route through the graph's error branch; partial results
//! survive into the outcome either way.

use crate::aggregate::Aggregator;
use crate::capability::{CapabilityExecutor, CapabilityRequest};
use crate::chunker;
use crate::error::{EngineError, ErrorKind, ErrorRecord};
use crate::graph::{RunOutcome, WorkflowGraph, DEFAULT_MAX_ITERATIONS};
use crate::limiter::ConcurrencyLimiter;
use crate::retry::{invoke_with_retry, RetryPolicy};
use crate::state::{ChunkResult, RunStatus, StateUpdate, WorkflowState};
use crate::step::{Next, Step, StepConfig, StepName};
use crate::trace::TraceSink;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration surface consumed by [`DocumentPipeline`].
///
/// Supplied by the surrounding application (CLI/HTTP layers live outside
/// this crate).
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Approximate token budget per chunk
    pub max_chunk_tokens: usize,
    /// Lines of overlap carried between adjacent chunks
    pub chunk_overlap_lines: usize,
    /// Bound on simultaneously in-flight chunk calls
    pub max_concurrent_chunks: usize,
    /// Retry policy for capability calls
    pub retry_policy: RetryPolicy,
    /// Per-call timeout for capability calls
    pub call_timeout: Duration,
    /// Run-loop iteration cap
    pub max_iterations: u64,
    /// Capability invoked per chunk
    pub chunk_capability: String,
    /// Capability invoked for the final synthesis
    pub aggregate_capability: String,
    /// Delimiter between partials in the synthesis input
    pub delimiter: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_chunk_tokens: 1000,
            chunk_overlap_lines: 2,
            max_concurrent_chunks: 5,
            retry_policy: RetryPolicy::exponential(2, Duration::from_millis(200)),
            call_timeout: Duration::from_secs(30),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            chunk_capability: "analyze_chunk".to_string(),
            aggregate_capability: "aggregate".to_string(),
            delimiter: "\n\n".to_string(),
        }
    }
}

/// Per-run fields carried in the workflow state's domain slot.
#[derive(Debug, Clone)]
pub struct DocumentRun {
    /// The raw document text
    pub source: String,
    /// Shared fail-fast flag for this run's chunk tasks
    pub cancel: CancellationToken,
}

impl DocumentRun {
    fn new(source: String) -> Self {
        Self {
            source,
            cancel: CancellationToken::new(),
        }
    }
}

/// The chunked document-processing workflow.
///
/// Built once, then run per document; concurrent runs share no mutable
/// state beyond the concurrency limiter's permit pool.
///
/// # Examples
///
/// ```no_run
/// use kizami::prelude::*;
/// use std::sync::Arc;
///
/// # async fn example(executor: Arc<dyn CapabilityExecutor>) -> Result<(), EngineError> {
/// let pipeline = DocumentPipeline::new(executor, PipelineConfig::default())?;
/// let outcome = pipeline.run("meeting-42", "transcript text...").await;
/// if outcome.success {
///     println!("{:?}", outcome.output);
/// }
/// # Ok(())
/// # }
/// ```
pub struct DocumentPipeline {
    graph: WorkflowGraph<DocumentRun>,
}

impl DocumentPipeline {
    /// Builds the pipeline graph for `executor` under `config`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] for a zero token budget.
    pub fn new(
        executor: Arc<dyn CapabilityExecutor>,
        config: PipelineConfig,
    ) -> Result<Self, EngineError> {
        Self::with_trace(executor, config, None)
    }

    /// Builds the pipeline with an explicit trace sink.
    pub fn with_trace(
        executor: Arc<dyn CapabilityExecutor>,
        config: PipelineConfig,
        trace: Option<Arc<dyn TraceSink<DocumentRun>>>,
    ) -> Result<Self, EngineError> {
        if config.max_chunk_tokens == 0 {
            return Err(EngineError::Configuration(
                "max_chunk_tokens must be greater than 0".to_string(),
            ));
        }

        let limiter = ConcurrencyLimiter::new(config.max_concurrent_chunks);
        let aggregator = Aggregator::new(
            executor.clone(),
            config.aggregate_capability.clone(),
            config.delimiter.clone(),
            config.retry_policy.clone(),
            config.call_timeout,
        );

        let mut builder = WorkflowGraph::builder()
            .add_step(
                "initialize",
                InitializeStep {
                    max_chunk_tokens: config.max_chunk_tokens,
                    overlap_lines: config.chunk_overlap_lines,
                },
            )
            .add_step(
                "process_chunks",
                ProcessChunksStep {
                    executor,
                    limiter,
                    capability: config.chunk_capability.clone(),
                    retry_policy: config.retry_policy.clone(),
                    call_timeout: config.call_timeout,
                    window: config.max_concurrent_chunks.max(1),
                },
            )
            .add_step("check_chunks", CheckChunksStep)
            .add_step("aggregate", AggregateStep { aggregator })
            .add_step("store", StoreStep)
            .route(route)
            .start_with("initialize")
            .max_iterations(config.max_iterations);

        if let Some(sink) = trace {
            builder = builder.trace(sink);
        }

        Ok(Self {
            graph: builder.build()?,
        })
    }

    /// Processes one document to a terminal outcome.
    ///
    /// Never returns an error: expected failures land in the outcome's
    /// error log and summary, with partial credit for completed chunks.
    pub async fn run(
        &self,
        document_id: impl Into<String>,
        document: impl Into<String>,
    ) -> RunOutcome<DocumentRun> {
        let state = WorkflowState::new(document_id, DocumentRun::new(document.into()));
        self.graph.run(state).await
    }

    /// Like [`DocumentPipeline::run`], but wired to a caller-held
    /// cancellation token.
    ///
    /// Cancelling the token stops new chunk submissions and interrupts
    /// in-flight chunk tasks; the run then fails with a `cancelled` record
    /// while keeping any partials already produced.
    pub async fn run_with_cancellation(
        &self,
        document_id: impl Into<String>,
        document: impl Into<String>,
        cancel: CancellationToken,
    ) -> RunOutcome<DocumentRun> {
        let mut domain = DocumentRun::new(document.into());
        domain.cancel = cancel;
        let state = WorkflowState::new(document_id, domain);
        self.graph.run(state).await
    }
}

/// Routing for the document pipeline.
///
/// Keyed on the status each step leaves behind; the chunk loop routes back
/// to `process_chunks` until the cursor reaches the end of the chunk list.
fn route(state: &WorkflowState<DocumentRun>) -> Next {
    match state.status {
        RunStatus::Ready => Next::step("process_chunks"),
        RunStatus::ProcessingChunks => Next::step("check_chunks"),
        RunStatus::CheckingChunks => {
            if state.pending_chunks() > 0 {
                Next::step("process_chunks")
            } else {
                Next::step("aggregate")
            }
        }
        RunStatus::Aggregating => Next::step("store"),
        RunStatus::Storing => Next::End,
        // ErrorHandling, plus anything unexpected, takes the error branch.
        _ => Next::Error,
    }
}

/// Validates the document and splits it into chunks.
struct InitializeStep {
    max_chunk_tokens: usize,
    overlap_lines: usize,
}

#[async_trait]
impl Step<DocumentRun> for InitializeStep {
    async fn execute(
        &self,
        state: &WorkflowState<DocumentRun>,
    ) -> Result<StateUpdate<DocumentRun>, EngineError> {
        if state.domain.source.trim().is_empty() {
            return Err(EngineError::Validation("document is empty".to_string()));
        }

        let chunks = chunker::chunk(
            &state.domain.source,
            self.max_chunk_tokens,
            self.overlap_lines,
        );
        if chunks.is_empty() {
            return Err(EngineError::Validation(
                "document produced no chunks".to_string(),
            ));
        }

        info!(
            run_id = %state.run_id,
            chunks = chunks.len(),
            max_tokens = self.max_chunk_tokens,
            "document chunked"
        );
        let count = chunks.len();
        Ok(StateUpdate::new()
            .status(RunStatus::Ready)
            .chunks(chunks)
            .cursor(0)
            .metadata("chunk_count", json!(count)))
    }
}

/// Outcome of one spawned chunk task.
enum ChunkAttempt {
    Completed {
        output: String,
        tokens: u64,
        attempts: u32,
    },
    Failed(ErrorRecord),
    Cancelled,
}

/// Fans out the next window of pending chunks to the capability executor.
///
/// Submission is FIFO in document order and bounded by the limiter; each
/// task retries its own call under the shared policy. The first surfaced
/// failure cancels the run's token, which stops new submissions and
/// interrupts in-flight tasks. Successful partials merge back even when a
/// sibling chunk fails.
struct ProcessChunksStep {
    executor: Arc<dyn CapabilityExecutor>,
    limiter: ConcurrencyLimiter,
    capability: String,
    retry_policy: RetryPolicy,
    call_timeout: Duration,
    window: usize,
}

#[async_trait]
impl Step<DocumentRun> for ProcessChunksStep {
    async fn execute(
        &self,
        state: &WorkflowState<DocumentRun>,
    ) -> Result<StateUpdate<DocumentRun>, EngineError> {
        let window_end = state.chunks.len().min(state.cursor + self.window);
        let window = &state.chunks[state.cursor..window_end];
        if window.is_empty() {
            return Ok(StateUpdate::new().status(RunStatus::ProcessingChunks));
        }

        let token = state.domain.cancel.clone();
        let step_name = StepName::new("process_chunks");
        let mut tasks: JoinSet<(usize, ChunkAttempt)> = JoinSet::new();
        let mut submitted = 0usize;

        for chunk in window {
            // Fail-fast: no new submissions once cancellation is observed.
            if token.is_cancelled() {
                break;
            }
            let permit = tokio::select! {
                _ = token.cancelled() => break,
                permit = self.limiter.acquire() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let executor = self.executor.clone();
            let capability = self.capability.clone();
            let policy = self.retry_policy.clone();
            let call_timeout = self.call_timeout;
            let task_token = token.clone();
            let name = step_name.clone();
            let run_id = state.run_id.clone();
            let document_id = state.id.clone();
            let index = chunk.index;
            let text = chunk.text.clone();

            submitted += 1;
            tasks.spawn(async move {
                let _permit = permit;
                let work = invoke_with_retry(&policy, Some(call_timeout), &name, |_| {
                    let request = CapabilityRequest::new(capability.clone(), text.clone())
                        .with_context("chunk_index", json!(index))
                        .with_context("run_id", json!(run_id.clone()))
                        .with_context("document_id", json!(document_id.clone()));
                    executor.execute(request)
                });

                tokio::select! {
                    _ = task_token.cancelled() => (index, ChunkAttempt::Cancelled),
                    (result, attempts) = work => match result {
                        Ok(response) => {
                            let tokens = response.tokens_used();
                            (
                                index,
                                ChunkAttempt::Completed {
                                    output: response.output,
                                    tokens,
                                    attempts,
                                },
                            )
                        }
                        Err(error) => {
                            // First failure wins the race to cancel.
                            task_token.cancel();
                            let mut record =
                                ErrorRecord::from_engine(&error, name.clone(), attempts);
                            record.message = format!("chunk {index}: {error}");
                            (index, ChunkAttempt::Failed(record))
                        }
                    },
                }
            });
        }

        let mut update = StateUpdate::new();
        let mut completed = 0usize;
        let mut failed = false;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, ChunkAttempt::Completed {
                    output,
                    tokens,
                    attempts,
                })) => {
                    debug!(chunk = index, attempts, "chunk completed");
                    completed += 1;
                    update = update
                        .partial(ChunkResult { index, output })
                        .tokens(tokens)
                        .retries(u64::from(attempts.saturating_sub(1)));
                }
                Ok((index, ChunkAttempt::Failed(record))) => {
                    warn!(chunk = index, "chunk failed: {}", record.message);
                    failed = true;
                    update = update.error(record);
                }
                Ok((index, ChunkAttempt::Cancelled)) => {
                    debug!(chunk = index, "chunk task cancelled");
                }
                Err(join_error) => {
                    failed = true;
                    token.cancel();
                    update = update.error(ErrorRecord::new(
                        ErrorKind::Execution,
                        join_error.to_string(),
                        step_name.clone(),
                        false,
                        1,
                    ));
                }
            }
        }

        if failed {
            update = update.status(RunStatus::ErrorHandling);
        } else if completed == window.len() && submitted == window.len() {
            update = update
                .status(RunStatus::ProcessingChunks)
                .cursor(window_end);
        } else {
            // Cancelled externally before the window finished.
            update = update
                .status(RunStatus::ErrorHandling)
                .error(ErrorRecord::from_engine(
                    &EngineError::Cancelled,
                    step_name,
                    1,
                ));
        }

        Ok(update)
    }

    fn config(&self) -> StepConfig {
        // The per-call timeout governs; no outer bound on a whole window.
        StepConfig {
            timeout: None,
            retry_policy: RetryPolicy::None,
        }
    }
}

/// Decides whether the chunk loop is done.
struct CheckChunksStep;

#[async_trait]
impl Step<DocumentRun> for CheckChunksStep {
    async fn execute(
        &self,
        state: &WorkflowState<DocumentRun>,
    ) -> Result<StateUpdate<DocumentRun>, EngineError> {
        debug!(
            run_id = %state.run_id,
            pending = state.pending_chunks(),
            completed = state.partials.len(),
            "checking for remaining chunks"
        );
        Ok(StateUpdate::new().status(RunStatus::CheckingChunks))
    }
}

/// Synthesizes the final result from the ordered partials.
struct AggregateStep {
    aggregator: Aggregator,
}

#[async_trait]
impl Step<DocumentRun> for AggregateStep {
    async fn execute(
        &self,
        state: &WorkflowState<DocumentRun>,
    ) -> Result<StateUpdate<DocumentRun>, EngineError> {
        let aggregated = self.aggregator.aggregate(&state.partials).await?;

        let mut update = StateUpdate::new()
            .status(RunStatus::Aggregating)
            .final_result(aggregated.result)
            .tokens(aggregated.tokens_used)
            .retries(u64::from(aggregated.attempts.saturating_sub(1)));
        if aggregated.fell_back {
            update = update.metadata("aggregation_fallback", json!(true));
        }
        Ok(update)
    }

    fn config(&self) -> StepConfig {
        // Retries happen inside the aggregator's capability call.
        StepConfig {
            timeout: None,
            retry_policy: RetryPolicy::None,
        }
    }
}

/// Reports the finished run; persistence belongs to the caller.
struct StoreStep;

#[async_trait]
impl Step<DocumentRun> for StoreStep {
    async fn execute(
        &self,
        state: &WorkflowState<DocumentRun>,
    ) -> Result<StateUpdate<DocumentRun>, EngineError> {
        info!(
            run_id = %state.run_id,
            chunks = state.partials.len(),
            tokens = state.metrics.tokens_used,
            "document processed"
        );
        Ok(StateUpdate::new().status(RunStatus::Storing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityResponse;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Echoes `summary-<index>` per chunk and a fixed aggregate payload.
    struct ScriptedExecutor {
        aggregate_output: String,
        calls: AtomicUsize,
    }

    impl ScriptedExecutor {
        fn new(aggregate_output: &str) -> Self {
            Self {
                aggregate_output: aggregate_output.to_string(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CapabilityExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            request: CapabilityRequest,
        ) -> Result<CapabilityResponse, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if request.capability == "aggregate" {
                return Ok(CapabilityResponse::new(self.aggregate_output.clone()));
            }
            let index = request
                .context
                .get("chunk_index")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            Ok(CapabilityResponse::new(format!("summary-{index}")))
        }
    }

    fn three_line_doc() -> String {
        "alpha one two\nbeta three four\ngamma five six".to_string()
    }

    fn config_for_three_chunks() -> PipelineConfig {
        PipelineConfig {
            max_chunk_tokens: 3,
            chunk_overlap_lines: 0,
            retry_policy: RetryPolicy::None,
            ..PipelineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_pipeline_happy_path() {
        let executor = Arc::new(ScriptedExecutor::new(
            r#"{"summary": "summary-0 summary-1 summary-2"}"#,
        ));
        let pipeline =
            DocumentPipeline::new(executor, config_for_three_chunks()).expect("pipeline");

        let outcome = pipeline.run("doc-1", three_line_doc()).await;
        assert!(outcome.success);
        assert_eq!(outcome.state.status, RunStatus::Completed);
        assert_eq!(outcome.chunks_completed(), 3);
        assert_eq!(
            outcome.output,
            Some(json!({"summary": "summary-0 summary-1 summary-2"}))
        );
        let partials: Vec<&str> = outcome
            .state
            .partials
            .iter()
            .map(|p| p.output.as_str())
            .collect();
        assert_eq!(partials, ["summary-0", "summary-1", "summary-2"]);
    }

    #[tokio::test]
    async fn test_empty_document_fails_validation() {
        let executor = Arc::new(ScriptedExecutor::new("{}"));
        let pipeline =
            DocumentPipeline::new(executor, PipelineConfig::default()).expect("pipeline");

        let outcome = pipeline.run("doc-1", "   \n  \n").await;
        assert!(!outcome.success);
        assert_eq!(outcome.state.status, RunStatus::Failed);
        assert_eq!(outcome.errors()[0].kind, ErrorKind::Validation);
        assert!(outcome.error_summary.is_some());
    }

    #[tokio::test]
    async fn test_windowed_loop_processes_all_chunks() {
        // 3 chunks with a window of 1 forces the loop-back edge twice.
        let executor = Arc::new(ScriptedExecutor::new(r#"{"ok": true}"#));
        let config = PipelineConfig {
            max_concurrent_chunks: 1,
            ..config_for_three_chunks()
        };
        let pipeline = DocumentPipeline::new(executor, config).expect("pipeline");

        let outcome = pipeline.run("doc-1", three_line_doc()).await;
        assert!(outcome.success);
        assert_eq!(outcome.chunks_completed(), 3);
        // initialize + 3x(process + check) + aggregate + store
        assert_eq!(outcome.metrics.steps_executed, 9);
    }

    #[tokio::test]
    async fn test_zero_token_budget_is_rejected() {
        let executor = Arc::new(ScriptedExecutor::new("{}"));
        let config = PipelineConfig {
            max_chunk_tokens: 0,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            DocumentPipeline::new(executor, config),
            Err(EngineError::Configuration(_))
        ));
    }
}
