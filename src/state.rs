//! The mutable-by-merge record threaded through a workflow run.

use crate::chunker::Chunk;
use crate::error::ErrorRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// The lifecycle state of a workflow run.
///
/// `Initializing` is the unique start state; `Completed` and `Failed` are
/// the only terminal states. Any non-terminal state may transition to
/// `ErrorHandling`, which always leads to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run created, input not yet validated or chunked
    Initializing,
    /// Input validated and chunked, processing not yet started
    Ready,
    /// A window of chunk tasks is in flight
    ProcessingChunks,
    /// Deciding whether chunks remain to process
    CheckingChunks,
    /// Combining partial results into the final result
    Aggregating,
    /// Finalizing metrics and reporting the outcome
    Storing,
    /// An error surfaced; the error branch is running
    ErrorHandling,
    /// Terminal: the run finished successfully
    Completed,
    /// Terminal: the run failed
    Failed,
}

impl RunStatus {
    /// Returns `true` for the terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Initializing => "initializing",
            RunStatus::Ready => "ready",
            RunStatus::ProcessingChunks => "processing_chunks",
            RunStatus::CheckingChunks => "checking_chunks",
            RunStatus::Aggregating => "aggregating",
            RunStatus::Storing => "storing",
            RunStatus::ErrorHandling => "error_handling",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Counters accumulated over a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunMetrics {
    /// Tokens reported by the capability executor across all calls
    pub tokens_used: u64,
    /// Wall-clock run duration, stamped when the run terminates
    pub execution_time_ms: u64,
    /// Step invocations made by the run loop
    pub steps_executed: u64,
    /// Re-invocations made by the retry policy
    pub retries: u64,
    /// Chunks with a recorded partial result
    pub chunks_completed: usize,
}

/// A per-chunk partial result.
///
/// Carries the originating chunk index so document order can be restored
/// regardless of completion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkResult {
    /// Index of the chunk this result belongs to
    pub index: usize,
    /// Capability output for the chunk
    pub output: String,
}

/// The record threaded through a run.
///
/// Created once per run, mutated exclusively by merging [`StateUpdate`]
/// values returned from steps (plus the engine's terminal finalizers), and
/// dropped when the run loop hands the outcome back to the caller. The
/// engine owns no persistence.
///
/// `D` holds use-case-specific fields; the chunk-engine fields (`chunks`,
/// `cursor`, `partials`, `final_result`) are first-class because the
/// engine itself drives the chunk loop.
///
/// Invariants: `error_count == errors.len()`, and once the status is
/// terminal the state never changes again ([`WorkflowState::apply`] becomes
/// a no-op).
#[derive(Debug, Clone)]
pub struct WorkflowState<D> {
    /// Caller-supplied identifier for the processed document
    pub id: String,
    /// Unique identifier for this run
    pub run_id: String,
    /// Current lifecycle state
    pub status: RunStatus,
    /// When the run state was created
    pub started_at: DateTime<Utc>,
    /// When the run terminated, if it has
    pub ended_at: Option<DateTime<Utc>>,
    /// Always equals `errors.len()`
    pub error_count: usize,
    /// Append-only error log in surfacing order
    pub errors: Vec<ErrorRecord>,
    /// Accumulated run counters
    pub metrics: RunMetrics,
    /// Free-form metadata, shallow-merged from updates
    pub metadata: HashMap<String, Value>,
    /// The document's chunks in document order
    pub chunks: Vec<Chunk>,
    /// Index of the first chunk not yet processed
    pub cursor: usize,
    /// Partial results, kept sorted by chunk index
    pub partials: Vec<ChunkResult>,
    /// The aggregated final result, once produced
    pub final_result: Option<Value>,
    /// Use-case-specific fields
    pub domain: D,
}

impl<D> WorkflowState<D> {
    /// Creates a fresh run state with a random run id.
    pub fn new(id: impl Into<String>, domain: D) -> Self {
        Self {
            id: id.into(),
            run_id: Uuid::new_v4().to_string(),
            status: RunStatus::Initializing,
            started_at: Utc::now(),
            ended_at: None,
            error_count: 0,
            errors: Vec::new(),
            metrics: RunMetrics::default(),
            metadata: HashMap::new(),
            chunks: Vec::new(),
            cursor: 0,
            partials: Vec::new(),
            final_result: None,
            domain,
        }
    }

    /// Returns `true` once the run has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Number of chunks still awaiting a result.
    pub fn pending_chunks(&self) -> usize {
        self.chunks.len().saturating_sub(self.cursor)
    }

    /// Appends an error record, keeping `error_count` in sync.
    pub fn push_error(&mut self, record: ErrorRecord) {
        self.errors.push(record);
        self.error_count = self.errors.len();
    }

    /// Merges a partial update into the state.
    ///
    /// Scalars replace, list-typed fields append (`errors`, `partials`),
    /// metadata shallow-merges, token and retry counters add, and the
    /// domain patch runs last. No-op on terminal state.
    pub fn apply(&mut self, update: StateUpdate<D>) {
        if self.is_terminal() {
            return;
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        for record in update.errors {
            self.push_error(record);
        }
        if let Some(chunks) = update.chunks {
            self.chunks = chunks;
        }
        if let Some(cursor) = update.cursor {
            self.cursor = cursor;
        }
        if !update.partials.is_empty() {
            self.partials.extend(update.partials);
            self.partials.sort_by_key(|p| p.index);
        }
        self.metrics.chunks_completed = self.partials.len();
        for (key, value) in update.metadata {
            self.metadata.insert(key, value);
        }
        self.metrics.tokens_used += update.tokens_used;
        self.metrics.retries += update.retries;
        if let Some(result) = update.final_result {
            self.final_result = Some(result);
        }
        if let Some(patch) = update.domain {
            patch(&mut self.domain);
        }
    }
}

/// A sparse update returned by a step and merged into [`WorkflowState`].
///
/// Built with chained setters; unset fields leave the state untouched.
///
/// # Examples
///
/// ```
/// use kizami::{ChunkResult, RunStatus, StateUpdate};
///
/// let update: StateUpdate<()> = StateUpdate::new()
///     .status(RunStatus::ProcessingChunks)
///     .partial(ChunkResult { index: 0, output: "summary".into() })
///     .tokens(42);
/// ```
pub struct StateUpdate<D> {
    pub(crate) status: Option<RunStatus>,
    pub(crate) errors: Vec<ErrorRecord>,
    pub(crate) chunks: Option<Vec<Chunk>>,
    pub(crate) cursor: Option<usize>,
    pub(crate) partials: Vec<ChunkResult>,
    pub(crate) metadata: Vec<(String, Value)>,
    pub(crate) tokens_used: u64,
    pub(crate) retries: u64,
    pub(crate) final_result: Option<Value>,
    pub(crate) domain: Option<Box<dyn FnOnce(&mut D) + Send>>,
}

impl<D> Default for StateUpdate<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> StateUpdate<D> {
    /// Creates an empty update.
    pub fn new() -> Self {
        Self {
            status: None,
            errors: Vec::new(),
            chunks: None,
            cursor: None,
            partials: Vec::new(),
            metadata: Vec::new(),
            tokens_used: 0,
            retries: 0,
            final_result: None,
            domain: None,
        }
    }

    /// Sets the run status.
    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Appends an error record.
    pub fn error(mut self, record: ErrorRecord) -> Self {
        self.errors.push(record);
        self
    }

    /// Replaces the chunk list (set once by the initializer).
    pub fn chunks(mut self, chunks: Vec<Chunk>) -> Self {
        self.chunks = Some(chunks);
        self
    }

    /// Moves the chunk cursor.
    pub fn cursor(mut self, cursor: usize) -> Self {
        self.cursor = Some(cursor);
        self
    }

    /// Appends a partial result.
    pub fn partial(mut self, result: ChunkResult) -> Self {
        self.partials.push(result);
        self
    }

    /// Sets a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.push((key.into(), value));
        self
    }

    /// Adds to the run's token counter.
    pub fn tokens(mut self, tokens: u64) -> Self {
        self.tokens_used += tokens;
        self
    }

    /// Adds to the run's retry counter.
    pub fn retries(mut self, retries: u64) -> Self {
        self.retries += retries;
        self
    }

    /// Sets the final aggregated result.
    pub fn final_result(mut self, result: Value) -> Self {
        self.final_result = Some(result);
        self
    }

    /// Applies a patch to the domain fields during the merge.
    pub fn domain(mut self, patch: impl FnOnce(&mut D) + Send + 'static) -> Self {
        self.domain = Some(Box::new(patch));
        self
    }
}

impl<D> fmt::Debug for StateUpdate<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateUpdate")
            .field("status", &self.status)
            .field("errors", &self.errors.len())
            .field("partials", &self.partials.len())
            .field("cursor", &self.cursor)
            .field("tokens_used", &self.tokens_used)
            .field("has_final_result", &self.final_result.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, ErrorRecord};
    use serde_json::json;

    #[test]
    fn test_new_state_is_initializing() {
        let state = WorkflowState::new("doc-1", ());
        assert_eq!(state.status, RunStatus::Initializing);
        assert!(!state.is_terminal());
        assert!(state.errors.is_empty());
        assert_eq!(state.error_count, 0);
        assert!(!state.run_id.is_empty());
    }

    #[test]
    fn test_apply_merges_scalars_and_appends_lists() {
        let mut state = WorkflowState::new("doc-1", ());
        state.apply(
            StateUpdate::new()
                .status(RunStatus::Ready)
                .partial(ChunkResult {
                    index: 1,
                    output: "b".into(),
                })
                .partial(ChunkResult {
                    index: 0,
                    output: "a".into(),
                })
                .metadata("chunk_count", json!(2))
                .tokens(10),
        );

        assert_eq!(state.status, RunStatus::Ready);
        // Partials are kept sorted by chunk index.
        assert_eq!(state.partials[0].index, 0);
        assert_eq!(state.partials[1].index, 1);
        assert_eq!(state.metrics.chunks_completed, 2);
        assert_eq!(state.metadata.get("chunk_count"), Some(&json!(2)));
        assert_eq!(state.metrics.tokens_used, 10);
    }

    #[test]
    fn test_error_count_tracks_errors() {
        let mut state = WorkflowState::new("doc-1", ());
        state.apply(StateUpdate::new().error(ErrorRecord::new(
            ErrorKind::ExternalCall,
            "boom",
            "process_chunks",
            true,
            3,
        )));
        assert_eq!(state.error_count, 1);
        assert_eq!(state.error_count, state.errors.len());
    }

    #[test]
    fn test_terminal_state_is_immutable() {
        let mut state = WorkflowState::new("doc-1", ());
        state.status = RunStatus::Completed;

        state.apply(
            StateUpdate::new()
                .status(RunStatus::Failed)
                .tokens(100)
                .partial(ChunkResult {
                    index: 0,
                    output: "late".into(),
                }),
        );

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.metrics.tokens_used, 0);
        assert!(state.partials.is_empty());
    }

    #[test]
    fn test_domain_patch_applies_last() {
        #[derive(Clone, Default)]
        struct Fields {
            note: String,
        }

        let mut state = WorkflowState::new("doc-1", Fields::default());
        state.apply(StateUpdate::new().domain(|d: &mut Fields| {
            d.note = "patched".to_string();
        }));
        assert_eq!(state.domain.note, "patched");
    }

    #[test]
    fn test_pending_chunks() {
        let mut state = WorkflowState::new("doc-1", ());
        state.chunks = vec![
            Chunk {
                index: 0,
                text: "a".into(),
            },
            Chunk {
                index: 1,
                text: "b".into(),
            },
        ];
        assert_eq!(state.pending_chunks(), 2);
        state.cursor = 2;
        assert_eq!(state.pending_chunks(), 0);
    }
}
