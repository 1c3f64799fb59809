//! # Kizami (刻み)
//!
//! A chunked workflow engine for LLM document processing.
//!
//! The name "Kizami" (刻み) means "to chop into small pieces" in Japanese:
//! the engine splits a long document into token-bounded overlapping chunks,
//! pushes each chunk through a directed graph of named steps with
//! conditional routing and an error branch, bounds concurrency and retries
//! flaky external calls, and reduces the per-chunk partial results into one
//! final aggregate.
//!
//! ## Features
//!
//! - **Typed graph**: [`StepName`] and the [`Next`] sentinel enum replace
//!   stringly-typed routing; routing is total by construction
//! - **Async First**: built on `tokio` and `async-trait`
//! - **Bounded concurrency**: chunk fan-out through a FIFO
//!   [`ConcurrencyLimiter`], with fail-fast cancellation on fatal errors
//! - **Retry Support**: configurable retry policies (fixed delay,
//!   exponential backoff) with per-call timeouts
//! - **Graceful aggregation**: structured-JSON-then-raw-text fallback, so a
//!   malformed synthesis response degrades instead of failing the run
//! - **Partial credit**: a failed run still reports completed chunks and
//!   their partial results
//!
//! ## Quick Start
//!
//! ```rust
//! use kizami::prelude::*;
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! /// Stands in for an LLM client.
//! struct Echo;
//!
//! #[async_trait]
//! impl CapabilityExecutor for Echo {
//!     async fn execute(
//!         &self,
//!         request: CapabilityRequest,
//!     ) -> Result<CapabilityResponse, EngineError> {
//!         if request.capability == "aggregate" {
//!             Ok(CapabilityResponse::new(r#"{"summary": "done"}"#))
//!         } else {
//!             Ok(CapabilityResponse::new("chunk summary"))
//!         }
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let pipeline = DocumentPipeline::new(Arc::new(Echo), PipelineConfig::default())
//!     .expect("valid pipeline");
//!
//! let outcome = pipeline.run("doc-1", "a short document").await;
//! assert!(outcome.success);
//! assert_eq!(outcome.output, Some(serde_json::json!({"summary": "done"})));
//! # }
//! ```
//!
//! ## Custom Graphs
//!
//! The pipeline is assembled from a reusable [`WorkflowGraph`]: named steps
//! returning sparse [`StateUpdate`]s, plus one routing function consulted
//! after every merge. The same mechanism covers linear pipelines and
//! bounded loops.
//!
//! ```rust
//! use kizami::prelude::*;
//! use async_trait::async_trait;
//!
//! struct MarkReady;
//!
//! #[async_trait]
//! impl Step<()> for MarkReady {
//!     async fn execute(
//!         &self,
//!         _state: &WorkflowState<()>,
//!     ) -> Result<StateUpdate<()>, EngineError> {
//!         Ok(StateUpdate::new().status(RunStatus::Ready))
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let graph = WorkflowGraph::builder()
//!     .add_step("ready", MarkReady)
//!     .route(|state: &WorkflowState<()>| match state.status {
//!         RunStatus::ErrorHandling => Next::Error,
//!         _ => Next::End,
//!     })
//!     .start_with("ready")
//!     .build()
//!     .expect("valid graph");
//!
//! let outcome = graph.run(WorkflowState::new("doc", ())).await;
//! assert!(outcome.success);
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Expected failures never escape [`WorkflowGraph::run`]: retryable errors
//! are re-attempted under the step's [`RetryPolicy`], anything that
//! survives is recorded in the run's append-only error log, and the run
//! takes the error branch. The caller always gets a [`RunOutcome`] with a
//! `success` flag, an error summary, metrics, and whatever partial results
//! were produced.

pub mod aggregate;
pub mod capability;
pub mod chunker;
mod error;
mod graph;
mod limiter;
pub mod pipeline;
mod retry;
mod state;
mod step;
mod trace;

pub mod prelude;

pub use aggregate::{Aggregated, Aggregator};
pub use capability::{CallMetrics, CapabilityExecutor, CapabilityRequest, CapabilityResponse};
pub use chunker::Chunk;
pub use error::{EngineError, ErrorKind, ErrorRecord};
pub use graph::{GraphBuilder, RunOutcome, WorkflowGraph, DEFAULT_MAX_ITERATIONS};
pub use limiter::ConcurrencyLimiter;
pub use pipeline::{DocumentPipeline, DocumentRun, PipelineConfig};
pub use retry::{invoke_with_retry, RetryPolicy, RetryPolicyError};
pub use state::{ChunkResult, RunMetrics, RunStatus, StateUpdate, WorkflowState};
pub use step::{Next, Route, Step, StepConfig, StepName};
pub use trace::{NoopTrace, TraceSink};
