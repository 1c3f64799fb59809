//! Convenient imports for the common case.

pub use crate::aggregate::{Aggregated, Aggregator};
pub use crate::capability::{
    CallMetrics, CapabilityExecutor, CapabilityRequest, CapabilityResponse,
};
pub use crate::chunker::Chunk;
pub use crate::error::{EngineError, ErrorKind, ErrorRecord};
pub use crate::graph::{GraphBuilder, RunOutcome, WorkflowGraph};
pub use crate::limiter::ConcurrencyLimiter;
pub use crate::pipeline::{DocumentPipeline, DocumentRun, PipelineConfig};
pub use crate::retry::{RetryPolicy, RetryPolicyError};
pub use crate::state::{ChunkResult, RunMetrics, RunStatus, StateUpdate, WorkflowState};
pub use crate::step::{Next, Route, Step, StepConfig, StepName};
pub use crate::trace::{NoopTrace, TraceSink};
