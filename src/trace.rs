//! Observational hooks for step transitions.

use crate::state::WorkflowState;
use crate::step::StepName;

/// Receives run and step-transition events for observability.
///
/// Purely observational: sinks must never affect control flow, and the
/// engine is correct with the default [`NoopTrace`]. A sink is passed
/// explicitly into the graph builder; there is no global trace
/// configuration.
pub trait TraceSink<D>: Send + Sync {
    /// Called once when a run starts.
    fn on_run_start(&self, _run_id: &str, _state: &WorkflowState<D>) {}

    /// Called after each step's update has been merged.
    fn on_transition(
        &self,
        _step: &StepName,
        _before: &WorkflowState<D>,
        _after: &WorkflowState<D>,
    ) {
    }

    /// Called once when a run reaches a terminal state.
    fn on_run_end(&self, _run_id: &str, _final_state: &WorkflowState<D>) {}
}

/// The default sink: ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTrace;

impl<D> TraceSink<D> for NoopTrace {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::WorkflowState;

    #[test]
    fn test_noop_trace_accepts_events() {
        let sink = NoopTrace;
        let state = WorkflowState::new("doc", ());
        TraceSink::on_run_start(&sink, "run", &state);
        TraceSink::on_transition(&sink, &StepName::new("s"), &state, &state);
        TraceSink::on_run_end(&sink, "run", &state);
    }
}
