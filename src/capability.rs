//! Boundary to the external capability executor (typically an LLM).

use crate::error::EngineError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A request to the external capability executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRequest {
    /// The text the capability should operate on
    pub input: String,
    /// Which capability to invoke (e.g., `"analyze_chunk"`, `"aggregate"`)
    pub capability: String,
    /// Capability-specific parameters
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
    /// Request context (chunk index, document id, run id)
    #[serde(default)]
    pub context: HashMap<String, Value>,
}

impl CapabilityRequest {
    /// Creates a request with empty parameters and context.
    pub fn new(capability: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            capability: capability.into(),
            parameters: HashMap::new(),
            context: HashMap::new(),
        }
    }

    /// Adds a context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

/// Usage metrics reported with a capability response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallMetrics {
    /// Tokens consumed by the call
    pub tokens_used: u64,
}

/// A response from the external capability executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityResponse {
    /// Raw capability output
    pub output: String,
    /// Usage metrics, if the executor reports them
    #[serde(default)]
    pub metrics: Option<CallMetrics>,
}

impl CapabilityResponse {
    /// Creates a response without metrics.
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            metrics: None,
        }
    }

    /// Tokens reported for this call, 0 when the executor reports none.
    pub fn tokens_used(&self) -> u64 {
        self.metrics.as_ref().map(|m| m.tokens_used).unwrap_or(0)
    }
}

/// The opaque external capability the engine drives.
///
/// The engine treats implementations as possibly slow and possibly flaky:
/// every call goes through the retry policy with a per-call timeout, and
/// failures surface as [`EngineError::ExternalCall`]. Implementations are
/// supplied by the surrounding application (LLM clients in production,
/// mocks in tests).
#[async_trait]
pub trait CapabilityExecutor: Send + Sync {
    /// Executes one capability call.
    async fn execute(&self, request: CapabilityRequest) -> Result<CapabilityResponse, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = CapabilityRequest::new("analyze_chunk", "some text")
            .with_context("chunk_index", serde_json::json!(3));
        assert_eq!(request.capability, "analyze_chunk");
        assert_eq!(request.input, "some text");
        assert_eq!(
            request.context.get("chunk_index"),
            Some(&serde_json::json!(3))
        );
    }

    #[test]
    fn test_response_tokens_default_to_zero() {
        assert_eq!(CapabilityResponse::new("out").tokens_used(), 0);

        let with_metrics = CapabilityResponse {
            output: "out".into(),
            metrics: Some(CallMetrics { tokens_used: 17 }),
        };
        assert_eq!(with_metrics.tokens_used(), 17);
    }
}
