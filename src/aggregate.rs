//! Reduces ordered per-chunk results into one final result.

use crate::capability::{CapabilityExecutor, CapabilityRequest};
use crate::error::EngineError;
use crate::retry::{invoke_with_retry, RetryPolicy};
use crate::state::ChunkResult;
use crate::step::StepName;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Combines partial results and asks the capability to synthesize a final
/// structured result.
///
/// Partials are concatenated in original chunk order (never completion
/// order) before the synthesis call. The response is parsed as a JSON
/// object; on any parse failure the raw text is wrapped as
/// `{"rawAnalysis": <text>}` instead of failing the run — aggregation
/// degrades gracefully, it does not abort the workflow.
pub struct Aggregator {
    executor: Arc<dyn CapabilityExecutor>,
    capability: String,
    delimiter: String,
    retry_policy: RetryPolicy,
    call_timeout: Duration,
}

/// A synthesized final result plus call accounting.
#[derive(Debug, Clone)]
pub struct Aggregated {
    /// The final result: the parsed object, or the raw-text fallback
    pub result: Value,
    /// Tokens reported by the synthesis call
    pub tokens_used: u64,
    /// Invocations made by the synthesis call (includes retries)
    pub attempts: u32,
    /// `true` when the raw-text fallback was taken
    pub fell_back: bool,
}

impl Aggregator {
    /// Creates an aggregator calling `capability` on `executor`.
    pub fn new(
        executor: Arc<dyn CapabilityExecutor>,
        capability: impl Into<String>,
        delimiter: impl Into<String>,
        retry_policy: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            executor,
            capability: capability.into(),
            delimiter: delimiter.into(),
            retry_policy,
            call_timeout,
        }
    }

    /// Concatenates `partials` in chunk order, ready for synthesis.
    pub fn combine(&self, partials: &[ChunkResult]) -> String {
        let mut ordered: Vec<&ChunkResult> = partials.iter().collect();
        ordered.sort_by_key(|p| p.index);
        ordered
            .iter()
            .map(|p| p.output.as_str())
            .collect::<Vec<_>>()
            .join(&self.delimiter)
    }

    /// Runs the synthesis step over the ordered partials.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Aggregation`] when there is nothing to
    /// aggregate or when the synthesis call fails irrecoverably. Parse
    /// failures are not errors; they take the raw-text fallback.
    pub async fn aggregate(&self, partials: &[ChunkResult]) -> Result<Aggregated, EngineError> {
        if partials.is_empty() {
            return Err(EngineError::Aggregation(
                "no partial results to aggregate".to_string(),
            ));
        }

        let combined = self.combine(partials);
        let step = StepName::new("aggregate");
        let (result, attempts) = invoke_with_retry(
            &self.retry_policy,
            Some(self.call_timeout),
            &step,
            |_| {
                let request = CapabilityRequest::new(self.capability.clone(), combined.clone())
                    .with_context("partial_count", json!(partials.len()));
                self.executor.execute(request)
            },
        )
        .await;

        let response = result.map_err(|e| EngineError::Aggregation(e.to_string()))?;
        let tokens_used = response.tokens_used();

        match parse_structured(&response.output) {
            Some(value) => {
                debug!(attempts, "aggregation produced structured result");
                Ok(Aggregated {
                    result: value,
                    tokens_used,
                    attempts,
                    fell_back: false,
                })
            }
            None => {
                warn!("aggregation response is not structured, keeping raw text");
                Ok(Aggregated {
                    result: json!({ "rawAnalysis": response.output }),
                    tokens_used,
                    attempts,
                    fell_back: true,
                })
            }
        }
    }
}

/// Parses `raw` as a JSON object, tolerating Markdown code fences.
///
/// Anything that is not a JSON object (scalars, arrays, invalid JSON)
/// yields `None` and the caller falls back to raw text.
fn parse_structured(raw: &str) -> Option<Value> {
    let candidate = strip_code_fences(raw);
    serde_json::from_str::<Value>(candidate)
        .ok()
        .filter(|v| v.is_object())
}

/// Strips a ```` ```json ... ``` ```` wrapper if present.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the fence's language line, then the closing fence.
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or("");
    match body.rfind("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityResponse;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Returns a canned output and records the inputs it was given.
    struct CannedExecutor {
        output: String,
        seen: Mutex<Vec<String>>,
    }

    impl CannedExecutor {
        fn new(output: &str) -> Self {
            Self {
                output: output.to_string(),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CapabilityExecutor for CannedExecutor {
        async fn execute(
            &self,
            request: CapabilityRequest,
        ) -> Result<CapabilityResponse, EngineError> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(request.input);
            }
            Ok(CapabilityResponse::new(self.output.clone()))
        }
    }

    fn partials() -> Vec<ChunkResult> {
        vec![
            ChunkResult {
                index: 2,
                output: "third".into(),
            },
            ChunkResult {
                index: 0,
                output: "first".into(),
            },
            ChunkResult {
                index: 1,
                output: "second".into(),
            },
        ]
    }

    fn aggregator(executor: Arc<dyn CapabilityExecutor>) -> Aggregator {
        Aggregator::new(
            executor,
            "aggregate",
            "\n\n",
            RetryPolicy::None,
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_combine_restores_chunk_order() {
        let agg = aggregator(Arc::new(CannedExecutor::new("{}")));
        assert_eq!(agg.combine(&partials()), "first\n\nsecond\n\nthird");
    }

    #[tokio::test]
    async fn test_structured_response_is_parsed() {
        let agg = aggregator(Arc::new(CannedExecutor::new(r#"{"summary": "all good"}"#)));
        let out = agg.aggregate(&partials()).await.expect("aggregated");
        assert!(!out.fell_back);
        assert_eq!(out.result, json!({"summary": "all good"}));
    }

    #[tokio::test]
    async fn test_fenced_json_is_accepted() {
        let fenced = "```json\n{\"summary\": \"fenced\"}\n```";
        let agg = aggregator(Arc::new(CannedExecutor::new(fenced)));
        let out = agg.aggregate(&partials()).await.expect("aggregated");
        assert!(!out.fell_back);
        assert_eq!(out.result, json!({"summary": "fenced"}));
    }

    #[tokio::test]
    async fn test_non_json_falls_back_to_raw_text() {
        let agg = aggregator(Arc::new(CannedExecutor::new("just prose, no JSON here")));
        let out = agg.aggregate(&partials()).await.expect("aggregated");
        assert!(out.fell_back);
        assert_eq!(
            out.result,
            json!({"rawAnalysis": "just prose, no JSON here"})
        );
    }

    #[tokio::test]
    async fn test_non_object_json_falls_back() {
        let agg = aggregator(Arc::new(CannedExecutor::new("[1, 2, 3]")));
        let out = agg.aggregate(&partials()).await.expect("aggregated");
        assert!(out.fell_back);
    }

    #[tokio::test]
    async fn test_empty_partials_is_an_aggregation_error() {
        let agg = aggregator(Arc::new(CannedExecutor::new("{}")));
        let result = agg.aggregate(&[]).await;
        assert!(matches!(result, Err(EngineError::Aggregation(_))));
    }

    #[tokio::test]
    async fn test_synthesis_input_is_the_ordered_concatenation() {
        let executor = Arc::new(CannedExecutor::new("{}"));
        let agg = aggregator(executor.clone());
        agg.aggregate(&partials()).await.expect("aggregated");
        let seen = executor.seen.lock().expect("lock");
        assert_eq!(seen.as_slice(), ["first\n\nsecond\n\nthird"]);
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  {\"a\":1}  "), "{\"a\":1}");
    }
}
