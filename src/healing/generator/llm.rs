use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

use super::{FallbackFixGenerator, FixGenerator};
use crate::error::{HealingError, HealingResult, LlmError};
use crate::healing::plan::{FixPlan, HealingRequest};
use crate::llm::LlmClient;
use crate::prompts::{route, route_regenerate, SYSTEM_PROMPT};

/// LLM-backed generator that degrades to [`FallbackFixGenerator`].
pub struct LlmFixGenerator {
    client: LlmClient,
    fallback: FallbackFixGenerator,
    timeout: Duration,
}

impl LlmFixGenerator {
    pub fn new(client: LlmClient, timeout: Duration) -> Self {
        Self {
            client,
            fallback: FallbackFixGenerator::new(),
            timeout,
        }
    }

    /// One bounded LLM round trip, parsed into a validated plan.
    async fn ask(&self, prompt: &str) -> HealingResult<FixPlan> {
        let completion = tokio::time::timeout(self.timeout, self.client.complete(SYSTEM_PROMPT, prompt))
            .await
            .map_err(|_| LlmError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            })
            .and_then(|result| result)
            .map_err(|e| HealingError::Generation {
                message: e.to_string(),
            })?;

        FixPlan::from_json(&extract_json(&completion))
    }

    async fn ask_or_fallback(&self, request: &HealingRequest, prompt: &str) -> HealingResult<FixPlan> {
        match self.ask(prompt).await {
            Ok(plan) => {
                info!(
                    failure_type = %request.failure_type,
                    fix_type = %plan.fix_type,
                    confidence = plan.confidence_score,
                    "LLM produced fix plan"
                );
                Ok(plan)
            }
            Err(e) => {
                warn!(
                    failure_type = %request.failure_type,
                    error = %e,
                    "LLM generation failed, using fallback analysis"
                );
                self.fallback.generate_fix(request).await
            }
        }
    }
}

#[async_trait]
impl FixGenerator for LlmFixGenerator {
    async fn generate_fix(&self, request: &HealingRequest) -> HealingResult<FixPlan> {
        self.ask_or_fallback(request, &route(request)).await
    }

    async fn regenerate_fix(
        &self,
        request: &HealingRequest,
        previous_plan_json: &str,
        feedback: &str,
    ) -> HealingResult<FixPlan> {
        let prompt = route_regenerate(request, previous_plan_json, feedback);
        self.ask_or_fallback(request, &prompt).await
    }

    fn name(&self) -> &'static str {
        "llm"
    }
}

/// Extract JSON from a completion that may wrap it in markdown fences.
pub fn extract_json(completion: &str) -> String {
    // Try to find JSON in markdown code block
    if let Some(start) = completion.find("```json") {
        if let Some(end) = completion[start + 7..].find("```") {
            return completion[start + 7..start + 7 + end].trim().to_string();
        }
    }

    // Generic code block, skipping the language tag line
    if let Some(start) = completion.find("```") {
        let after_start = &completion[start + 3..];
        let json_start = after_start.find('\n').map(|n| n + 1).unwrap_or(0);
        if let Some(end) = after_start[json_start..].find("```") {
            return after_start[json_start..json_start + end].trim().to_string();
        }
    }

    // Bare object
    if let Some(start) = completion.find('{') {
        if let Some(end) = completion.rfind('}') {
            if end > start {
                return completion[start..=end].to_string();
            }
        }
    }

    completion.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_from_markdown() {
        let completion = "Here is the plan:\n```json\n{\"fixType\": \"ESCALATE\"}\n```\nDone.";
        assert_eq!(extract_json(completion), "{\"fixType\": \"ESCALATE\"}");
    }

    #[test]
    fn test_extract_json_from_generic_fence() {
        let completion = "```\n{\"a\": 1}\n```";
        assert_eq!(extract_json(completion), "{\"a\": 1}");
    }

    #[test]
    fn test_extract_json_from_prose() {
        let completion = "The answer is {\"a\": {\"b\": 2}} as requested.";
        assert_eq!(extract_json(completion), "{\"a\": {\"b\": 2}}");
    }

    #[test]
    fn test_extract_json_passthrough() {
        assert_eq!(extract_json("  no json  "), "no json");
    }
}
