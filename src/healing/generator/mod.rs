//! Fix generation port.
//!
//! [`FixGenerator`] has two implementations: [`LlmFixGenerator`], which asks
//! the LLM and falls back on any failure, and [`FallbackFixGenerator`], a
//! deterministic log-shape matcher. [`from_config`] picks one.

mod fallback;
mod llm;

pub use fallback::FallbackFixGenerator;
pub use llm::{extract_json, LlmFixGenerator};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::plan::{FixPlan, HealingRequest};
use crate::config::Config;
use crate::error::HealingResult;
use crate::llm::LlmClient;

/// Produces fix plans for classified failures.
#[async_trait]
pub trait FixGenerator: Send + Sync {
    /// Generate a plan for a fresh failure.
    async fn generate_fix(&self, request: &HealingRequest) -> HealingResult<FixPlan>;

    /// Generate a new plan after a developer rejected `previous_plan_json`.
    ///
    /// The default ignores the history and generates from scratch.
    async fn regenerate_fix(
        &self,
        request: &HealingRequest,
        previous_plan_json: &str,
        feedback: &str,
    ) -> HealingResult<FixPlan> {
        let _ = (previous_plan_json, feedback);
        self.generate_fix(request).await
    }

    /// Short label for logs and audit notes.
    fn name(&self) -> &'static str;
}

/// Select the generator implied by configuration.
pub fn from_config(config: &Config) -> Arc<dyn FixGenerator> {
    if config.llm.is_active() {
        match LlmClient::new(&config.llm, config.request.clone()) {
            Ok(client) => {
                info!(model = %config.llm.model, "Using LLM fix generator");
                return Arc::new(LlmFixGenerator::new(
                    client,
                    Duration::from_millis(config.healing.llm_timeout_ms),
                ));
            }
            Err(e) => warn!(error = %e, "LLM client unavailable, using fallback generator"),
        }
    } else {
        info!("LLM disabled or no API key, using fallback generator");
    }

    Arc::new(FallbackFixGenerator::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_without_key_uses_fallback() {
        let generator = from_config(&Config::default());
        assert_eq!(generator.name(), "fallback");
    }

    #[test]
    fn test_from_config_with_key_uses_llm() {
        let mut config = Config::default();
        config.llm.api_key = Some("sk-test".to_string());
        assert_eq!(from_config(&config).name(), "llm");

        config.llm.enabled = false;
        assert_eq!(from_config(&config).name(), "fallback");
    }
}
