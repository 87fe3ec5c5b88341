use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::types::{MessagesRequest, MessagesResponse};
use crate::config::{LlmConfig, RequestConfig};
use crate::error::{LlmError, LlmResult};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Client for the Anthropic Messages API
#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    request_config: RequestConfig,
}

impl LlmClient {
    /// Create a new client. Fails with [`LlmError::Disabled`] when no key is configured.
    pub fn new(config: &LlmConfig, request_config: RequestConfig) -> LlmResult<Self> {
        let api_key = config.api_key.clone().ok_or(LlmError::Disabled)?;

        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(LlmError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            request_config,
        })
    }

    /// Send one system + user exchange and return the assistant text
    pub async fn complete(&self, system: &str, user: &str) -> LlmResult<String> {
        let request =
            MessagesRequest::new(self.model.clone(), self.max_tokens, user).with_system(system);
        let response = self.send_messages(request).await?;

        response
            .text()
            .map(str::to_string)
            .ok_or_else(|| LlmError::InvalidResponse {
                message: "Response contained no text content".to_string(),
            })
    }

    /// Call the messages endpoint, backing off exponentially between attempts.
    ///
    /// Rate limits, 5xx and transport failures are retried. Other client
    /// errors and unreadable responses fail on the first attempt.
    pub async fn send_messages(&self, request: MessagesRequest) -> LlmResult<MessagesResponse> {
        let url = format!("{}/v1/messages", self.base_url);
        let max_attempts = self.request_config.max_retries.saturating_add(1);

        let mut attempts = 0;
        let mut last_error = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let backoff = 2_u64.saturating_pow(attempt - 1);
                let delay =
                    Duration::from_millis(self.request_config.retry_delay_ms.saturating_mul(backoff));
                warn!(
                    model = %self.model,
                    retry = attempt,
                    delay_ms = delay.as_millis(),
                    "Retrying LLM request"
                );
                tokio::time::sleep(delay).await;
            }

            attempts += 1;
            let start = Instant::now();
            let err = match self.execute_request(&url, &request).await {
                Ok(response) => {
                    info!(
                        model = %self.model,
                        latency_ms = start.elapsed().as_millis(),
                        attempts,
                        "LLM call succeeded"
                    );
                    return Ok(response);
                }
                Err(e) => e,
            };

            error!(
                model = %self.model,
                error = %err,
                latency_ms = start.elapsed().as_millis(),
                attempt = attempts,
                "LLM call failed"
            );

            let permanent = match &err {
                LlmError::Api { status, .. } => *status != 429 && *status < 500,
                LlmError::InvalidResponse { .. } | LlmError::Disabled => true,
                _ => false,
            };
            last_error = Some(err);
            if permanent {
                break;
            }
        }

        Err(LlmError::Unavailable {
            message: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "Unknown error".to_string()),
            retries: attempts,
        })
    }

    /// Execute a single request (internal)
    async fn execute_request(
        &self,
        url: &str,
        request: &MessagesRequest,
    ) -> LlmResult<MessagesResponse> {
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            "Calling LLM"
        );

        let response = self
            .client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout {
                        timeout_ms: self.request_config.timeout_ms,
                    }
                } else {
                    LlmError::Http(e)
                }
            })?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        response
            .json::<MessagesResponse>()
            .await
            .map_err(|e| LlmError::InvalidResponse {
                message: format!("Failed to parse response: {}", e),
            })
    }

    /// Get the base URL (for testing)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}
