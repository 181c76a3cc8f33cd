//! OpenRouter-backed gateway
//!
//! Owns the retry policy the executor deliberately lacks: rate-limited
//! requests are retried with exponential backoff, and recoverable model
//! errors fall through to the next model in the configured order.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client as HttpClient;
use tracing::{debug, error, info, warn};

use crate::agents::TaskDescriptor;
use crate::config::LlmConfig;
use crate::domain::context::ContextBundle;
use crate::error::{Error, Result};

use super::prompt::build_messages;
use super::wire::{ChatRequest, ChatResponse, Message};
use super::{GatewayError, GatewayResponse, ModelGateway, TokenUsage};

/// OpenRouter API base URL
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Base delay for exponential backoff (in milliseconds)
const BACKOFF_BASE_MS: u64 = 1000;

/// Wait assumed when a 429 carries no hint
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Gateway speaking the OpenRouter chat completions API
#[derive(Clone)]
pub struct OpenRouterGateway {
    http_client: HttpClient,
    config: LlmConfig,
    api_key: String,
    base_url: String,
}

impl std::fmt::Debug for OpenRouterGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterGateway")
            .field("base_url", &self.base_url)
            .field("default_model", &self.config.default_model)
            .field("fallback_models", &self.config.fallback_models)
            .finish()
    }
}

/// Builder for [`OpenRouterGateway`]
#[derive(Default)]
pub struct OpenRouterGatewayBuilder {
    config: Option<LlmConfig>,
    api_key: Option<String>,
    base_url: Option<String>,
    timeout_secs: Option<u64>,
}

impl OpenRouterGatewayBuilder {
    pub fn config(mut self, config: LlmConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set the base URL (defaults to OpenRouter)
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn build(self) -> Result<OpenRouterGateway> {
        let config = self.config.unwrap_or_default();
        let api_key = self
            .api_key
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| Error::ConfigError("API key is required".to_string()))?;

        let timeout_secs = self.timeout_secs.unwrap_or(config.timeout_secs);
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| Error::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(OpenRouterGateway {
            http_client,
            config,
            api_key,
            base_url: self
                .base_url
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| OPENROUTER_BASE_URL.to_string()),
        })
    }
}

impl OpenRouterGateway {
    pub fn new(config: LlmConfig, api_key: impl Into<String>) -> Result<Self> {
        Self::builder().config(config).api_key(api_key).build()
    }

    pub fn builder() -> OpenRouterGatewayBuilder {
        OpenRouterGatewayBuilder::default()
    }

    pub fn default_model(&self) -> &str {
        &self.config.default_model
    }

    pub fn fallback_models(&self) -> &[String] {
        &self.config.fallback_models
    }

    /// Send `messages` to each model in turn until one answers
    pub async fn complete_messages(
        &self,
        messages: Vec<Message>,
        model_hint: Option<&str>,
    ) -> std::result::Result<GatewayResponse, GatewayError> {
        let models = model_order(
            model_hint,
            &self.config.default_model,
            &self.config.fallback_models,
        );

        let mut attempted = Vec::new();
        let mut last_error = None;

        for model in models {
            debug!(model = %model, "Attempting chat completion");
            attempted.push(model.clone());

            let request = ChatRequest::new(&model, messages.clone())
                .with_temperature(self.config.temperature)
                .with_max_tokens(self.config.max_tokens);

            match self.execute_request(&request).await {
                Ok(response) => {
                    info!(
                        model = %response.model_used,
                        tokens = response.tokens_used.total(),
                        "Chat completion successful"
                    );
                    return Ok(response);
                }
                Err(e) if should_fall_back(&e) => {
                    warn!(model = %model, error = %e, "Model unavailable, trying next model");
                    last_error = Some(e);
                }
                Err(e) => {
                    error!(model = %model, error = %e, "Non-recoverable gateway error");
                    return Err(e);
                }
            }
        }

        match last_error {
            Some(e) if attempted.len() == 1 => Err(e),
            Some(e) => Err(GatewayError::AllModelsExhausted {
                attempted,
                last_error: e.to_string(),
            }),
            None => Err(GatewayError::AllModelsExhausted {
                attempted,
                last_error: "no model configured".to_string(),
            }),
        }
    }

    /// One model, retried while rate limited
    async fn execute_request(
        &self,
        request: &ChatRequest,
    ) -> std::result::Result<GatewayResponse, GatewayError> {
        let max_attempts = self.config.max_retries.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;

            match self.send_request(request).await {
                Err(GatewayError::RateLimited { retry_after }) if attempts < max_attempts => {
                    let suggested = retry_after.map_or(0, |wait| wait.as_secs());
                    let backoff = calculate_backoff(attempts, suggested);
                    warn!(
                        model = %request.model,
                        attempt = attempts,
                        wait_ms = backoff,
                        "Rate limited, retrying after backoff"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                outcome => return outcome,
            }
        }
    }

    async fn send_request(
        &self,
        request: &ChatRequest,
    ) -> std::result::Result<GatewayResponse, GatewayError> {
        let url = format!("{}/chat/completions", self.base_url);

        debug!(
            model = %request.model,
            messages = request.messages.len(),
            "Sending chat completion request"
        );

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", "https://github.com/demiarch/demiarch")
            .header("X-Title", "Demiarch")
            .json(request)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }

        let chat: ChatResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout
            } else {
                GatewayError::ServerError {
                    status: None,
                    message: format!("Failed to parse response: {}", e),
                }
            }
        })?;

        into_gateway_response(chat)
    }
}

#[async_trait]
impl ModelGateway for OpenRouterGateway {
    async fn complete(
        &self,
        bundle: &ContextBundle,
        task: &TaskDescriptor,
        model_hint: Option<&str>,
    ) -> std::result::Result<GatewayResponse, GatewayError> {
        self.complete_messages(build_messages(bundle, task), model_hint)
            .await
    }
}

fn into_gateway_response(chat: ChatResponse) -> std::result::Result<GatewayResponse, GatewayError> {
    let usage = chat.usage.unwrap_or_default();
    let content = chat
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message.content)
        .ok_or_else(|| GatewayError::ServerError {
            status: None,
            message: "Empty response from API".to_string(),
        })?;

    Ok(GatewayResponse {
        content,
        tokens_used: TokenUsage::new(usage.prompt_tokens, usage.completion_tokens),
        model_used: chat.model,
        cost_usd: usage.cost,
    })
}

/// Hint first, then the default, then fallbacks; duplicates dropped
fn model_order(hint: Option<&str>, default_model: &str, fallbacks: &[String]) -> Vec<String> {
    let mut models: Vec<String> = Vec::with_capacity(fallbacks.len() + 2);
    let candidates = hint
        .into_iter()
        .chain(std::iter::once(default_model))
        .chain(fallbacks.iter().map(String::as_str));
    for model in candidates {
        let model = model.trim();
        if !model.is_empty() && !models.iter().any(|m| m == model) {
            models.push(model.to_string());
        }
    }
    models
}

fn map_transport_error(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::Timeout
    } else {
        GatewayError::NetworkError(e.to_string())
    }
}

fn map_status(status: u16, body: &str) -> GatewayError {
    let message = match status {
        429 => {
            let wait = extract_retry_after(body).unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            return GatewayError::RateLimited {
                retry_after: Some(Duration::from_secs(wait)),
            };
        }
        401 => "Unauthorized: Invalid API key. Set DEMIARCH_API_KEY or OPENROUTER_API_KEY environment variable.".to_string(),
        402 => "Payment required: Insufficient credits on OpenRouter account".to_string(),
        400 => format!("Bad request: {}", body),
        403 => format!("Forbidden: {}", body),
        404 => format!("Model not found or endpoint unavailable: {}", body),
        _ => body.to_string(),
    };
    GatewayError::ServerError {
        status: Some(status),
        message,
    }
}

/// Whether the next model might succeed where this one failed
fn should_fall_back(err: &GatewayError) -> bool {
    match err {
        GatewayError::RateLimited { .. } => true,
        GatewayError::ServerError { status, message } => {
            matches!(status, Some(404 | 502 | 503)) || is_model_error(message)
        }
        _ => false,
    }
}

/// Check if an error message indicates a model-specific error
fn is_model_error(msg: &str) -> bool {
    const PATTERNS: [&str; 6] = [
        "model not found",
        "unavailable",
        "not available",
        "no available provider",
        "overloaded",
        "capacity",
    ];

    let msg = msg.to_lowercase();
    PATTERNS.iter().any(|pattern| msg.contains(pattern))
}

/// Backoff for attempt `attempt` (1-based), never shorter than the server's hint, plus up to 10% jitter
fn calculate_backoff(attempt: u32, suggested_wait_secs: u64) -> u64 {
    let exponent = attempt.saturating_sub(1).min(16);
    let base = BACKOFF_BASE_MS.saturating_mul(1u64 << exponent);
    let delay = base.max(suggested_wait_secs.saturating_mul(1000));
    let jitter = (delay / 10).max(1);
    delay + rand::thread_rng().gen_range(0..jitter)
}

/// `retry_after` from a JSON error body, top-level or under `error`
fn extract_retry_after(body: &str) -> Option<u64> {
    let json: serde_json::Value = serde_json::from_str(body).ok()?;
    json.get("retry_after")
        .or_else(|| json.get("error").and_then(|e| e.get("retry_after")))
        .and_then(|v| v.as_u64())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> LlmConfig {
        LlmConfig {
            default_model: "test/model".to_string(),
            fallback_models: vec!["fallback/model".to_string()],
            timeout_secs: 30,
            ..LlmConfig::default()
        }
    }

    #[test]
    fn test_builder() {
        let gateway = OpenRouterGateway::builder()
            .config(test_config())
            .api_key("test-key")
            .base_url("https://example.com/")
            .timeout_secs(60)
            .build()
            .unwrap();

        assert_eq!(gateway.default_model(), "test/model");
        assert_eq!(gateway.fallback_models(), &["fallback/model"]);
        assert_eq!(gateway.base_url, "https://example.com");
    }

    #[test]
    fn test_builder_requires_api_key() {
        assert!(OpenRouterGateway::builder().config(test_config()).build().is_err());
        assert!(OpenRouterGateway::new(test_config(), "  ").is_err());
    }

    #[test]
    fn test_debug_hides_key() {
        let gateway = OpenRouterGateway::new(test_config(), "sk-very-secret").unwrap();
        let debug = format!("{:?}", gateway);
        assert!(debug.contains("OpenRouterGateway"));
        assert!(!debug.contains("sk-very-secret"));
    }

    #[test]
    fn test_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<OpenRouterGateway>();
    }

    #[test]
    fn test_model_order() {
        let fallbacks = vec!["b".to_string(), "a".to_string()];
        assert_eq!(model_order(None, "a", &fallbacks), vec!["a", "b"]);
        assert_eq!(model_order(Some("c"), "a", &fallbacks), vec!["c", "a", "b"]);
        assert_eq!(model_order(Some(" "), "a", &[]), vec!["a"]);
    }

    #[test]
    fn test_is_model_error() {
        assert!(is_model_error("Model not found"));
        assert!(is_model_error("The model is unavailable"));
        assert!(is_model_error("No available provider for this model"));
        assert!(!is_model_error("Invalid API key"));
        assert!(!is_model_error("Network timeout"));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            map_status(429, r#"{"error": {"retry_after": 12}}"#),
            GatewayError::RateLimited {
                retry_after: Some(Duration::from_secs(12))
            }
        );
        assert_eq!(
            map_status(429, "slow down"),
            GatewayError::RateLimited {
                retry_after: Some(Duration::from_secs(DEFAULT_RETRY_AFTER_SECS))
            }
        );

        let err = map_status(401, "");
        assert!(matches!(err, GatewayError::ServerError { status: Some(401), .. }));
        assert!(!should_fall_back(&err));

        assert!(should_fall_back(&map_status(404, "no such model")));
        assert!(should_fall_back(&map_status(503, "")));
        assert!(!should_fall_back(&map_status(500, "boom")));
        assert!(!should_fall_back(&GatewayError::Timeout));
    }

    #[test]
    fn test_calculate_backoff() {
        let first = calculate_backoff(1, 0);
        assert!((BACKOFF_BASE_MS..BACKOFF_BASE_MS + BACKOFF_BASE_MS / 10).contains(&first));

        assert!(calculate_backoff(2, 0) >= BACKOFF_BASE_MS * 2);
        assert!(calculate_backoff(1, 5) >= 5000);
        assert!(calculate_backoff(200, 0) > 0);
    }

    #[test]
    fn test_extract_retry_after() {
        assert_eq!(extract_retry_after(r#"{"retry_after": 30}"#), Some(30));
        assert_eq!(extract_retry_after(r#"{"error": {"retry_after": 60}}"#), Some(60));
        assert_eq!(extract_retry_after(r#"{"message": "rate limited"}"#), None);
        assert_eq!(extract_retry_after("not json"), None);
    }

    #[test]
    fn test_response_conversion() {
        let chat: ChatResponse = serde_json::from_str(
            r#"{"model": "m", "choices": [{"message": {"role": "assistant", "content": "ok"}}],
                "usage": {"prompt_tokens": 5, "completion_tokens": 2}}"#,
        )
        .unwrap();
        let response = into_gateway_response(chat).unwrap();
        assert_eq!(response.content, "ok");
        assert_eq!(response.tokens_used, TokenUsage::new(5, 2));
        assert_eq!(response.cost_usd, None);

        let empty: ChatResponse = serde_json::from_str(r#"{"model": "m", "choices": []}"#).unwrap();
        assert!(into_gateway_response(empty).is_err());
    }
}
