//! Model gateway boundary
//!
//! The core hands a [`ContextBundle`] and a [`TaskDescriptor`] to a
//! [`ModelGateway`] and reacts only to the final outcome. Retry, backoff and
//! model fallback live behind this trait.

mod openrouter;
mod prompt;
mod scripted;
pub mod wire;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agents::TaskDescriptor;
use crate::domain::context::ContextBundle;

pub use openrouter::{OpenRouterGateway, OpenRouterGatewayBuilder, OPENROUTER_BASE_URL};
pub use prompt::{build_messages, system_prompt};
pub use scripted::{GatewayCall, ScriptRule, ScriptedGateway};

/// Token counts reported for one completion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u32,
    pub completion: u32,
}

impl TokenUsage {
    pub fn new(prompt: u32, completion: u32) -> Self {
        Self { prompt, completion }
    }

    pub fn total(&self) -> u32 {
        self.prompt.saturating_add(self.completion)
    }
}

/// Successful gateway outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub content: String,
    pub tokens_used: TokenUsage,
    pub model_used: String,
    pub cost_usd: Option<f64>,
}

impl GatewayResponse {
    pub fn new(content: impl Into<String>, model_used: impl Into<String>, tokens_used: TokenUsage) -> Self {
        Self {
            content: content.into(),
            tokens_used,
            model_used: model_used.into(),
            cost_usd: None,
        }
    }
}

/// Final failure reported by a gateway
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    #[error("rate limited{}", retry_after_suffix(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    #[error("model call timed out")]
    Timeout,

    #[error("server error{}: {message}", status_suffix(.status))]
    ServerError { status: Option<u16>, message: String },

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("all models exhausted ({}): {last_error}", .attempted.join(", "))]
    AllModelsExhausted {
        attempted: Vec<String>,
        last_error: String,
    },
}

impl GatewayError {
    /// Whether retrying the same call later could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout | Self::NetworkError(_) => true,
            Self::ServerError { status, .. } => status.is_some_and(|s| s >= 500),
            Self::AllModelsExhausted { .. } => false,
        }
    }
}

fn retry_after_suffix(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(wait) => format!(" (retry after {}s)", wait.as_secs()),
        None => String::new(),
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" {}", code),
        None => String::new(),
    }
}

/// A language model endpoint as seen by the executor
#[async_trait]
pub trait ModelGateway: Send + Sync {
    async fn complete(
        &self,
        bundle: &ContextBundle,
        task: &TaskDescriptor,
        model_hint: Option<&str>,
    ) -> Result<GatewayResponse, GatewayError>;
}
