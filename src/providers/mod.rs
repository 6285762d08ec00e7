//! AI provider clients and the ordered fallback router.
//!
//! Providers return full completions; incremental delivery to clients is
//! simulated by the stream module's pacing helpers. Fallback is a fixed
//! ordered list tried sequentially until one call succeeds — there is no
//! retry-with-backoff or circuit breaking.

mod gemini;
mod openai;

pub use gemini::GeminiClient;
pub use openai::OpenAiCompatClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::ProviderConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Openai,
    Gemini,
    Groq,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Openai => "openai",
            Self::Gemini => "gemini",
            Self::Groq => "groq",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Some(Self::Openai),
            "gemini" => Some(Self::Gemini),
            "groq" => Some(Self::Groq),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    /// Provider-specific model override; each client has its own default.
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Completion {
    pub content: String,
    pub provider: ProviderKind,
    pub model: String,
    pub usage: Usage,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{0} API key not configured")]
    NotConfigured(&'static str),
    #[error("{provider} API error: {status}")]
    Api {
        provider: &'static str,
        status: u16,
    },
    #[error("{0} returned an empty response")]
    EmptyResponse(&'static str),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("generation cancelled")]
    Cancelled,
    #[error("all providers failed: {last}")]
    Exhausted { last: String },
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn generate(&self, req: &GenerateRequest) -> Result<Completion, ProviderError>;
}

/// Tries providers in the configured order until one succeeds.
pub struct ProviderRouter {
    clients: HashMap<ProviderKind, Arc<dyn TextGenerator>>,
    order: Vec<ProviderKind>,
    default_max_tokens: u32,
    default_temperature: f32,
}

impl ProviderRouter {
    pub fn from_config(cfg: &ProviderConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .unwrap_or_default();

        let mut clients: HashMap<ProviderKind, Arc<dyn TextGenerator>> = HashMap::new();
        if let Some(key) = &cfg.openai_api_key {
            clients.insert(
                ProviderKind::Openai,
                Arc::new(OpenAiCompatClient::openai(http.clone(), key.clone())),
            );
        }
        if let Some(key) = &cfg.groq_api_key {
            clients.insert(
                ProviderKind::Groq,
                Arc::new(OpenAiCompatClient::groq(http.clone(), key.clone())),
            );
        }
        if let Some(key) = &cfg.gemini_api_key {
            clients.insert(
                ProviderKind::Gemini,
                Arc::new(GeminiClient::new(http, key.clone())),
            );
        }

        let order = cfg
            .fallback_order
            .iter()
            .filter_map(|name| ProviderKind::parse(name))
            .collect();

        Self {
            clients,
            order,
            default_max_tokens: cfg.max_output_tokens,
            default_temperature: cfg.temperature,
        }
    }

    /// Build a router over explicit clients, keeping their order. Used by tests.
    pub fn with_clients(clients: Vec<Arc<dyn TextGenerator>>) -> Self {
        let order: Vec<ProviderKind> = clients.iter().map(|c| c.kind()).collect();
        let clients = clients.into_iter().map(|c| (c.kind(), c)).collect();
        Self {
            clients,
            order,
            default_max_tokens: 2048,
            default_temperature: 0.7,
        }
    }

    pub fn default_request(&self, prompt: impl Into<String>) -> GenerateRequest {
        GenerateRequest {
            prompt: prompt.into(),
            system_prompt: None,
            model: None,
            max_tokens: self.default_max_tokens,
            temperature: self.default_temperature,
        }
    }

    /// The fallback order restricted to configured providers.
    pub fn candidates(&self) -> Vec<ProviderKind> {
        self.order
            .iter()
            .copied()
            .filter(|k| self.clients.contains_key(k))
            .collect()
    }

    /// Call one specific provider (used by the report agents, which carry
    /// their own model lists).
    pub async fn generate_with(
        &self,
        kind: ProviderKind,
        req: &GenerateRequest,
    ) -> Result<Completion, ProviderError> {
        let client = self
            .clients
            .get(&kind)
            .ok_or(ProviderError::NotConfigured(kind.as_str()))?;
        client.generate(req).await
    }

    /// Try providers in declared order until one succeeds. A `preferred`
    /// provider, when given, is moved to the front. The last error is
    /// surfaced when the list is exhausted.
    pub async fn generate_with_fallback(
        &self,
        req: &GenerateRequest,
        preferred: Option<ProviderKind>,
        cancel: &CancellationToken,
    ) -> Result<Completion, ProviderError> {
        let mut candidates = self.candidates();
        if let Some(p) = preferred {
            candidates.retain(|&k| k != p);
            if self.clients.contains_key(&p) {
                candidates.insert(0, p);
            }
        }

        let mut last_error = "no providers configured".to_string();
        for kind in candidates {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }
            let client = &self.clients[&kind];
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                result = client.generate(req) => result,
            };
            match attempt {
                Ok(completion) => {
                    metrics::counter!(
                        "atheneum_provider_calls_total",
                        "provider" => kind.as_str(),
                        "outcome" => "ok",
                    )
                    .increment(1);
                    return Ok(completion);
                }
                Err(e) => {
                    metrics::counter!(
                        "atheneum_provider_calls_total",
                        "provider" => kind.as_str(),
                        "outcome" => "error",
                    )
                    .increment(1);
                    tracing::warn!(provider = kind.as_str(), error = %e, "Provider failed, trying next");
                    last_error = e.to_string();
                }
            }
        }

        Err(ProviderError::Exhausted { last: last_error })
    }
}
