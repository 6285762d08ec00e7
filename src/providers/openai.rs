//! Chat-completions client for OpenAI and OpenAI-compatible APIs (Groq).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Completion, GenerateRequest, ProviderError, ProviderKind, TextGenerator, Usage};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";

const OPENAI_DEFAULT_MODEL: &str = "gpt-4o-mini";
const GROQ_DEFAULT_MODEL: &str = "llama-3.3-70b-versatile";

pub struct OpenAiCompatClient {
    kind: ProviderKind,
    base_url: String,
    default_model: &'static str,
    api_key: String,
    http: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn openai(http: reqwest::Client, api_key: String) -> Self {
        Self {
            kind: ProviderKind::Openai,
            base_url: OPENAI_BASE_URL.to_string(),
            default_model: OPENAI_DEFAULT_MODEL,
            api_key,
            http,
        }
    }

    pub fn groq(http: reqwest::Client, api_key: String) -> Self {
        Self {
            kind: ProviderKind::Groq,
            base_url: GROQ_BASE_URL.to_string(),
            default_model: GROQ_DEFAULT_MODEL,
            api_key,
            http,
        }
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[async_trait]
impl TextGenerator for OpenAiCompatClient {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn generate(&self, req: &GenerateRequest) -> Result<Completion, ProviderError> {
        let model = req.model.as_deref().unwrap_or(self.default_model);

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &req.system_prompt {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &req.prompt,
        });

        let body = ChatRequest {
            model,
            messages,
            max_tokens: req.max_tokens,
            temperature: req.temperature,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::Api {
                provider: self.kind.as_str(),
                status: response.status().as_u16(),
            });
        }

        let parsed: ChatResponse = response.json().await?;
        let usage = parsed.usage.unwrap_or_default();
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.is_empty())
            .ok_or(ProviderError::EmptyResponse(self.kind.as_str()))?;

        Ok(Completion {
            content,
            provider: self.kind,
            model: model.to_string(),
            usage: Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            },
        })
    }
}
