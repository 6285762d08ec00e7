//! Writing-assistant chat over SSE with simulated token pacing.

use axum::{
    extract::{Query, State},
    response::sse::Event,
    response::Sse,
    Extension,
};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use crate::api::error::ApiError;
use crate::api::rate_limit::RateLimitInfo;
use crate::providers::ProviderKind;
use crate::stream::{emit_paced_tokens, StreamEvent, StreamSession};
use crate::AppState;

const CHAT_FEATURE: &str = "chat";

/// Hard cap on the prompt; longer messages are rejected, not truncated.
const MAX_MESSAGE_LENGTH: usize = 10_000;

#[derive(Debug, Deserialize)]
pub struct ChatParams {
    #[serde(alias = "prompt", default)]
    pub message: String,
    #[serde(alias = "systemPrompt")]
    pub system_prompt: Option<String>,
    /// Preferred provider; the fallback chain still applies.
    pub provider: Option<String>,
    pub temperature: Option<f32>,
    #[serde(alias = "maxTokens")]
    pub max_tokens: Option<u32>,
}

pub async fn chat_stream(
    State(state): State<Arc<AppState>>,
    user: crate::db::models::User,
    rate_info: Option<Extension<RateLimitInfo>>,
    Query(params): Query<ChatParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let message = params.message.trim().to_string();
    if message.is_empty() {
        return Err(ApiError::validation_field("message", "Message is required"));
    }
    if message.len() > MAX_MESSAGE_LENGTH {
        return Err(ApiError::validation_field(
            "message",
            format!("Message too long (max {} characters)", MAX_MESSAGE_LENGTH),
        ));
    }

    let preferred = params.provider.as_deref().and_then(ProviderKind::parse);
    let context = json!({ "feature": CHAT_FEATURE, "provider": params.provider });
    let deduction = state.ledger.deduct(&user.id, CHAT_FEATURE, &context).await?;

    let rate_limit = rate_info.map(|Extension(info)| {
        json!({
            "limit": info.limit,
            "remaining": info.remaining,
            "resetAfter": info.reset_after,
        })
    });

    Ok(StreamSession::spawn("chat", move |session| async move {
        let start = Instant::now();
        session
            .send(StreamEvent::Init(json!({
                "provider": params.provider.as_deref().unwrap_or("auto"),
                "rateLimit": rate_limit,
            })))
            .await;

        let mut req = state.providers.default_request(message);
        req.system_prompt = params.system_prompt.filter(|s| !s.trim().is_empty());
        if let Some(t) = params.temperature {
            req.temperature = t.clamp(0.0, 2.0);
        }
        if let Some(m) = params.max_tokens {
            req.max_tokens = m.clamp(64, 8192);
        }

        let cancel = session.cancel_token();
        let completion = match state
            .providers
            .generate_with_fallback(&req, preferred, &cancel)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                let refund_ctx = json!({ "feature": CHAT_FEATURE, "refund_reason": "provider_failure" });
                if let Err(re) = state
                    .ledger
                    .refund(&user.id, CHAT_FEATURE, deduction.cost, &refund_ctx)
                    .await
                {
                    tracing::error!(error = %re, "Refund after failed chat did not apply");
                }
                return Err(e.into());
            }
        };

        let emitted = emit_paced_tokens(&session, &completion.content).await;
        session
            .done(json!({
                "provider": completion.provider.as_str(),
                "model": completion.model,
                "tokens": emitted,
                "usage": completion.usage,
                "processing_time_ms": start.elapsed().as_millis() as u64,
            }))
            .await;
        Ok(())
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::models::User;
    use axum::response::IntoResponse;

    async fn test_state() -> Arc<AppState> {
        let db = crate::db::init_in_memory().await.unwrap();
        Arc::new(AppState::new(Config::default(), db))
    }

    fn test_user() -> User {
        User {
            id: "u1".to_string(),
            email: "u@test".to_string(),
            password_hash: "x".to_string(),
            name: "Test".to_string(),
            role: "user".to_string(),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn params(message: String) -> ChatParams {
        ChatParams {
            message,
            system_prompt: None,
            provider: None,
            temperature: None,
            max_tokens: None,
        }
    }

    #[tokio::test]
    async fn test_rejects_blank_message() {
        let state = test_state().await;
        let result = chat_stream(
            State(state),
            test_user(),
            None,
            Query(params("   ".to_string())),
        )
        .await;
        let err = match result {
            Err(e) => e,
            Ok(_) => panic!("blank message must be rejected"),
        };
        assert_eq!(
            err.into_response().status(),
            axum::http::StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn test_rejects_oversized_message() {
        let state = test_state().await;
        let result = chat_stream(
            State(state),
            test_user(),
            None,
            Query(params("x".repeat(MAX_MESSAGE_LENGTH + 1))),
        )
        .await;
        assert!(result.is_err(), "messages over the cap must be rejected");
    }

    #[tokio::test]
    async fn test_message_at_cap_passes_validation() {
        // At exactly the cap the request clears validation and reaches the
        // ledger, which rejects the unknown user instead
        let state = test_state().await;
        let result = chat_stream(
            State(state),
            test_user(),
            None,
            Query(params("x".repeat(MAX_MESSAGE_LENGTH))),
        )
        .await;
        if let Err(e) = result {
            let status = e.into_response().status();
            assert_ne!(status, axum::http::StatusCode::BAD_REQUEST);
        }
    }
}
