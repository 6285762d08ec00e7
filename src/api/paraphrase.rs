//! Paraphrasing over SSE. Groq is preferred for speed; the full provider
//! chain still applies when it is unavailable.

use axum::{
    extract::{Query, State},
    response::sse::Event,
    response::Sse,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use crate::api::error::ApiError;
use crate::db::models::User;
use crate::providers::ProviderKind;
use crate::stream::{emit_paced_tokens, StreamEvent, StreamSession};
use crate::AppState;

const PARAPHRASE_FEATURE: &str = "paraphrase";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    #[default]
    Academic,
    Fluent,
    Formal,
    Creative,
    Casual,
    Technical,
    Simple,
}

impl Tone {
    fn guidelines(&self) -> &'static str {
        match self {
            Self::Academic => {
                "Use precise, objective, and formal scholarly language. Avoid colloquialisms."
            }
            Self::Fluent => {
                "Write in smooth, natural, and easy-to-read prose with strong cohesion."
            }
            Self::Formal => "Maintain a professional, courteous, and structured tone.",
            Self::Creative => {
                "Use vivid language, varied sentence structures, and engaging phrasing \
                 while preserving meaning."
            }
            Self::Casual => "Use friendly, approachable language with simple phrasing.",
            Self::Technical => {
                "Use domain-appropriate terminology and precise definitions. Avoid ambiguity."
            }
            Self::Simple => {
                "Use clear, concise sentences with plain language suitable for a general audience."
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variation {
    Low,
    #[default]
    Medium,
    High,
}

impl Variation {
    fn instruction(&self) -> &'static str {
        match self {
            Self::Low => "Lightly rephrase with minimal changes to structure and wording.",
            Self::Medium => "Moderately rephrase with alternate wording and some structure changes.",
            Self::High => {
                "Substantially rephrase with fresh wording and varied structures \
                 while preserving meaning."
            }
        }
    }

    fn temperature(&self) -> f32 {
        match self {
            Self::Low => 0.2,
            Self::Medium => 0.5,
            Self::High => 0.8,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ParaphraseParams {
    #[serde(default)]
    pub text: String,
    #[serde(alias = "mode", default)]
    pub tone: Tone,
    #[serde(alias = "variationLevel", default)]
    pub variation: Variation,
    #[serde(alias = "preserveLength", default)]
    pub preserve_length: bool,
}

/// Rough word-to-token budget, clamped to something every provider accepts.
fn max_tokens_for(text: &str) -> u32 {
    let words = text.split_whitespace().count();
    ((words as f64 * 1.4).ceil() as u32).clamp(64, 2000)
}

fn build_system_prompt(tone: Tone, variation: Variation, preserve_length: bool) -> String {
    let length_rule = if preserve_length {
        "Keep overall length within ±10% of the original."
    } else {
        "You may change length slightly if it improves clarity."
    };
    format!(
        "You are a professional paraphrasing assistant.\n\
         Your output must:\n\
         - Preserve the original meaning and factual accuracy\n\
         - Avoid plagiarism by using novel phrasing\n\
         - Maintain logical flow, coherence, and formatting\n\
         - Keep citations, equations, inline code, and units intact\n\
         - Do not invent references or facts\n\
         {length_rule}\n\
         Style guidelines: {}\n\
         Rewrite intensity: {}",
        tone.guidelines(),
        variation.instruction(),
    )
}

pub async fn paraphrase_stream(
    State(state): State<Arc<AppState>>,
    user: User,
    Query(params): Query<ParaphraseParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let text = params.text.trim().to_string();
    if text.is_empty() {
        return Err(ApiError::validation_field("text", "Text is required"));
    }

    let context = json!({ "feature": PARAPHRASE_FEATURE, "tone": params.tone });
    let deduction = state
        .ledger
        .deduct(&user.id, PARAPHRASE_FEATURE, &context)
        .await?;

    Ok(StreamSession::spawn("paraphrase", move |session| async move {
        let start = Instant::now();
        session
            .send(StreamEvent::Init(json!({
                "tone": params.tone,
                "variation": params.variation,
            })))
            .await;

        let mut req = state.providers.default_request(format!(
            "Paraphrase the following text. Return only the rewritten text without \
             preamble:\n\n---BEGIN TEXT---\n{text}\n---END TEXT---"
        ));
        req.system_prompt = Some(build_system_prompt(
            params.tone,
            params.variation,
            params.preserve_length,
        ));
        req.temperature = params.variation.temperature();
        req.max_tokens = max_tokens_for(&text);

        let cancel = session.cancel_token();
        let completion = match state
            .providers
            .generate_with_fallback(&req, Some(ProviderKind::Groq), &cancel)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                let refund_ctx =
                    json!({ "feature": PARAPHRASE_FEATURE, "refund_reason": "provider_failure" });
                if let Err(re) = state
                    .ledger
                    .refund(&user.id, PARAPHRASE_FEATURE, deduction.cost, &refund_ctx)
                    .await
                {
                    tracing::error!(error = %re, "Refund after failed paraphrase did not apply");
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
                "processing_time_ms": start.elapsed().as_millis() as u64,
            }))
            .await;
        Ok(())
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_tokens_scales_with_words() {
        assert_eq!(max_tokens_for("one two"), 64);
        let medium = "word ".repeat(200);
        assert_eq!(max_tokens_for(&medium), 280);
        let huge = "word ".repeat(5000);
        assert_eq!(max_tokens_for(&huge), 2000);
    }

    #[test]
    fn test_variation_temperature_ordering() {
        assert!(Variation::Low.temperature() < Variation::Medium.temperature());
        assert!(Variation::Medium.temperature() < Variation::High.temperature());
    }

    #[test]
    fn test_system_prompt_carries_length_rule() {
        let fixed = build_system_prompt(Tone::Academic, Variation::Medium, true);
        assert!(fixed.contains("±10%"));
        let loose = build_system_prompt(Tone::Academic, Variation::Medium, false);
        assert!(loose.contains("change length slightly"));
    }
}
