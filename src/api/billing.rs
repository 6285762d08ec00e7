//! Stripe billing: checkout session creation and the fulfillment webhook.

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    Json,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::api::error::ApiError;
use crate::db::models::{CheckoutRequest, CheckoutResponse, User};
use crate::AppState;

const STRIPE_API: &str = "https://api.stripe.com/v1";

/// Reject webhook timestamps older than this (replay window).
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Deserialize)]
struct StripeSession {
    id: String,
    url: Option<String>,
}

/// Create a Stripe Checkout session for a plan and hand back its URL. The
/// plan and user travel in session metadata so the webhook can fulfill.
pub async fn create_checkout(
    State(state): State<Arc<AppState>>,
    user: User,
    Json(request): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    let secret = state
        .config
        .billing
        .stripe_secret_key
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("Billing is not configured"))?;

    let grant = state
        .config
        .billing
        .plan_grants
        .get(&request.plan)
        .copied()
        .ok_or_else(|| ApiError::validation_field("plan", "Unknown plan"))?;

    let form = [
        ("mode", "payment".to_string()),
        ("success_url", request.success_url.clone()),
        ("cancel_url", request.cancel_url.clone()),
        ("line_items[0][price_data][currency]", "usd".to_string()),
        (
            "line_items[0][price_data][product_data][name]",
            format!("Atheneum {} plan ({} tokens)", request.plan, grant),
        ),
        (
            "line_items[0][price_data][unit_amount]",
            plan_unit_amount(&request.plan).to_string(),
        ),
        ("line_items[0][quantity]", "1".to_string()),
        ("metadata[user_id]", user.id.clone()),
        ("metadata[plan]", request.plan.clone()),
    ];

    let response = state
        .http
        .post(format!("{STRIPE_API}/checkout/sessions"))
        .basic_auth(secret, None::<&str>)
        .form(&form)
        .send()
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Stripe checkout request failed");
            ApiError::upstream("Could not reach the billing provider")
        })?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        tracing::error!(%status, body, "Stripe checkout rejected");
        return Err(ApiError::upstream("Billing provider rejected the request"));
    }

    let session: StripeSession = response
        .json()
        .await
        .map_err(|_| ApiError::upstream("Billing provider returned an unexpected response"))?;
    let url = session
        .url
        .ok_or_else(|| ApiError::upstream("Checkout session has no URL"))?;

    Ok(Json(CheckoutResponse {
        url,
        session_id: session.id,
    }))
}

/// One-time price per plan, in cents.
fn plan_unit_amount(plan: &str) -> u64 {
    match plan {
        "starter" => 500,
        "pro" => 1900,
        "team" => 4900,
        _ => 900,
    }
}

/// Verify a `Stripe-Signature` header against the raw payload: HMAC-SHA256
/// over `{timestamp}.{payload}`, constant-time compare, bounded clock skew.
fn verify_signature(secret: &str, header: &str, payload: &[u8]) -> Result<(), ApiError> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => timestamp = v.parse().ok(),
            Some(("v1", v)) => signatures.push(v),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or_else(|| ApiError::bad_request("Malformed signature header"))?;
    if signatures.is_empty() {
        return Err(ApiError::bad_request("Malformed signature header"));
    }

    let age = (chrono::Utc::now().timestamp() - timestamp).abs();
    if age > SIGNATURE_TOLERANCE_SECS {
        return Err(ApiError::unauthorized("Webhook timestamp outside tolerance"));
    }

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| ApiError::internal("Webhook secret is invalid"))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());

    for sig in signatures {
        if expected.as_bytes().ct_eq(sig.as_bytes()).into() {
            return Ok(());
        }
    }
    Err(ApiError::unauthorized("Webhook signature mismatch"))
}

/// Fulfillment webhook. Only `checkout.session.completed` is acted on: the
/// plan named in the session metadata is granted to the user.
pub async fn stripe_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let secret = state
        .config
        .billing
        .stripe_webhook_secret
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("Webhooks are not configured"))?;
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("Missing Stripe-Signature header"))?;
    verify_signature(secret, signature, &body)?;

    let event: Value = serde_json::from_slice(&body)
        .map_err(|_| ApiError::bad_request("Webhook payload is not valid JSON"))?;
    let event_type = event["type"].as_str().unwrap_or_default();

    if event_type != "checkout.session.completed" {
        tracing::debug!(event_type, "Ignoring Stripe event");
        return Ok(Json(json!({ "received": true })));
    }

    let metadata = &event["data"]["object"]["metadata"];
    let user_id = metadata["user_id"].as_str().unwrap_or_default();
    let plan = metadata["plan"].as_str().unwrap_or_default();
    if user_id.is_empty() || plan.is_empty() {
        return Err(ApiError::bad_request("Checkout session is missing metadata"));
    }

    let grant = state
        .config
        .billing
        .plan_grants
        .get(plan)
        .copied()
        .ok_or_else(|| ApiError::bad_request("Checkout session names an unknown plan"))?;

    let context = json!({
        "plan": plan,
        "stripe_session": event["data"]["object"]["id"],
    });
    let status = state.ledger.grant(user_id, grant, "plan_purchase", &context).await?;
    tracing::info!(user_id, plan, grant, "Plan tokens granted");

    Ok(Json(json!({
        "received": true,
        "granted": grant,
        "monthly_limit": status.monthly_limit,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, timestamp: i64, payload: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.").as_bytes());
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn test_valid_signature_accepted() {
        let secret = "whsec_test";
        let payload = br#"{"type":"checkout.session.completed"}"#;
        let ts = chrono::Utc::now().timestamp();
        let header = format!("t={},v1={}", ts, sign(secret, ts, payload));
        assert!(verify_signature(secret, &header, payload).is_ok());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = b"{}";
        let ts = chrono::Utc::now().timestamp();
        let header = format!("t={},v1={}", ts, sign("whsec_other", ts, payload));
        assert!(verify_signature("whsec_test", &header, payload).is_err());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let secret = "whsec_test";
        let payload = b"{}";
        let ts = chrono::Utc::now().timestamp() - 3600;
        let header = format!("t={},v1={}", ts, sign(secret, ts, payload));
        assert!(verify_signature(secret, &header, payload).is_err());
    }

    #[test]
    fn test_malformed_header_rejected() {
        assert!(verify_signature("s", "no-equals-here", b"{}").is_err());
        assert!(verify_signature("s", "t=123", b"{}").is_err());
    }

    #[test]
    fn test_second_v1_signature_accepted() {
        // Stripe sends multiple v1 entries during secret rotation
        let secret = "whsec_test";
        let payload = b"{}";
        let ts = chrono::Utc::now().timestamp();
        let good = sign(secret, ts, payload);
        let header = format!("t={ts},v1=deadbeef,v1={good}");
        assert!(verify_signature(secret, &header, payload).is_ok());
    }
}
