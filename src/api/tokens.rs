//! Token balance, transaction history, refunds, and usage aggregates.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::db::models::{RefundRequest, TokenTransaction, User};
use crate::tokens::TokenStatus;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct TransactionParams {
    pub limit: Option<i64>,
}

pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    user: User,
) -> Result<Json<TokenStatus>, ApiError> {
    Ok(Json(state.ledger.status(&user.id).await?))
}

pub async fn list_transactions(
    State(state): State<Arc<AppState>>,
    user: User,
    Query(params): Query<TransactionParams>,
) -> Result<Json<Vec<TokenTransaction>>, ApiError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 200);
    Ok(Json(state.ledger.recent_transactions(&user.id, limit).await?))
}

pub async fn refund(
    State(state): State<Arc<AppState>>,
    user: User,
    Json(request): Json<RefundRequest>,
) -> Result<Json<TokenStatus>, ApiError> {
    if request.amount <= 0 {
        return Err(ApiError::validation_field("amount", "Amount must be positive"));
    }
    if request.feature.trim().is_empty() {
        return Err(ApiError::validation_field("feature", "Feature is required"));
    }
    let status = state
        .ledger
        .refund(&user.id, &request.feature, request.amount, &request.context)
        .await?;
    Ok(Json(status))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct FeatureUsage {
    pub feature: String,
    pub calls: i64,
    pub tokens_spent: i64,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct SearchSourceUsage {
    pub source: String,
    pub searches: i64,
    pub avg_results: f64,
    pub avg_time_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct UsageReport {
    pub balance: TokenStatus,
    pub features: Vec<FeatureUsage>,
    pub search: Vec<SearchSourceUsage>,
}

/// Per-feature spend from the transaction ledger plus per-source search
/// statistics from the usage log.
pub async fn usage(
    State(state): State<Arc<AppState>>,
    user: User,
) -> Result<Json<UsageReport>, ApiError> {
    let balance = state.ledger.status(&user.id).await?;

    let features: Vec<FeatureUsage> = sqlx::query_as(
        "SELECT feature, COUNT(*) AS calls, COALESCE(SUM(amount), 0) AS tokens_spent
         FROM token_transactions
         WHERE user_id = ? AND operation = 'deduct' AND success = 1
         GROUP BY feature
         ORDER BY tokens_spent DESC",
    )
    .bind(&user.id)
    .fetch_all(&state.db)
    .await?;

    let search: Vec<SearchSourceUsage> = sqlx::query_as(
        "SELECT source, COUNT(*) AS searches,
                COALESCE(AVG(results_count), 0.0) AS avg_results,
                COALESCE(AVG(search_time_ms), 0.0) AS avg_time_ms
         FROM search_usage
         WHERE user_id = ?
         GROUP BY source
         ORDER BY searches DESC",
    )
    .bind(&user.id)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(UsageReport {
        balance,
        features,
        search,
    }))
}
