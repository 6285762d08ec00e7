//! Literature search endpoints: aggregate JSON and the SSE relay.

use axum::{
    extract::{Query, State},
    response::sse::Event,
    response::Sse,
    Extension, Json,
};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::rate_limit::RateLimitInfo;
use crate::api::validation;
use crate::db::models::User;
use crate::search::{SearchResult, SearchUpdate};
use crate::stream::{StreamEvent, StreamSession};
use crate::AppState;

const SEARCH_FEATURE: &str = "literature_search";

/// How long the aggregate endpoint waits for slow sources.
const AGGREGATE_WINDOW: Duration = Duration::from_secs(10);

const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 50;

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    #[serde(alias = "q", default)]
    pub query: String,
    pub limit: Option<usize>,
    /// `forward` / `backward` switch to OpenAlex citation traversal.
    pub mode: Option<String>,
    /// Seed work for citation traversal (W-id, DOI, or title). Falls back to
    /// the query when absent.
    pub seed: Option<String>,
}

impl SearchParams {
    fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }

    fn traversal_mode(&self) -> Option<&str> {
        match self.mode.as_deref() {
            Some(m @ ("forward" | "backward")) => Some(m),
            _ => None,
        }
    }

    fn seed_or_query(&self) -> &str {
        self.seed
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.query)
    }
}

/// Best-effort usage log; failures only warn.
async fn record_usage(
    state: &AppState,
    user_id: &str,
    query: &str,
    source: &str,
    results_count: usize,
    search_time_ms: u64,
) {
    let outcome = sqlx::query(
        "INSERT INTO search_usage (id, user_id, query, source, results_count, search_time_ms)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(user_id)
    .bind(query)
    .bind(source)
    .bind(results_count as i64)
    .bind(search_time_ms as i64)
    .execute(&state.db)
    .await;
    if let Err(e) = outcome {
        tracing::warn!(error = %e, "Failed to record search usage");
    }
}

/// Fan out to all sources inside a bounded window and return the ranked batch.
pub async fn search(
    State(state): State<Arc<AppState>>,
    user: User,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResult>, ApiError> {
    let limit = params.effective_limit();

    if let Some(mode) = params.traversal_mode() {
        let seed = validation::validate_query(params.seed_or_query())?;
        let context = json!({ "query": seed, "mode": mode });
        let deduction = state.ledger.deduct(&user.id, SEARCH_FEATURE, &context).await?;

        let start = Instant::now();
        let result = match mode {
            "forward" => state.search.citations_forward(&seed, limit).await,
            _ => state.search.citations_backward(&seed, limit).await,
        };
        let papers = match result {
            Ok(p) => p,
            Err(e) => {
                let refund_ctx = json!({ "query": seed, "refund_reason": "traversal_failure" });
                if let Err(re) = state
                    .ledger
                    .refund(&user.id, SEARCH_FEATURE, deduction.cost, &refund_ctx)
                    .await
                {
                    tracing::error!(error = %re, "Refund after failed traversal did not apply");
                }
                return Err(e.into());
            }
        };

        let elapsed = start.elapsed().as_millis() as u64;
        record_usage(&state, &user.id, &seed, mode, papers.len(), elapsed).await;
        let count = papers.len();
        return Ok(Json(SearchResult {
            papers,
            count,
            search_time_ms: elapsed,
        }));
    }

    let query = validation::validate_query(&params.query)?;
    let context = json!({ "query": query });
    state.ledger.deduct(&user.id, SEARCH_FEATURE, &context).await?;

    let result = state.search.aggregate(&query, limit, AGGREGATE_WINDOW).await;
    record_usage(
        &state,
        &user.id,
        &query,
        "aggregate",
        result.count,
        result.search_time_ms,
    )
    .await;
    Ok(Json(result))
}

/// SSE relay: `init` with the rate-limit budget, a `paper` event per
/// deduplicated result as sources respond, a non-terminal `error` per failed
/// source, and a single `done` with count and processing time.
pub async fn search_stream(
    State(state): State<Arc<AppState>>,
    user: User,
    rate_info: Option<Extension<RateLimitInfo>>,
    Query(params): Query<SearchParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let limit = params.effective_limit();
    let mode = params.traversal_mode().map(str::to_string);
    let query = match &mode {
        Some(_) => validation::validate_query(params.seed_or_query())?,
        None => validation::validate_query(&params.query)?,
    };

    let context = json!({ "query": query, "mode": mode, "stream": true });
    let deduction = state.ledger.deduct(&user.id, SEARCH_FEATURE, &context).await?;

    let rate_limit = rate_info.map(|Extension(info)| {
        json!({
            "limit": info.limit,
            "remaining": info.remaining,
            "resetAfter": info.reset_after,
        })
    });

    Ok(StreamSession::spawn("search", move |session| async move {
        let start = Instant::now();
        session
            .send(StreamEvent::Init(json!({
                "ok": true,
                "query": query,
                "limit": limit,
                "mode": mode,
                "rateLimit": rate_limit,
            })))
            .await;

        let mut count = 0usize;

        match mode.as_deref() {
            Some(m) => {
                let result = if m == "forward" {
                    state.search.citations_forward(&query, limit).await
                } else {
                    state.search.citations_backward(&query, limit).await
                };
                match result {
                    Ok(papers) => {
                        for paper in papers {
                            if session.is_cancelled() {
                                break;
                            }
                            if session.send(StreamEvent::Paper(json!(paper))).await {
                                count += 1;
                            }
                        }
                    }
                    Err(e) => {
                        let refund_ctx =
                            json!({ "query": query, "refund_reason": "traversal_failure" });
                        if let Err(re) = state
                            .ledger
                            .refund(&user.id, SEARCH_FEATURE, deduction.cost, &refund_ctx)
                            .await
                        {
                            tracing::error!(error = %re, "Refund after failed traversal did not apply");
                        }
                        return Err(e.into());
                    }
                }
            }
            None => {
                let mut updates = state.search.stream_papers(&query, limit);
                while let Some(update) = updates.recv().await {
                    if session.is_cancelled() {
                        break;
                    }
                    match update {
                        SearchUpdate::Paper(paper) => {
                            if session.send(StreamEvent::Paper(json!(paper))).await {
                                count += 1;
                            }
                        }
                        SearchUpdate::SourceError { source, error } => {
                            session.source_error(source, error).await;
                        }
                    }
                }
            }
        }

        let elapsed = start.elapsed().as_millis() as u64;
        record_usage(
            &state,
            &user.id,
            &query,
            mode.as_deref().unwrap_or("stream"),
            count,
            elapsed,
        )
        .await;

        session
            .done(json!({ "count": count, "processing_time_ms": elapsed }))
            .await;
        Ok(())
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(query: &str, limit: Option<usize>, mode: Option<&str>, seed: Option<&str>) -> SearchParams {
        SearchParams {
            query: query.to_string(),
            limit,
            mode: mode.map(str::to_string),
            seed: seed.map(str::to_string),
        }
    }

    #[test]
    fn test_limit_defaults_and_clamps() {
        assert_eq!(params("q", None, None, None).effective_limit(), DEFAULT_LIMIT);
        assert_eq!(params("q", Some(500), None, None).effective_limit(), MAX_LIMIT);
        assert_eq!(params("q", Some(0), None, None).effective_limit(), 1);
    }

    #[test]
    fn test_traversal_mode_recognized() {
        assert_eq!(params("q", None, Some("forward"), None).traversal_mode(), Some("forward"));
        assert_eq!(params("q", None, Some("backward"), None).traversal_mode(), Some("backward"));
        assert_eq!(params("q", None, Some("sideways"), None).traversal_mode(), None);
        assert_eq!(params("q", None, None, None).traversal_mode(), None);
    }

    #[test]
    fn test_seed_falls_back_to_query() {
        assert_eq!(params("attention", None, None, Some("W123")).seed_or_query(), "W123");
        assert_eq!(params("attention", None, None, Some("  ")).seed_or_query(), "attention");
        assert_eq!(params("attention", None, None, None).seed_or_query(), "attention");
    }
}
