//! Evidence-grounded report generation over SSE.
//!
//! The route collects its own sources, runs the three-stage agent pipeline,
//! and relays the assembled markdown as paced `report` chunks.

use axum::{
    extract::{Query, State},
    response::sse::Event,
    response::Sse,
};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::api::error::ApiError;
use crate::api::validation;
use crate::db::models::User;
use crate::reports::{ReportPipeline, ReportQuality, REPORT_CHUNK_SIZE};
use crate::stream::{emit_paced_chunks, StreamEvent, StreamSession};
use crate::AppState;

const REPORT_FEATURE: &str = "topic_report";

/// Source collection gets a slightly longer window than plain search since
/// the report quality depends on it.
const COLLECT_WINDOW: Duration = Duration::from_secs(12);

const MIN_SOURCES: usize = 8;
const MAX_SOURCES: usize = 20;

#[derive(Debug, Deserialize)]
pub struct ReportParams {
    #[serde(alias = "query", default)]
    pub q: String,
    #[serde(default)]
    pub quality: ReportQuality,
    pub limit: Option<usize>,
}

pub async fn topic_report_stream(
    State(state): State<Arc<AppState>>,
    user: User,
    Query(params): Query<ReportParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let query = validation::validate_query(&params.q)?;
    let limit = params.limit.unwrap_or(MAX_SOURCES).clamp(MIN_SOURCES, MAX_SOURCES);
    let quality = params.quality;

    let context = json!({ "query": query, "quality": quality });
    let deduction = state.ledger.deduct(&user.id, REPORT_FEATURE, &context).await?;

    Ok(StreamSession::spawn("topic_report", move |session| async move {
        let start = Instant::now();
        session
            .send(StreamEvent::Init(json!({
                "ok": true,
                "query": query,
                "quality": quality,
            })))
            .await;

        session.progress("Collecting sources…").await;
        let collected = state.search.aggregate(&query, limit, COLLECT_WINDOW).await;
        session
            .send(StreamEvent::Sources(json!({
                "count": collected.papers.len(),
                "search_time_ms": collected.search_time_ms,
            })))
            .await;

        let cancel = session.cancel_token();
        let pipeline = ReportPipeline::new(&state.providers);
        let document = match pipeline
            .run(&query, &collected.papers, quality, &cancel, Some(&session))
            .await
        {
            Ok(doc) => doc,
            Err(e) => {
                let refund_ctx =
                    json!({ "query": query, "refund_reason": "pipeline_failure" });
                if let Err(re) = state
                    .ledger
                    .refund(&user.id, REPORT_FEATURE, deduction.cost, &refund_ctx)
                    .await
                {
                    tracing::error!(error = %re, "Refund after failed report did not apply");
                }
                return Err(e.into());
            }
        };

        let chunks = emit_paced_chunks(&session, &document, REPORT_CHUNK_SIZE).await;
        session
            .done(json!({
                "chunks": chunks,
                "sources": collected.papers.len(),
                "processing_time_ms": start.elapsed().as_millis() as u64,
            }))
            .await;
        Ok(())
    }))
}
