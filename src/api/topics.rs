//! Topic discovery over SSE: collect sources, score them, cluster them, and
//! extract topic insights.

use axum::{
    extract::{Query, State},
    response::sse::Event,
    response::Sse,
};
use futures::Stream;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::validation;
use crate::cluster;
use crate::db::models::User;
use crate::reports::ReportQuality;
use crate::search::SearchUpdate;
use crate::stream::{StreamEvent, StreamSession};
use crate::AppState;

const TOPICS_FEATURE: &str = "topics_find";

const DEFAULT_LIMIT: usize = 20;

/// Density fallback kicks in when k-means yields fewer than 2 real groups.
const DENSITY_THRESHOLD: f32 = 0.84;
const MIN_CLUSTER_SIZE: usize = 2;

lazy_static! {
    /// First JSON array in a completion, across newlines.
    static ref JSON_ARRAY: Regex = Regex::new(r"(?s)\[.*\]").unwrap();
}

#[derive(Debug, Deserialize)]
pub struct TopicsParams {
    #[serde(alias = "query", default)]
    pub q: String,
    pub limit: Option<usize>,
    #[serde(default)]
    pub quality: ReportQuality,
}

/// A collected source, as echoed to the client in `sources` events.
#[derive(Debug, Clone, Serialize)]
struct SourceItem {
    title: String,
    url: String,
    snippet: String,
    source: String,
    year: String,
}

#[derive(Debug, Serialize, PartialEq)]
struct TopicMetrics {
    relevance: f64,
    diversity: f64,
    coverage: f64,
    sources: usize,
}

/// Hostname of a URL without the `www.` prefix; empty when unparseable.
fn domain_of(url: &str) -> Option<String> {
    let rest = url.split("//").nth(1)?;
    let host = rest.split(['/', '?', '#']).next()?;
    let host = host.split('@').last()?.split(':').next()?;
    if host.is_empty() {
        return None;
    }
    Some(host.trim_start_matches("www.").to_lowercase())
}

/// Relevance is a floor of 0.6 plus the average fraction of query terms found
/// in titles; diversity counts distinct domains against the source count;
/// coverage saturates at 20 sources.
fn compute_metrics(query: &str, items: &[SourceItem]) -> TopicMetrics {
    let sources = items.len();

    let domains: std::collections::HashSet<String> =
        items.iter().filter_map(|it| domain_of(&it.url)).collect();
    let diversity = if sources > 0 {
        (domains.len() as f64 / (5.0f64).max((sources / 2) as f64)).min(1.0)
    } else {
        0.0
    };

    let tokens: Vec<String> = query
        .to_lowercase()
        .split_whitespace()
        .filter(|t| t.len() > 2)
        .map(str::to_string)
        .collect();
    let relevance = if tokens.is_empty() || sources == 0 {
        0.6
    } else {
        let denom = tokens.len().min(5) as f64;
        let avg: f64 = items
            .iter()
            .map(|it| {
                let title = it.title.to_lowercase();
                let matched = tokens.iter().filter(|t| title.contains(t.as_str())).count();
                (matched as f64 / denom).min(1.0)
            })
            .sum::<f64>()
            / sources as f64;
        0.6 + 0.4 * avg
    };

    let coverage = (sources as f64 / 20.0).min(1.0);
    TopicMetrics {
        relevance,
        diversity,
        coverage,
        sources,
    }
}

fn cluster_label(items: &[SourceItem], indices: &[usize], fallback: String) -> String {
    let titles: Vec<&str> = indices.iter().map(|&i| items[i].title.as_str()).collect();
    let tokens = cluster::top_tokens(&titles, 3);
    if tokens.is_empty() {
        fallback
    } else {
        tokens.join(", ")
    }
}

/// K-means groups of at least two members, falling back to density-based
/// components when fewer than two survive. Empty below six items.
fn compute_clusters(items: &[SourceItem]) -> Vec<serde_json::Value> {
    let n = items.len();
    if n < 6 {
        return Vec::new();
    }
    let vectors: Vec<cluster::Embedding> = items
        .iter()
        .map(|it| cluster::embed_text(&it.title, &it.snippet))
        .collect();

    let k = cluster::choose_k(n);
    let (labels, _) = cluster::kmeans(&vectors, k);
    let mut groups: Vec<Vec<usize>> = vec![Vec::new(); k];
    for (i, &label) in labels.iter().enumerate() {
        groups[label].push(i);
    }

    let mut clusters: Vec<serde_json::Value> = groups
        .iter()
        .filter(|g| g.len() >= MIN_CLUSTER_SIZE)
        .enumerate()
        .map(|(i, indices)| {
            json!({
                "id": format!("c{i}"),
                "label": cluster_label(items, indices, format!("Cluster {}", i + 1)),
                "size": indices.len(),
                "indices": indices,
            })
        })
        .collect();

    if clusters.len() < 2 {
        clusters = cluster::density_clusters(&vectors, DENSITY_THRESHOLD, MIN_CLUSTER_SIZE)
            .iter()
            .enumerate()
            .map(|(i, indices)| {
                json!({
                    "id": format!("d{i}"),
                    "label": cluster_label(items, indices, format!("Group {}", i + 1)),
                    "size": indices.len(),
                    "indices": indices,
                })
            })
            .collect();
    }
    clusters
}

/// First JSON string array in the completion; empty on any failure.
fn parse_topic_list(content: &str) -> Vec<String> {
    let Some(m) = JSON_ARRAY.find(content) else {
        return Vec::new();
    };
    let mut topics: Vec<String> =
        serde_json::from_str(m.as_str()).unwrap_or_default();
    topics.truncate(20);
    topics
}

pub async fn topics_find_stream(
    State(state): State<Arc<AppState>>,
    user: User,
    Query(params): Query<TopicsParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let query = validation::validate_query(&params.q)?;
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(10, 30);
    let quality = params.quality;

    let context = json!({ "query": query, "limit": limit });
    state.ledger.deduct(&user.id, TOPICS_FEATURE, &context).await?;

    Ok(StreamSession::spawn("topics_find", move |session| async move {
        session
            .send(StreamEvent::Init(json!({
                "ok": true,
                "query": query,
                "limit": limit,
                "quality": quality,
            })))
            .await;

        let mut items: Vec<SourceItem> = Vec::new();
        let mut updates = state.search.stream_papers(&query, limit);
        while let Some(update) = updates.recv().await {
            if session.is_cancelled() {
                return Ok(());
            }
            match update {
                SearchUpdate::Paper(p) => {
                    let item = SourceItem {
                        title: if p.title.is_empty() { p.url.clone() } else { p.title },
                        url: p.url,
                        snippet: p.abstract_text,
                        source: p.source,
                        year: p.year,
                    };
                    session
                        .send(StreamEvent::Sources(json!({ "item": &item })))
                        .await;
                    items.push(item);
                    if items.len() % 5 == 0 {
                        session
                            .send(StreamEvent::Progress(json!({
                                "message": format!("Collected {} sources…", items.len()),
                                "total": items.len(),
                            })))
                            .await;
                    }
                }
                SearchUpdate::SourceError { source, error } => {
                    session
                        .progress(format!("Warning from {source}: {error}"))
                        .await;
                }
            }
        }

        session
            .send(StreamEvent::Metrics(json!(compute_metrics(&query, &items))))
            .await;

        let clusters = compute_clusters(&items);
        if !clusters.is_empty() {
            let count = clusters.len();
            session
                .send(StreamEvent::Clusters(json!({ "clusters": clusters })))
                .await;
            session
                .send(StreamEvent::Progress(json!({
                    "message": format!("Clustering complete ({count} groups)"),
                    "total": items.len(),
                })))
                .await;
        }

        // Topic extraction is best-effort: an empty list on any failure.
        let numbered: String = items
            .iter()
            .take(30)
            .enumerate()
            .map(|(i, it)| {
                let snippet: String = it.snippet.chars().take(500).collect();
                format!("[{}] {}\n{}", i + 1, it.title, snippet)
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        let mut req = state.providers.default_request(format!(
            "Extract 10-20 concise research topics from the following papers.\n\
             Return as a JSON array of strings.\n\n{numbered}"
        ));
        req.temperature = 0.2;
        req.max_tokens = 2000;

        let cancel = session.cancel_token();
        let topics = match state.providers.generate_with_fallback(&req, None, &cancel).await {
            Ok(completion) => parse_topic_list(&completion.content),
            Err(e) => {
                tracing::debug!(error = %e, "Topic extraction failed");
                Vec::new()
            }
        };
        session
            .send(StreamEvent::Insights(json!({ "topics": topics })))
            .await;

        session.done(json!({ "total": items.len() })).await;
        Ok(())
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(title: &str, url: &str) -> SourceItem {
        SourceItem {
            title: title.to_string(),
            url: url.to_string(),
            snippet: String::new(),
            source: "test".to_string(),
            year: "2023".to_string(),
        }
    }

    #[test]
    fn test_domain_of_strips_www_and_paths() {
        assert_eq!(domain_of("https://www.nature.com/articles/1"), Some("nature.com".to_string()));
        assert_eq!(domain_of("http://arxiv.org/abs/1234"), Some("arxiv.org".to_string()));
        assert_eq!(domain_of("not a url"), None);
    }

    #[test]
    fn test_metrics_empty_items() {
        let m = compute_metrics("graph neural networks", &[]);
        assert_eq!(m.sources, 0);
        assert_eq!(m.relevance, 0.6);
        assert_eq!(m.diversity, 0.0);
        assert_eq!(m.coverage, 0.0);
    }

    #[test]
    fn test_metrics_full_title_match() {
        let items: Vec<SourceItem> = (0..20)
            .map(|i| item("graph neural networks survey", &format!("https://d{i}.org/x")))
            .collect();
        let m = compute_metrics("graph neural networks", &items);
        // Every title contains every query term
        assert!((m.relevance - 1.0).abs() < 1e-9);
        assert_eq!(m.coverage, 1.0);
        assert_eq!(m.diversity, 1.0);
        assert_eq!(m.sources, 20);
    }

    #[test]
    fn test_clusters_need_six_items() {
        let items: Vec<SourceItem> = (0..5)
            .map(|i| item(&format!("paper {i}"), "https://a.org"))
            .collect();
        assert!(compute_clusters(&items).is_empty());
    }

    #[test]
    fn test_clusters_respect_k_bounds() {
        let items: Vec<SourceItem> = (0..40)
            .map(|i| {
                if i % 2 == 0 {
                    item("deep learning vision transformers", "https://a.org")
                } else {
                    item("quantum error correction codes", "https://b.org")
                }
            })
            .collect();
        let clusters = compute_clusters(&items);
        assert!(clusters.len() <= 8);
        for c in &clusters {
            assert!(c["size"].as_u64().unwrap() >= MIN_CLUSTER_SIZE as u64);
        }
    }

    #[test]
    fn test_parse_topic_list() {
        let content = "Here you go:\n[\"graph learning\", \"molecule design\"]\nDone.";
        assert_eq!(parse_topic_list(content), vec!["graph learning", "molecule design"]);
        assert!(parse_topic_list("no json here").is_empty());
        assert!(parse_topic_list("[1, 2, 3]").is_empty());

        let many: Vec<String> = (0..30).map(|i| format!("\"t{i}\"")).collect();
        let blob = format!("[{}]", many.join(","));
        assert_eq!(parse_topic_list(&blob).len(), 20);
    }
}
