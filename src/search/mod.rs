//! Multi-source literature search.
//!
//! Fans a query out to the academic APIs in parallel, applies a per-source
//! time window, deduplicates by normalized title, and delivers papers either
//! incrementally (for SSE relays) or as a ranked batch.

mod arxiv;
mod crossref;
mod doaj;
mod openalex;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::config::SearchConfig;

/// A normalized paper record, regardless of which source produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paper {
    pub id: String,
    pub title: String,
    pub authors: Vec<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub year: String,
    pub journal: String,
    pub url: String,
    pub citations: i64,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("{name} API error: {status}")]
    Api { name: &'static str, status: u16 },
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{0} timed out")]
    Timeout(&'static str),
}

/// One item from the streaming fan-out: either a deduplicated paper or a
/// per-source failure. Source failures never abort the stream.
#[derive(Debug)]
pub enum SearchUpdate {
    Paper(Paper),
    SourceError { source: &'static str, error: String },
}

#[derive(Debug, Serialize)]
pub struct SearchResult {
    pub papers: Vec<Paper>,
    pub count: usize,
    pub search_time_ms: u64,
}

pub struct LiteratureSearch {
    http: reqwest::Client,
    source_timeout: Duration,
    contact_email: Option<String>,
    enable_arxiv: bool,
    enable_doaj: bool,
}

/// Dedup key: lowercased, trimmed title.
fn title_key(title: &str) -> String {
    title.trim().to_lowercase()
}

impl LiteratureSearch {
    pub fn from_config(cfg: &SearchConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.source_timeout_secs + 2))
            .user_agent("atheneum/0.3")
            .build()
            .unwrap_or_default();
        Self {
            http,
            source_timeout: Duration::from_secs(cfg.source_timeout_secs),
            contact_email: cfg.contact_email.clone(),
            enable_arxiv: cfg.enable_arxiv,
            enable_doaj: cfg.enable_doaj,
        }
    }

    fn spawn_sources(
        self: &Arc<Self>,
        query: &str,
        limit: usize,
    ) -> mpsc::Receiver<(&'static str, Result<Vec<Paper>, SearchError>)> {
        let (tx, rx) = mpsc::channel(8);
        let mut sources: Vec<&'static str> = vec!["openalex", "crossref"];
        if self.enable_arxiv {
            sources.push("arxiv");
        }
        if self.enable_doaj {
            sources.push("doaj");
        }

        for source in sources {
            let svc = self.clone();
            let tx = tx.clone();
            let query = query.to_string();
            tokio::spawn(async move {
                let fut = async {
                    match source {
                        "openalex" => {
                            openalex::search(
                                &svc.http,
                                &query,
                                limit,
                                svc.contact_email.as_deref(),
                            )
                            .await
                        }
                        "crossref" => {
                            crossref::search(
                                &svc.http,
                                &query,
                                limit.clamp(10, 20),
                                svc.contact_email.as_deref(),
                            )
                            .await
                        }
                        "arxiv" => arxiv::search(&svc.http, &query, limit).await,
                        _ => doaj::search(&svc.http, &query, limit).await,
                    }
                };
                let result = match timeout(svc.source_timeout, fut).await {
                    Ok(r) => r,
                    Err(_) => Err(SearchError::Timeout(source)),
                };
                let _ = tx.send((source, result)).await;
            });
        }
        rx
    }

    /// Stream deduplicated papers as sources respond, up to `limit`. Source
    /// failures are forwarded as `SourceError` updates; closing the returned
    /// receiver stops nothing upstream but unblocks the fan-out tasks.
    pub fn stream_papers(self: &Arc<Self>, query: &str, limit: usize) -> mpsc::Receiver<SearchUpdate> {
        let (tx, rx) = mpsc::channel(64);
        let sources = self.spawn_sources(query, limit);
        tokio::spawn(forward_updates(sources, tx, limit));
        rx
    }

    /// Collect from all sources within `max_duration`, then rank by citation
    /// count (descending) with publication year as the tie-breaker.
    pub async fn aggregate(
        self: &Arc<Self>,
        query: &str,
        limit: usize,
        max_duration: Duration,
    ) -> SearchResult {
        let start = Instant::now();
        let mut sources = self.spawn_sources(query, limit.max(10));
        let mut seen: HashSet<String> = HashSet::new();
        let mut collected: Vec<Paper> = Vec::new();

        let window = tokio::time::sleep(max_duration);
        tokio::pin!(window);
        loop {
            tokio::select! {
                item = sources.recv() => match item {
                    Some((_, Ok(papers))) => {
                        for paper in papers {
                            if !paper.title.is_empty() && seen.insert(title_key(&paper.title)) {
                                collected.push(paper);
                            }
                        }
                    }
                    Some((source, Err(e))) => {
                        tracing::warn!(source, error = %e, "Search source failed");
                    }
                    None => break,
                },
                _ = &mut window => break,
            }
        }

        let count = collected.len();
        rank_papers(&mut collected);
        collected.truncate(limit);
        SearchResult {
            papers: collected,
            count,
            search_time_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// Works that cite the seed work.
    pub async fn citations_forward(
        &self,
        seed: &str,
        limit: usize,
    ) -> Result<Vec<Paper>, SearchError> {
        openalex::citations_forward(&self.http, seed, limit, self.contact_email.as_deref()).await
    }

    /// References of the seed work.
    pub async fn citations_backward(
        &self,
        seed: &str,
        limit: usize,
    ) -> Result<Vec<Paper>, SearchError> {
        openalex::citations_backward(&self.http, seed, limit, self.contact_email.as_deref()).await
    }
}

/// Deduplicate and forward source batches as `SearchUpdate`s, capping at
/// `limit` papers. Source failures are forwarded, never fatal.
async fn forward_updates(
    mut sources: mpsc::Receiver<(&'static str, Result<Vec<Paper>, SearchError>)>,
    tx: mpsc::Sender<SearchUpdate>,
    limit: usize,
) {
    let mut seen: HashSet<String> = HashSet::new();
    let mut emitted = 0usize;
    while let Some((source, result)) = sources.recv().await {
        match result {
            Ok(papers) => {
                for paper in papers {
                    if paper.title.is_empty() || emitted >= limit {
                        continue;
                    }
                    if !seen.insert(title_key(&paper.title)) {
                        continue;
                    }
                    emitted += 1;
                    if tx.send(SearchUpdate::Paper(paper)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(source, error = %e, "Search source failed");
                let update = SearchUpdate::SourceError {
                    source,
                    error: e.to_string(),
                };
                if tx.send(update).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Citation count descending, then year descending. Unparseable years sort last.
pub fn rank_papers(papers: &mut [Paper]) {
    papers.sort_by(|a, b| {
        b.citations.cmp(&a.citations).then_with(|| {
            let ya = a.year.parse::<i32>().unwrap_or(0);
            let yb = b.year.parse::<i32>().unwrap_or(0);
            yb.cmp(&ya)
        })
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paper(title: &str, citations: i64, year: &str) -> Paper {
        Paper {
            id: title.to_string(),
            title: title.to_string(),
            authors: vec![],
            abstract_text: String::new(),
            year: year.to_string(),
            journal: "test".to_string(),
            url: String::new(),
            citations,
            source: "test".to_string(),
            doi: None,
        }
    }

    #[test]
    fn test_title_key_normalizes() {
        assert_eq!(title_key("  Deep Learning "), "deep learning");
        assert_eq!(title_key("DEEP LEARNING"), title_key("deep learning"));
    }

    #[test]
    fn test_rank_papers_citations_then_year() {
        let mut papers = vec![
            paper("a", 5, "2019"),
            paper("b", 50, "2010"),
            paper("c", 5, "2023"),
            paper("d", 5, "unknown"),
        ];
        rank_papers(&mut papers);
        let order: Vec<&str> = papers.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(order, vec!["b", "c", "a", "d"]);
    }

    #[tokio::test]
    async fn test_forward_updates_dedups_and_caps_at_limit() {
        let (src_tx, src_rx) = mpsc::channel::<(&'static str, Result<Vec<Paper>, SearchError>)>(8);
        let (tx, mut rx) = mpsc::channel(64);
        tokio::spawn(forward_updates(src_rx, tx, 2));

        src_tx
            .send(("openalex", Ok(vec![paper("Alpha", 1, "2020"), paper("Beta", 2, "2021")])))
            .await
            .unwrap();
        src_tx
            .send(("crossref", Ok(vec![paper("ALPHA ", 1, "2020"), paper("Gamma", 3, "2022")])))
            .await
            .unwrap();
        src_tx
            .send(("doaj", Err(SearchError::Timeout("doaj"))))
            .await
            .unwrap();
        drop(src_tx);

        let mut titles = Vec::new();
        let mut failed_sources = Vec::new();
        while let Some(update) = rx.recv().await {
            match update {
                SearchUpdate::Paper(p) => titles.push(p.title),
                SearchUpdate::SourceError { source, .. } => failed_sources.push(source),
            }
        }
        // "ALPHA " dedups against "Alpha", "Gamma" exceeds the cap, and the
        // doaj failure is relayed without ending the stream
        assert_eq!(titles, vec!["Alpha", "Beta"]);
        assert_eq!(failed_sources, vec!["doaj"]);
    }
}
