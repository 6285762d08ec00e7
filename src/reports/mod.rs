//! Multi-agent topic report pipeline.
//!
//! Three staged agents (curator, analyzer, synthesizer) each carry a fixed
//! candidate list of (provider, model) pairs tried in order, first success
//! wins. The final markdown document is assembled from the stage outputs and
//! streamed back in fixed-size paced chunks.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::providers::{
    Completion, GenerateRequest, ProviderError, ProviderKind, ProviderRouter,
};
use crate::search::Paper;
use crate::stream::SessionHandle;

const MAX_SOURCES: usize = 20;

/// Report chunks are 24 code points each; pairs with the stream pacing delay.
pub const REPORT_CHUNK_SIZE: usize = 24;

const CURATION_BUDGET: Duration = Duration::from_secs(30);
const ANALYSIS_BUDGET: Duration = Duration::from_secs(90);
const SYNTHESIS_BUDGET: Duration = Duration::from_secs(120);

const CURATOR_CANDIDATES: &[(ProviderKind, &str)] = &[
    (ProviderKind::Gemini, "gemini-2.0-flash"),
    (ProviderKind::Groq, "llama-3.3-70b-versatile"),
    (ProviderKind::Openai, "gpt-4o-mini"),
];

const ANALYZER_CANDIDATES: &[(ProviderKind, &str)] = &[
    (ProviderKind::Gemini, "gemini-2.0-flash"),
    (ProviderKind::Groq, "llama-3.3-70b-versatile"),
    (ProviderKind::Openai, "gpt-4o-mini"),
];

const SYNTHESIZER_CANDIDATES: &[(ProviderKind, &str)] = &[
    (ProviderKind::Gemini, "gemini-2.5-pro"),
    (ProviderKind::Openai, "gpt-4o"),
    (ProviderKind::Groq, "llama-3.3-70b-versatile"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportQuality {
    #[default]
    Standard,
    Enhanced,
}

impl ReportQuality {
    fn word_range(&self) -> &'static str {
        match self {
            Self::Standard => "1000-1500",
            Self::Enhanced => "1500-2200",
        }
    }
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("no sources provided")]
    NoSources,
    #[error("{0} stage timed out")]
    StageTimeout(&'static str),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Number the sources the way the agents cite them: [1], [2], ...
pub fn enumerate_sources(papers: &[Paper]) -> String {
    papers
        .iter()
        .take(MAX_SOURCES)
        .enumerate()
        .map(|(i, p)| {
            let authors = if p.authors.is_empty() {
                "Unknown authors".to_string()
            } else {
                p.authors.join(", ")
            };
            format!(
                "[{}] {} ({}) — {}. {}. {}",
                i + 1,
                p.title,
                if p.year.is_empty() { "n.d." } else { &p.year },
                p.journal,
                authors,
                p.url,
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Try (provider, model) pairs in declared order; unconfigured providers are
/// skipped, the first success wins, and the last error is surfaced.
async fn try_candidates(
    providers: &ProviderRouter,
    candidates: &[(ProviderKind, &str)],
    mut req: GenerateRequest,
    cancel: &CancellationToken,
) -> Result<Completion, ReportError> {
    let mut last_error = ProviderError::Exhausted {
        last: "no providers configured".to_string(),
    };
    for &(kind, model) in candidates {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled.into());
        }
        req.model = Some(model.to_string());
        match providers.generate_with(kind, &req).await {
            Ok(completion) => return Ok(completion),
            Err(ProviderError::NotConfigured(_)) => continue,
            Err(e) => {
                tracing::warn!(
                    provider = kind.as_str(),
                    model,
                    error = %e,
                    "Report agent candidate failed"
                );
                last_error = e;
            }
        }
    }
    Err(last_error.into())
}

pub struct ReportPipeline<'a> {
    providers: &'a ProviderRouter,
}

impl<'a> ReportPipeline<'a> {
    pub fn new(providers: &'a ProviderRouter) -> Self {
        Self { providers }
    }

    async fn stage(
        &self,
        name: &'static str,
        candidates: &[(ProviderKind, &str)],
        budget: Duration,
        system: &str,
        prompt: String,
        cancel: &CancellationToken,
    ) -> Result<String, ReportError> {
        let mut req = self.providers.default_request(prompt);
        req.system_prompt = Some(system.to_string());
        let completion =
            tokio::time::timeout(budget, try_candidates(self.providers, candidates, req, cancel))
                .await
                .map_err(|_| ReportError::StageTimeout(name))??;
        Ok(completion.content)
    }

    /// Run the full pipeline and return the assembled markdown. When a
    /// session handle is given, stage transitions are reported as progress
    /// events; the caller streams the returned document itself.
    pub async fn run(
        &self,
        query: &str,
        papers: &[Paper],
        quality: ReportQuality,
        cancel: &CancellationToken,
        session: Option<&SessionHandle>,
    ) -> Result<String, ReportError> {
        if papers.is_empty() {
            return Err(ReportError::NoSources);
        }
        let sources = enumerate_sources(papers);

        if let Some(s) = session {
            s.progress("Curating trusted sources…").await;
        }
        let curation = self
            .stage(
                "curation",
                CURATOR_CANDIDATES,
                CURATION_BUDGET,
                "You are a meticulous research curator. You only trust reputable, \
                 peer-reviewed or authoritative sources.",
                format!(
                    "Topic: {query}\n\nBelow is a numbered list of candidate sources.\n\
                     Mark each as HIGH, MEDIUM, or LOW trust with a 1-line rationale.\n\
                     Return strictly a markdown table with columns: ID | Trust | Rationale.\n\n\
                     Sources:\n{sources}"
                ),
                cancel,
            )
            .await?;

        if let Some(s) = session {
            s.progress("Analyzing each source…").await;
        }
        let per_source = self
            .stage(
                "analysis",
                ANALYZER_CANDIDATES,
                ANALYSIS_BUDGET,
                "You are a precise literature analyst. Summarize without hallucinations.",
                format!(
                    "For the topic \"{query}\", write 2-3 bullet summaries for EACH numbered \
                     source below.\nUse inline citations like [1], [2] referring to the same \
                     numbering.\nReturn markdown with '## Per-source Summaries' and subsections \
                     like '### [n] Title'.\n\nSources:\n{sources}"
                ),
                cancel,
            )
            .await?;

        if let Some(s) = session {
            s.progress("Synthesizing final report…").await;
        }
        let words = quality.word_range();
        let body = self
            .stage(
                "synthesis",
                SYNTHESIZER_CANDIDATES,
                SYNTHESIS_BUDGET,
                "You are a senior research writer. Produce structured, citation-grounded reviews.",
                format!(
                    "Write a scholarly review on: \"{query}\". Use ONLY the numbered sources \
                     below. Cite inline with [n]. Length {words} words.\nStructure with clear \
                     headings (Title, Abstract, Background, Methods, Findings, Limitations, \
                     References).\nInclude an Evidence Summary Table \
                     (ID | Study | Year | Method | Key Finding | Citation).\nIf data is \
                     insufficient, write 'Data not available'.\nClose with a References section \
                     listing the same numbered items.\n\nSources:\n{sources}"
                ),
                cancel,
            )
            .await?;

        Ok(assemble_document(query, &curation, &per_source, &body))
    }
}

fn assemble_document(query: &str, curation: &str, per_source: &str, body: &str) -> String {
    format!(
        "# {query} — Evidence-Grounded Review\n\n## Source Curation\n{}\n\n{}\n\n{}",
        curation.trim(),
        per_source.trim(),
        body.trim(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{TextGenerator, Usage};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct StubGenerator {
        kind: ProviderKind,
        fail: bool,
    }

    #[async_trait]
    impl TextGenerator for StubGenerator {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn generate(&self, req: &GenerateRequest) -> Result<Completion, ProviderError> {
            if self.fail {
                return Err(ProviderError::Api {
                    provider: self.kind.as_str(),
                    status: 503,
                });
            }
            Ok(Completion {
                content: format!("{} output", req.model.as_deref().unwrap_or("default")),
                provider: self.kind,
                model: req.model.clone().unwrap_or_default(),
                usage: Usage::default(),
            })
        }
    }

    fn sample_paper(title: &str) -> Paper {
        Paper {
            id: title.to_string(),
            title: title.to_string(),
            authors: vec!["A. Author".to_string()],
            abstract_text: "An abstract.".to_string(),
            year: "2022".to_string(),
            journal: "Journal".to_string(),
            url: "https://doi.org/10.1/x".to_string(),
            citations: 3,
            source: "openalex".to_string(),
            doi: None,
        }
    }

    #[test]
    fn test_enumerate_sources_numbering() {
        let papers = vec![sample_paper("First"), sample_paper("Second")];
        let text = enumerate_sources(&papers);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("[1] First (2022)"));
        assert!(lines[1].starts_with("[2] Second"));
        assert!(lines[0].contains("A. Author"));
    }

    #[test]
    fn test_enumerate_sources_caps_at_twenty() {
        let papers: Vec<Paper> = (0..30).map(|i| sample_paper(&format!("P{i}"))).collect();
        assert_eq!(enumerate_sources(&papers).lines().count(), 20);
    }

    #[test]
    fn test_assemble_document_sections() {
        let doc = assemble_document("graphene", "curated", "summaries", "review body");
        assert!(doc.starts_with("# graphene — Evidence-Grounded Review"));
        assert!(doc.contains("## Source Curation\ncurated"));
        assert!(doc.ends_with("review body"));
    }

    #[tokio::test]
    async fn test_try_candidates_skips_unconfigured_and_falls_back() {
        // Only groq is configured and gemini (listed first) fails over to it.
        let router = ProviderRouter::with_clients(vec![
            Arc::new(StubGenerator {
                kind: ProviderKind::Gemini,
                fail: true,
            }),
            Arc::new(StubGenerator {
                kind: ProviderKind::Groq,
                fail: false,
            }),
        ]);
        let candidates: &[(ProviderKind, &str)] = &[
            (ProviderKind::Openai, "gpt-4o-mini"),
            (ProviderKind::Gemini, "gemini-2.0-flash"),
            (ProviderKind::Groq, "llama-3.3-70b-versatile"),
        ];
        let req = router.default_request("prompt");
        let cancel = CancellationToken::new();
        let completion = try_candidates(&router, candidates, req, &cancel)
            .await
            .unwrap();
        assert_eq!(completion.provider, ProviderKind::Groq);
        assert_eq!(completion.content, "llama-3.3-70b-versatile output");
    }

    #[tokio::test]
    async fn test_try_candidates_surfaces_last_error() {
        let router = ProviderRouter::with_clients(vec![Arc::new(StubGenerator {
            kind: ProviderKind::Gemini,
            fail: true,
        })]);
        let candidates: &[(ProviderKind, &str)] =
            &[(ProviderKind::Gemini, "gemini-2.0-flash")];
        let req = router.default_request("prompt");
        let cancel = CancellationToken::new();
        let err = try_candidates(&router, candidates, req, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReportError::Provider(ProviderError::Api { status: 503, .. })
        ));
    }

    #[tokio::test]
    async fn test_pipeline_requires_sources() {
        let router = ProviderRouter::with_clients(vec![]);
        let pipeline = ReportPipeline::new(&router);
        let cancel = CancellationToken::new();
        let err = pipeline
            .run("topic", &[], ReportQuality::Standard, &cancel, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ReportError::NoSources));
    }

    #[tokio::test]
    async fn test_pipeline_assembles_all_stages() {
        let router = ProviderRouter::with_clients(vec![Arc::new(StubGenerator {
            kind: ProviderKind::Gemini,
            fail: false,
        })]);
        let pipeline = ReportPipeline::new(&router);
        let cancel = CancellationToken::new();
        let doc = pipeline
            .run(
                "perovskite solar cells",
                &[sample_paper("Cell stability")],
                ReportQuality::Enhanced,
                &cancel,
                None,
            )
            .await
            .unwrap();
        assert!(doc.starts_with("# perovskite solar cells — Evidence-Grounded Review"));
        // Curator and synthesizer use different default models
        assert!(doc.contains("gemini-2.0-flash output"));
        assert!(doc.contains("gemini-2.5-pro output"));
    }
}
