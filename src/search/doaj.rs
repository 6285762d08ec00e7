//! DOAJ (Directory of Open Access Journals) articles API client.

use serde::Deserialize;

use super::{Paper, SearchError};

const BASE_URL: &str = "https://doaj.org/api/v2/search/articles";

#[derive(Deserialize)]
struct DoajResponse {
    #[serde(default)]
    results: Vec<DoajRecord>,
}

#[derive(Deserialize)]
struct DoajRecord {
    bibjson: Option<Bibjson>,
}

#[derive(Deserialize, Default)]
struct Bibjson {
    title: Option<String>,
    #[serde(default)]
    author: Vec<BibAuthor>,
    #[serde(rename = "abstract")]
    abstract_text: Option<String>,
    year: Option<String>,
    #[serde(default)]
    identifier: Vec<Identifier>,
    #[serde(default)]
    link: Vec<Link>,
    journal: Option<Journal>,
}

#[derive(Deserialize)]
struct BibAuthor {
    name: Option<String>,
}

#[derive(Deserialize)]
struct Identifier {
    #[serde(rename = "type")]
    kind: Option<String>,
    id: Option<String>,
}

#[derive(Deserialize)]
struct Link {
    #[serde(rename = "type")]
    kind: Option<String>,
    url: Option<String>,
}

#[derive(Deserialize)]
struct Journal {
    title: Option<String>,
}

fn to_paper(bibjson: Bibjson) -> Paper {
    let doi = bibjson
        .identifier
        .iter()
        .find(|id| id.kind.as_deref() == Some("doi"))
        .and_then(|id| id.id.clone());
    let url = bibjson
        .link
        .iter()
        .find(|l| l.kind.as_deref() == Some("fulltext"))
        .and_then(|l| l.url.clone())
        .or_else(|| doi.as_deref().map(|d| format!("https://doi.org/{}", d)))
        .unwrap_or_default();
    let title = bibjson.title.unwrap_or_default();
    Paper {
        id: doi.clone().unwrap_or_else(|| title.clone()),
        title,
        authors: bibjson
            .author
            .into_iter()
            .filter_map(|a| a.name)
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect(),
        abstract_text: bibjson.abstract_text.unwrap_or_default(),
        year: bibjson.year.unwrap_or_default(),
        journal: bibjson
            .journal
            .and_then(|j| j.title)
            .unwrap_or_else(|| "DOAJ".to_string()),
        url,
        citations: 0,
        source: "doaj".to_string(),
        doi,
    }
}

pub async fn search(
    http: &reqwest::Client,
    query: &str,
    limit: usize,
) -> Result<Vec<Paper>, SearchError> {
    let url = format!(
        "{}/{}?pageSize={}",
        BASE_URL,
        urlencoding::encode(query),
        limit.clamp(10, 50),
    );
    let response = http.get(&url).send().await?;
    if !response.status().is_success() {
        return Err(SearchError::Api {
            name: "doaj",
            status: response.status().as_u16(),
        });
    }
    let parsed: DoajResponse = response.json().await?;
    Ok(parsed
        .results
        .into_iter()
        .filter_map(|r| r.bibjson)
        .map(to_paper)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_mapping() {
        let json = r#"{
            "results": [{
                "bibjson": {
                    "title": "Open Access Study",
                    "author": [{"name": "J. Doe"}],
                    "abstract": "Findings.",
                    "year": "2021",
                    "identifier": [{"type": "doi", "id": "10.5/abc"}],
                    "link": [{"type": "fulltext", "url": "https://example.org/a.pdf"}],
                    "journal": {"title": "OA Journal"}
                }
            }]
        }"#;
        let parsed: DoajResponse = serde_json::from_str(json).unwrap();
        let papers: Vec<Paper> = parsed
            .results
            .into_iter()
            .filter_map(|r| r.bibjson)
            .map(to_paper)
            .collect();
        assert_eq!(papers.len(), 1);
        assert_eq!(papers[0].journal, "OA Journal");
        assert_eq!(papers[0].url, "https://example.org/a.pdf");
        assert_eq!(papers[0].doi.as_deref(), Some("10.5/abc"));
    }

    #[test]
    fn test_doi_fallback_url() {
        let bibjson = Bibjson {
            title: Some("No link".to_string()),
            identifier: vec![Identifier {
                kind: Some("doi".to_string()),
                id: Some("10.9/xyz".to_string()),
            }],
            ..Default::default()
        };
        let paper = to_paper(bibjson);
        assert_eq!(paper.url, "https://doi.org/10.9/xyz");
    }
}
