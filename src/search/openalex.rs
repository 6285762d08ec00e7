//! OpenAlex works API: keyword search and citation graph lookups.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;

use super::{Paper, SearchError};

const BASE_URL: &str = "https://api.openalex.org/works";
const DEFAULT_MAILTO: &str = "research@atheneum.dev";

lazy_static! {
    static ref WORK_ID: Regex = Regex::new(r"(?i)(?:openalex\.org/)?(W\d+)").unwrap();
    static ref DOI_URL: Regex = Regex::new(r"(?i)doi\.org/(10\.[^\s/]+/\S+)$").unwrap();
    static ref QUERY_JUNK: Regex = Regex::new(r"[^\w\s-]").unwrap();
}

#[derive(Deserialize)]
struct WorksResponse {
    #[serde(default)]
    results: Vec<Work>,
}

#[derive(Deserialize)]
struct Work {
    #[serde(default)]
    id: String,
    title: Option<String>,
    #[serde(default)]
    authorships: Vec<Authorship>,
    abstract_inverted_index: Option<BTreeMap<String, Vec<u32>>>,
    publication_year: Option<i32>,
    primary_location: Option<Location>,
    doi: Option<String>,
    #[serde(default)]
    cited_by_count: i64,
    #[serde(default)]
    referenced_works: Vec<String>,
}

#[derive(Deserialize)]
struct Authorship {
    author: Option<Author>,
}

#[derive(Deserialize)]
struct Author {
    display_name: Option<String>,
}

#[derive(Deserialize)]
struct Location {
    source: Option<LocationSource>,
}

#[derive(Deserialize)]
struct LocationSource {
    display_name: Option<String>,
}

/// OpenAlex stores abstracts as word -> positions; rebuild the text by
/// placing each word at its positions and reading back in order.
fn reconstruct_abstract(index: &BTreeMap<String, Vec<u32>>) -> String {
    let mut positions: BTreeMap<u32, &str> = BTreeMap::new();
    for (word, posns) in index {
        for &p in posns {
            positions.insert(p, word);
        }
    }
    positions.values().copied().collect::<Vec<_>>().join(" ")
}

fn to_paper(work: Work, source: &str) -> Paper {
    let abstract_text = work
        .abstract_inverted_index
        .as_ref()
        .map(reconstruct_abstract)
        .unwrap_or_default();
    Paper {
        id: work.id.clone(),
        title: work.title.unwrap_or_default(),
        authors: work
            .authorships
            .into_iter()
            .filter_map(|a| a.author.and_then(|a| a.display_name))
            .collect(),
        abstract_text,
        year: work
            .publication_year
            .map(|y| y.to_string())
            .unwrap_or_default(),
        journal: work
            .primary_location
            .and_then(|l| l.source)
            .and_then(|s| s.display_name)
            .unwrap_or_else(|| "Unknown".to_string()),
        url: work.doi.clone().unwrap_or(work.id),
        citations: work.cited_by_count,
        source: source.to_string(),
        doi: work.doi,
    }
}

async fn fetch_works(
    http: &reqwest::Client,
    url: &str,
) -> Result<Vec<Work>, SearchError> {
    let response = http.get(url).send().await?;
    if !response.status().is_success() {
        return Err(SearchError::Api {
            name: "openalex",
            status: response.status().as_u16(),
        });
    }
    let parsed: WorksResponse = response.json().await?;
    Ok(parsed.results)
}

pub async fn search(
    http: &reqwest::Client,
    query: &str,
    limit: usize,
    mailto: Option<&str>,
) -> Result<Vec<Paper>, SearchError> {
    // Strip characters the search endpoint rejects with 400s
    let clean = QUERY_JUNK.replace_all(query.trim(), " ");
    let clean = clean.split_whitespace().collect::<Vec<_>>().join(" ");
    if clean.is_empty() {
        return Ok(Vec::new());
    }

    let url = format!(
        "{}?search={}&per-page={}&mailto={}",
        BASE_URL,
        urlencoding::encode(&clean),
        limit.clamp(1, 50),
        mailto.unwrap_or(DEFAULT_MAILTO),
    );
    let works = fetch_works(http, &url).await?;
    Ok(works.into_iter().map(|w| to_paper(w, "openalex")).collect())
}

/// Resolve an OpenAlex ID, DOI, or free-text title to a work ID like W2741809807.
async fn resolve_work_id(
    http: &reqwest::Client,
    seed: &str,
    mailto: &str,
) -> Result<Option<String>, SearchError> {
    let seed = seed.trim();
    if let Some(caps) = WORK_ID.captures(seed) {
        return Ok(Some(caps[1].to_uppercase()));
    }

    let doi = DOI_URL
        .captures(seed)
        .map(|c| c[1].to_string())
        .or_else(|| seed.starts_with("10.").then(|| seed.to_string()));
    if let Some(doi) = doi {
        let url = format!(
            "{}?filter=doi:{}&per-page=1&mailto={}",
            BASE_URL,
            urlencoding::encode(&doi),
            mailto,
        );
        let works = fetch_works(http, &url).await?;
        if let Some(id) = works.first().and_then(|w| extract_work_id(&w.id)) {
            return Ok(Some(id));
        }
    }

    // Last resort: treat the seed as a title and take the best match
    let url = format!(
        "{}?search={}&per-page=1&mailto={}",
        BASE_URL,
        urlencoding::encode(seed),
        mailto,
    );
    let works = fetch_works(http, &url).await?;
    Ok(works.first().and_then(|w| extract_work_id(&w.id)))
}

fn extract_work_id(url: &str) -> Option<String> {
    WORK_ID.captures(url).map(|c| c[1].to_uppercase())
}

pub async fn citations_forward(
    http: &reqwest::Client,
    seed: &str,
    limit: usize,
    mailto: Option<&str>,
) -> Result<Vec<Paper>, SearchError> {
    let mailto = mailto.unwrap_or(DEFAULT_MAILTO);
    let Some(work_id) = resolve_work_id(http, seed, mailto).await? else {
        return Ok(Vec::new());
    };
    let url = format!(
        "{}?filter=cites:{}&per-page={}&mailto={}",
        BASE_URL,
        work_id,
        limit.clamp(10, 50),
        mailto,
    );
    let works = fetch_works(http, &url).await?;
    Ok(works
        .into_iter()
        .map(|w| to_paper(w, "openalex-forward"))
        .collect())
}

pub async fn citations_backward(
    http: &reqwest::Client,
    seed: &str,
    limit: usize,
    mailto: Option<&str>,
) -> Result<Vec<Paper>, SearchError> {
    let mailto = mailto.unwrap_or(DEFAULT_MAILTO);
    let Some(work_id) = resolve_work_id(http, seed, mailto).await? else {
        return Ok(Vec::new());
    };

    // The seed work carries its reference list; fetch it, then batch-load the refs.
    let work_url = format!("{}/{}?mailto={}", BASE_URL, work_id, mailto);
    let response = http.get(&work_url).send().await?;
    if !response.status().is_success() {
        return Err(SearchError::Api {
            name: "openalex",
            status: response.status().as_u16(),
        });
    }
    let seed_work: Work = response.json().await?;
    let ids: Vec<String> = seed_work
        .referenced_works
        .iter()
        .take(limit.min(50))
        .filter_map(|u| extract_work_id(u))
        .collect();
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let url = format!(
        "{}?filter=ids:{}&per-page={}&mailto={}",
        BASE_URL,
        ids.join("|"),
        limit.clamp(10, 50),
        mailto,
    );
    let works = fetch_works(http, &url).await?;
    Ok(works
        .into_iter()
        .map(|w| to_paper(w, "openalex-backward"))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconstruct_abstract_orders_by_position() {
        let mut index = BTreeMap::new();
        index.insert("world".to_string(), vec![1]);
        index.insert("hello".to_string(), vec![0]);
        index.insert("again".to_string(), vec![2, 4]);
        index.insert("and".to_string(), vec![3]);
        assert_eq!(reconstruct_abstract(&index), "hello world again and again");
    }

    #[test]
    fn test_extract_work_id_variants() {
        assert_eq!(
            extract_work_id("https://openalex.org/W2741809807"),
            Some("W2741809807".to_string())
        );
        assert_eq!(extract_work_id("w123"), Some("W123".to_string()));
        assert_eq!(extract_work_id("10.1234/abcd"), None);
    }

    #[test]
    fn test_query_junk_stripped() {
        let clean = QUERY_JUNK.replace_all("graph (neural) networks!?", " ");
        let clean = clean.split_whitespace().collect::<Vec<_>>().join(" ");
        assert_eq!(clean, "graph neural networks");
    }
}
