//! Crossref works API client.

use serde::Deserialize;

use super::{Paper, SearchError};

const BASE_URL: &str = "https://api.crossref.org/works";

#[derive(Deserialize)]
struct CrossrefResponse {
    message: Option<Message>,
}

#[derive(Deserialize)]
struct Message {
    #[serde(default)]
    items: Vec<Item>,
}

#[derive(Deserialize)]
struct Item {
    #[serde(rename = "DOI")]
    doi: Option<String>,
    #[serde(default)]
    title: Vec<String>,
    #[serde(default)]
    author: Vec<ItemAuthor>,
    #[serde(rename = "abstract")]
    abstract_text: Option<String>,
    published: Option<Published>,
    #[serde(rename = "container-title", default)]
    container_title: Vec<String>,
    #[serde(rename = "is-referenced-by-count", default)]
    is_referenced_by_count: i64,
}

#[derive(Deserialize)]
struct ItemAuthor {
    given: Option<String>,
    family: Option<String>,
}

#[derive(Deserialize)]
struct Published {
    #[serde(rename = "date-parts", default)]
    date_parts: Vec<Vec<i32>>,
}

fn to_paper(item: Item) -> Paper {
    let year = item
        .published
        .as_ref()
        .and_then(|p| p.date_parts.first())
        .and_then(|parts| parts.first())
        .map(|y| y.to_string())
        .unwrap_or_default();
    let authors = item
        .author
        .iter()
        .map(|a| {
            format!(
                "{} {}",
                a.given.as_deref().unwrap_or(""),
                a.family.as_deref().unwrap_or("")
            )
            .trim()
            .to_string()
        })
        .filter(|name| !name.is_empty())
        .collect();
    let url = item
        .doi
        .as_deref()
        .map(|doi| format!("https://doi.org/{}", doi))
        .unwrap_or_default();
    Paper {
        id: item.doi.clone().unwrap_or_default(),
        title: item.title.into_iter().next().unwrap_or_default(),
        authors,
        abstract_text: item.abstract_text.unwrap_or_default(),
        year,
        journal: item
            .container_title
            .into_iter()
            .next()
            .unwrap_or_else(|| "Unknown".to_string()),
        url,
        citations: item.is_referenced_by_count,
        source: "crossref".to_string(),
        doi: item.doi,
    }
}

pub async fn search(
    http: &reqwest::Client,
    query: &str,
    limit: usize,
    mailto: Option<&str>,
) -> Result<Vec<Paper>, SearchError> {
    let mut url = format!(
        "{}?query={}&rows={}",
        BASE_URL,
        urlencoding::encode(query),
        limit,
    );
    if let Some(mailto) = mailto {
        url.push_str("&mailto=");
        url.push_str(mailto);
    }
    let response = http.get(&url).send().await?;
    if !response.status().is_success() {
        return Err(SearchError::Api {
            name: "crossref",
            status: response.status().as_u16(),
        });
    }
    let parsed: CrossrefResponse = response.json().await?;
    Ok(parsed
        .message
        .map(|m| m.items.into_iter().map(to_paper).collect())
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_mapping() {
        let json = r#"{
            "message": {
                "items": [{
                    "DOI": "10.1000/xyz",
                    "title": ["A Study"],
                    "author": [{"given": "Ada", "family": "Lovelace"}, {"family": "Turing"}],
                    "published": {"date-parts": [[1950, 10]]},
                    "container-title": ["Mind"],
                    "is-referenced-by-count": 42
                }]
            }
        }"#;
        let parsed: CrossrefResponse = serde_json::from_str(json).unwrap();
        let papers: Vec<Paper> = parsed.message.unwrap().items.into_iter().map(to_paper).collect();
        assert_eq!(papers.len(), 1);
        let p = &papers[0];
        assert_eq!(p.title, "A Study");
        assert_eq!(p.authors, vec!["Ada Lovelace", "Turing"]);
        assert_eq!(p.year, "1950");
        assert_eq!(p.journal, "Mind");
        assert_eq!(p.citations, 42);
        assert_eq!(p.url, "https://doi.org/10.1000/xyz");
    }

    #[test]
    fn test_missing_message_yields_empty() {
        let parsed: CrossrefResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.message.is_none());
    }
}
