//! arXiv Atom feed client. The feed is small and regular enough that a few
//! regexes beat pulling in a full XML parser.

use lazy_static::lazy_static;
use regex::Regex;

use super::{Paper, SearchError};

const BASE_URL: &str = "http://export.arxiv.org/api/query";

lazy_static! {
    static ref ENTRY: Regex = Regex::new(r"(?s)<entry>(.*?)</entry>").unwrap();
    static ref TITLE: Regex = Regex::new(r"(?s)<title>(.*?)</title>").unwrap();
    static ref SUMMARY: Regex = Regex::new(r"(?s)<summary>(.*?)</summary>").unwrap();
    static ref PUBLISHED: Regex = Regex::new(r"<published>(.*?)</published>").unwrap();
    static ref ID: Regex = Regex::new(r"<id>(.*?)</id>").unwrap();
    static ref AUTHOR_NAME: Regex =
        Regex::new(r"(?s)<author>.*?<name>(.*?)</name>.*?</author>").unwrap();
}

fn capture<'a>(re: &Regex, text: &'a str) -> Option<&'a str> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
}

/// Collapse the whitespace arXiv wraps long titles and abstracts with.
fn squash(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn parse_feed(xml: &str) -> Vec<Paper> {
    let mut papers = Vec::new();
    for entry in ENTRY.captures_iter(xml) {
        let body = &entry[1];
        let Some(title) = capture(&TITLE, body).filter(|t| !t.is_empty()) else {
            continue;
        };
        let id = capture(&ID, body).unwrap_or_default().to_string();
        let published = capture(&PUBLISHED, body).unwrap_or_default();
        let authors = AUTHOR_NAME
            .captures_iter(body)
            .map(|c| c[1].trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();
        papers.push(Paper {
            id: id.clone(),
            title: squash(title),
            authors,
            abstract_text: squash(capture(&SUMMARY, body).unwrap_or_default()),
            year: published.chars().take(4).collect(),
            journal: "arXiv".to_string(),
            url: id,
            citations: 0,
            source: "arxiv".to_string(),
            doi: None,
        });
    }
    papers
}

pub async fn search(
    http: &reqwest::Client,
    query: &str,
    limit: usize,
) -> Result<Vec<Paper>, SearchError> {
    let url = format!(
        "{}?search_query=all:{}&start=0&max_results={}",
        BASE_URL,
        urlencoding::encode(query),
        limit,
    );
    let response = http.get(&url).send().await?;
    if !response.status().is_success() {
        return Err(SearchError::Api {
            name: "arxiv",
            status: response.status().as_u16(),
        });
    }
    let xml = response.text().await?;
    Ok(parse_feed(&xml))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>ArXiv Query Results</title>
  <entry>
    <id>http://arxiv.org/abs/1706.03762v7</id>
    <published>2017-06-12T17:57:34Z</published>
    <title>Attention Is All
      You Need</title>
    <summary>The dominant sequence transduction models are based on complex
      recurrent networks.</summary>
    <author><name>Ashish Vaswani</name></author>
    <author><name>Noam Shazeer</name></author>
  </entry>
  <entry>
    <id>http://arxiv.org/abs/2000.00001v1</id>
    <published>2020-01-01T00:00:00Z</published>
    <title>Second Paper</title>
    <summary>Another abstract.</summary>
    <author><name>Solo Author</name></author>
  </entry>
</feed>"#;

    #[test]
    fn test_parse_feed_entries() {
        let papers = parse_feed(SAMPLE);
        assert_eq!(papers.len(), 2);
        assert_eq!(papers[0].title, "Attention Is All You Need");
        assert_eq!(papers[0].year, "2017");
        assert_eq!(papers[0].authors, vec!["Ashish Vaswani", "Noam Shazeer"]);
        assert_eq!(papers[0].url, "http://arxiv.org/abs/1706.03762v7");
        assert_eq!(papers[1].authors, vec!["Solo Author"]);
    }

    #[test]
    fn test_parse_feed_collapses_whitespace() {
        let papers = parse_feed(SAMPLE);
        assert!(papers[0]
            .abstract_text
            .contains("based on complex recurrent networks"));
    }

    #[test]
    fn test_parse_feed_empty_input() {
        assert!(parse_feed("<feed></feed>").is_empty());
    }
}
