use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const TAVILY_ENDPOINT: &str = "https://api.tavily.com/search";

/// One result returned by a web search backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SearchError {
    #[error("search provider rejected the API key: {0}")]
    Unauthorized(String),

    #[error("search provider rate limit hit: {0}")]
    RateLimited(String),

    #[error("search request failed: {0}")]
    Request(String),
}

/// Web search backend. An empty result list is a valid answer.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, SearchError>;
}

#[derive(Debug, Serialize)]
struct TavilyRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    max_results: usize,
    search_depth: &'a str,
    include_answer: bool,
    include_raw_content: bool,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    score: Option<f64>,
}

pub struct TavilyClient {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl TavilyClient {
    pub fn new(api_key: String) -> Self {
        Self::with_endpoint(api_key, TAVILY_ENDPOINT.to_string())
    }

    pub fn with_endpoint(api_key: String, endpoint: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            api_key,
            endpoint,
        }
    }
}

#[async_trait]
impl SearchProvider for TavilyClient {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, SearchError> {
        debug!(query, max_results, "tavily search");

        let request = TavilyRequest {
            api_key: &self.api_key,
            query,
            max_results,
            search_depth: "basic",
            include_answer: false,
            include_raw_content: false,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| SearchError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => SearchError::Unauthorized(format!("{status}: {body}")),
                429 => SearchError::RateLimited(format!("{status}: {body}")),
                _ => SearchError::Request(format!("{status}: {body}")),
            });
        }

        let body: TavilyResponse = response
            .json()
            .await
            .map_err(|e| SearchError::Request(format!("invalid response body: {e}")))?;

        Ok(body
            .results
            .into_iter()
            .map(|r| SearchHit {
                url: r.url,
                title: r.title,
                content: r.content,
                score: r.score,
            })
            .collect())
    }
}

/// Cut `text` to at most `max_chars` characters, never inside a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}
