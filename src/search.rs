//! External context lookup
//!
//! Retrieves news and article citations relevant to a financial question
//! from a configurable search endpoint. The orchestrator treats failures
//! as an empty result set with an inline error marker; a lookup never
//! stalls a turn.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::time::Duration;

use crate::error::OrchestratorError;
use crate::models::Citation;
use crate::Result;

const MAX_RESULTS: usize = 5;

#[async_trait]
pub trait ContextSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<Citation>>;
}

/// HTTP-backed search against `SEARCH_API_BASE_URL`, expecting a JSON
/// array of `{title, url, snippet}` objects from `GET /search?q=...`.
pub struct HttpContextSearch {
    client: Client,
    base_url: String,
}

impl HttpContextSearch {
    pub fn from_env() -> Option<Self> {
        let base_url = env::var("SEARCH_API_BASE_URL").ok()?;

        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .timeout(Duration::from_secs(10))
            .build()
            .ok()?;

        Some(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    snippet: String,
}

#[async_trait]
impl ContextSearch for HttpContextSearch {
    async fn search(&self, query: &str) -> Result<Vec<Citation>> {
        let url = format!("{}/search", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("q", query), ("max_results", "8")])
            .send()
            .await
            .map_err(|e| OrchestratorError::SearchError(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OrchestratorError::SearchError(format!(
                "search endpoint returned {}",
                status
            )));
        }

        let raw: Vec<RawResult> = response
            .json()
            .await
            .map_err(|e| OrchestratorError::SearchError(format!("invalid payload: {}", e)))?;

        Ok(dedupe_citations(raw.into_iter().map(|r| Citation {
            title: r.title,
            url: r.url,
            snippet: r.snippet,
        })))
    }
}

/// Drop untitled results and duplicate URLs, keeping the first occurrence,
/// capped at MAX_RESULTS.
pub fn dedupe_citations(results: impl IntoIterator<Item = Citation>) -> Vec<Citation> {
    let mut seen_urls: HashSet<String> = HashSet::new();
    results
        .into_iter()
        .filter(|c| !c.title.is_empty() && !c.url.is_empty())
        .filter(|c| seen_urls.insert(c.url.clone()))
        .take(MAX_RESULTS)
        .collect()
}
