//! Google Custom Search JSON API client, restricted to Thai results.
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{CollaboratorError, WebHit, WebSearch};
use crate::config::WebSearchConfig;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    link: String,
}

pub struct GoogleSearch {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    cse_id: Option<String>,
    config: WebSearchConfig,
}

impl GoogleSearch {
    pub fn new(config: &WebSearchConfig) -> Result<Self, CollaboratorError> {
        let env = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            api_key: env(&config.api_key_env),
            cse_id: env(&config.cse_id_env),
            config: config.clone(),
        })
    }
}

#[async_trait]
impl WebSearch for GoogleSearch {
    async fn search_web(&self, query: &str) -> Result<Vec<WebHit>, CollaboratorError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| CollaboratorError::MissingCredential(self.config.api_key_env.clone()))?;
        let cx = self
            .cse_id
            .as_deref()
            .ok_or_else(|| CollaboratorError::MissingCredential(self.config.cse_id_env.clone()))?;
        let num = self.config.num_results.clamp(1, 10).to_string();

        let response = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("key", key),
                ("cx", cx),
                ("q", query),
                ("num", num.as_str()),
                ("lr", "lang_th"),
                ("gl", "th"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Web search failed");
            return Err(CollaboratorError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| CollaboratorError::Decode(e.to_string()))?;
        let hits = into_hits(parsed);
        debug!(query, hits = hits.len(), "Web search completed");
        Ok(hits)
    }
}

fn into_hits(response: SearchResponse) -> Vec<WebHit> {
    response
        .items
        .into_iter()
        .filter(|item| !item.link.is_empty() || !item.snippet.is_empty())
        .map(|item| WebHit {
            url: item.link,
            title: item.title,
            snippet: item.snippet,
        })
        .collect()
}
