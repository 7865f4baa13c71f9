//! Slow, fallible services the core calls through narrow async traits:
//! answer generation, web search and draft summarization.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::models::Document;

pub mod llm;
pub mod web_search;

#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode response: {0}")]
    Decode(String),

    #[error("missing credential: environment variable {0} is not set")]
    MissingCredential(String),

    #[error("nothing usable returned for: {0}")]
    Empty(String),
}

/// One web search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebHit {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

/// A drafted answer for an unanswered query.
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub answer: String,
    /// Ordered citations, best source first.
    pub source_refs: Vec<String>,
    /// Self-reported confidence in 0..=1.
    pub confidence: f32,
}

/// Writes the final answer from retrieved documents.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, query: &str, documents: &[Document]) -> Result<String, CollaboratorError>;
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search_web(&self, query: &str) -> Result<Vec<WebHit>, CollaboratorError>;
}

/// Turns raw search hits into a reviewable draft.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn draft(&self, query: &str, hits: &[WebHit]) -> Result<Draft, CollaboratorError>;
}
