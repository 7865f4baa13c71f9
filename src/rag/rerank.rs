/// Second-stage scoring between retrieval and the confidence gate.
///
/// Candidates from the vector search are rescored by a cross-encoder over
/// (query, passage) pairs, lifted to configured floors for flagged payloads
/// (direct matches, trending places) and re-sorted. The gate then reads the
/// reranked scores.
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::models::QueryResult;
use crate::embedder::EmbedderError;
use crate::error::RagError;

/// Relevance model scoring a query against candidate passages.
///
/// Scores are in 0..=1, higher is more relevant; one score per passage in
/// input order.
pub trait Reranker: Send + Sync {
    fn score_pairs(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>, EmbedderError>;

    fn model_id(&self) -> &str;
}

/// Minimum score for results whose payload carries a truthy `flag`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreFloor {
    pub flag: String,
    pub floor: f32,
}

impl ScoreFloor {
    #[must_use]
    pub fn new(flag: impl Into<String>, floor: f32) -> Self {
        Self {
            flag: flag.into(),
            floor,
        }
    }
}

/// Floors used when none are configured: direct matches, then trending.
#[must_use]
pub fn default_floors() -> Vec<ScoreFloor> {
    vec![
        ScoreFloor::new("is_direct_match", 0.99),
        ScoreFloor::new("is_trending", 0.85),
    ]
}

#[derive(Clone, Default)]
pub struct RerankStage {
    reranker: Option<Arc<dyn Reranker>>,
    floors: Vec<ScoreFloor>,
}

impl RerankStage {
    #[must_use]
    pub fn new(reranker: Option<Arc<dyn Reranker>>, floors: Vec<ScoreFloor>) -> Self {
        Self { reranker, floors }
    }

    /// Rescore, apply floors and sort by descending score.
    ///
    /// Without a reranker and without floors the input is returned as is.
    /// Equal scores keep their retrieval order.
    pub async fn apply(&self, query: &str, mut results: Vec<QueryResult>) -> Result<Vec<QueryResult>, RagError> {
        if results.is_empty() || (self.reranker.is_none() && self.floors.is_empty()) {
            return Ok(results);
        }

        if let Some(reranker) = &self.reranker {
            let reranker = reranker.clone();
            let query = query.to_string();
            let passages: Vec<String> = results.iter().map(|r| r.document.text.clone()).collect();
            let scores = tokio::task::spawn_blocking(move || {
                let refs: Vec<&str> = passages.iter().map(String::as_str).collect();
                reranker.score_pairs(&query, &refs)
            })
            .await
            .map_err(|e| EmbedderError::InferenceFailed(format!("rerank task aborted: {e}")))??;

            if scores.len() != results.len() {
                return Err(EmbedderError::InferenceFailed(format!(
                    "reranker returned {} scores for {} passages",
                    scores.len(),
                    results.len()
                ))
                .into());
            }
            for (result, score) in results.iter_mut().zip(scores) {
                result.rerank_score = Some(score);
            }
        }

        for result in &mut results {
            if let Some(floor) = self.floor_for(result) {
                result.rerank_score = Some(result.score().max(floor));
            }
        }

        results.sort_by(|a, b| b.score().total_cmp(&a.score()));
        for (rank, result) in results.iter_mut().enumerate() {
            result.rank = rank;
            debug!(
                rank,
                doc = %result.document.id,
                similarity = result.similarity_score,
                score = result.score(),
                "Reranked"
            );
        }
        Ok(results)
    }

    /// The first matching floor wins, so order floors from strongest.
    fn floor_for(&self, result: &QueryResult) -> Option<f32> {
        self.floors
            .iter()
            .find(|f| {
                result
                    .document
                    .payload
                    .get(&f.flag)
                    .is_some_and(super::gate::is_truthy)
            })
            .map(|f| f.floor)
    }
}
