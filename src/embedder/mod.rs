/// Embedder trait and shared types for text embedding.
///
/// Every embedding is produced in one of two framings: `passage: ` for text
/// that goes into the index and `query: ` for text that searches it. The
/// E5 model family was trained with these prefixes, so both sides of a
/// comparison must use the matching one.
pub mod cross_encoder;
pub mod download;
pub mod hash;
pub mod onnx;
pub mod tokenizer;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during embedding operations.
#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("inference failed: {0}")]
    InferenceFailed(String),

    #[error("model load failed: {0}")]
    ModelLoadFailed(String),

    #[error("tokenizer error: {0}")]
    TokenizerError(String),
}

/// Input framing for an embedding call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedMode {
    /// Knowledge text stored in the index.
    Passage,
    /// User text used to search the index.
    Query,
}

impl EmbedMode {
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            EmbedMode::Passage => "passage: ",
            EmbedMode::Query => "query: ",
        }
    }

    /// Prepend the mode prefix to `text`.
    #[must_use]
    pub fn frame(self, text: &str) -> String {
        format!("{}{}", self.prefix(), text.trim())
    }
}

/// Trait for text embedding implementations.
///
/// All implementations must be `Send + Sync` to allow concurrent use
/// behind `Arc`. `embed` must be deterministic for a given
/// (text, mode, model) triple.
pub trait Embedder: Send + Sync {
    /// Embed a single text string into a vector.
    fn embed(&self, text: &str, mode: EmbedMode) -> Result<Vec<f32>, EmbedderError>;

    /// Embed multiple text strings into vectors.
    fn embed_batch(&self, texts: &[&str], mode: EmbedMode) -> Result<Vec<Vec<f32>>, EmbedderError> {
        texts.iter().map(|t| self.embed(t, mode)).collect()
    }

    /// Return the dimensionality of the embedding vectors.
    fn dimensions(&self) -> usize;

    /// Stable identifier of the model that produced the vectors.
    ///
    /// Stored in the collection fingerprint; vectors from two different
    /// identifiers must never share an index.
    fn model_id(&self) -> &str;
}

/// Run `embed` on the blocking pool.
pub async fn embed_off_thread(
    embedder: Arc<dyn Embedder>,
    text: String,
    mode: EmbedMode,
) -> Result<Vec<f32>, EmbedderError> {
    tokio::task::spawn_blocking(move || embedder.embed(&text, mode))
        .await
        .map_err(|e| EmbedderError::InferenceFailed(format!("embedding task aborted: {e}")))?
}

/// Run `embed_batch` on the blocking pool.
pub async fn embed_batch_off_thread(
    embedder: Arc<dyn Embedder>,
    texts: Vec<String>,
    mode: EmbedMode,
) -> Result<Vec<Vec<f32>>, EmbedderError> {
    tokio::task::spawn_blocking(move || {
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        embedder.embed_batch(&refs, mode)
    })
    .await
    .map_err(|e| EmbedderError::InferenceFailed(format!("embedding task aborted: {e}")))?
}

/// L2-normalize a vector in place. Zero vectors are left untouched.
pub(crate) fn l2_normalize_in_place(vec: &mut [f32]) {
    let norm_sq: f32 = vec.iter().map(|v| v * v).sum();
    if norm_sq > 0.0 {
        let inv = 1.0 / norm_sq.sqrt();
        for v in vec.iter_mut() {
            *v *= inv;
        }
    }
}
