/// ONNX cross-encoder reranker (bge-reranker family).
///
/// Each (query, passage) pair is encoded jointly and the single relevance
/// logit is squashed with a sigmoid into 0..=1.
use std::path::Path;
use std::sync::Mutex;

use ort::session::Session;
use ort::value::Tensor;
use tracing::info;

use super::EmbedderError;
use super::tokenizer::BertTokenizer;
use crate::rag::rerank::Reranker;

pub struct OnnxCrossEncoder {
    session: Mutex<Session>,
    tokenizer: BertTokenizer,
    model_id: String,
}

impl OnnxCrossEncoder {
    /// Load `model.onnx` and `tokenizer.json` from `model_dir`.
    pub fn new(model_dir: &Path, model_name: &str) -> Result<Self, EmbedderError> {
        let model_path = model_dir.join("model.onnx");
        if !model_path.exists() {
            return Err(EmbedderError::ModelLoadFailed(format!(
                "model.onnx not found in {}",
                model_dir.display()
            )));
        }

        let session = Session::builder()
            .map_err(|e| EmbedderError::ModelLoadFailed(format!("session builder error: {e}")))?
            .with_intra_threads(4)
            .map_err(|e| EmbedderError::ModelLoadFailed(format!("thread config error: {e}")))?
            .commit_from_file(&model_path)
            .map_err(|e| EmbedderError::ModelLoadFailed(format!("model load error: {e}")))?;

        let tokenizer = BertTokenizer::from_model_dir(model_dir)
            .map_err(|e| EmbedderError::ModelLoadFailed(format!("tokenizer error: {e}")))?;

        info!(model = model_name, "ONNX reranker ready");
        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            model_id: format!("onnx-rerank:{model_name}"),
        })
    }

    fn score_pair(&self, session: &mut Session, query: &str, passage: &str) -> Result<f32, EmbedderError> {
        let tokens = self
            .tokenizer
            .tokenize_pair(query, passage)
            .map_err(|e| EmbedderError::TokenizerError(e.to_string()))?;
        let seq_len = tokens.input_ids.len();

        let input_ids = Tensor::from_array(([1usize, seq_len], tokens.input_ids))
            .map_err(|e| EmbedderError::InferenceFailed(format!("input_ids error: {e}")))?;
        let attention_mask = Tensor::from_array(([1usize, seq_len], tokens.attention_mask))
            .map_err(|e| EmbedderError::InferenceFailed(format!("attention_mask error: {e}")))?;

        let outputs = session
            .run(ort::inputs![
                "input_ids" => input_ids,
                "attention_mask" => attention_mask,
            ])
            .map_err(|e| EmbedderError::InferenceFailed(format!("inference failed: {e}")))?;

        // Output shape: [1, 1]
        let (_shape, logits) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("output extraction: {e}")))?;
        let logit = logits
            .first()
            .copied()
            .ok_or_else(|| EmbedderError::InferenceFailed("empty reranker output".to_string()))?;
        Ok(sigmoid(logit))
    }
}

impl Reranker for OnnxCrossEncoder {
    fn score_pairs(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>, EmbedderError> {
        let mut session = self
            .session
            .lock()
            .map_err(|e| EmbedderError::InferenceFailed(format!("lock poisoned: {e}")))?;
        passages
            .iter()
            .map(|p| self.score_pair(&mut session, query, p))
            .collect()
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
