/// ONNX Runtime embedder using the `ort` crate.
///
/// Loads a multilingual E5 ONNX model, frames the input with the mode
/// prefix, runs inference, applies mean pooling with attention mask, and
/// L2-normalizes the result. Over-long input is cut by the tokenizer at its
/// configured maximum length, so long passages still get a vector.
use std::path::Path;
use std::sync::Mutex;

use ort::session::Session;
use ort::value::Tensor;
use tracing::{debug, info};

use super::tokenizer::BertTokenizer;
use super::{EmbedMode, Embedder, EmbedderError, l2_normalize_in_place};

/// ONNX-backed embedder implementing the `Embedder` trait.
pub struct OnnxEmbedder {
    session: Mutex<Session>,
    tokenizer: BertTokenizer,
    dimensions: usize,
    model_id: String,
}

impl OnnxEmbedder {
    /// Create a new `OnnxEmbedder` by loading a model from the given directory.
    ///
    /// Expects `model.onnx` and `tokenizer.json` in `model_dir`. `dimensions`
    /// must match the hidden size of the model (384 for e5-small, 1024 for
    /// e5-large).
    pub fn new(model_dir: &Path, model_name: &str, dimensions: usize) -> Result<Self, EmbedderError> {
        let model_path = model_dir.join("model.onnx");

        if !model_path.exists() {
            return Err(EmbedderError::ModelLoadFailed(format!(
                "model.onnx not found in {}",
                model_dir.display()
            )));
        }

        info!("Initializing ONNX Runtime...");

        let session = Session::builder()
            .map_err(|e| EmbedderError::ModelLoadFailed(format!("session builder error: {e}")))?
            .with_intra_threads(4)
            .map_err(|e| EmbedderError::ModelLoadFailed(format!("thread config error: {e}")))?
            .with_inter_threads(4)
            .map_err(|e| EmbedderError::ModelLoadFailed(format!("thread config error: {e}")))?
            .commit_from_file(&model_path)
            .map_err(|e| EmbedderError::ModelLoadFailed(format!("model load error: {e}")))?;

        let tokenizer = BertTokenizer::from_model_dir(model_dir)
            .map_err(|e| EmbedderError::ModelLoadFailed(format!("tokenizer error: {e}")))?;

        info!(
            model = model_name,
            dimensions,
            vocab_size = tokenizer.vocab_size(),
            "ONNX embedder ready"
        );

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            dimensions,
            model_id: format!("onnx:{model_name}"),
        })
    }
}

impl Embedder for OnnxEmbedder {
    fn embed(&self, text: &str, mode: EmbedMode) -> Result<Vec<f32>, EmbedderError> {
        let framed = mode.frame(text);
        let tokens = self
            .tokenizer
            .tokenize(&framed)
            .map_err(|e| EmbedderError::TokenizerError(e.to_string()))?;

        if tokens.truncated {
            debug!(
                max_tokens = self.tokenizer.max_length(),
                "input truncated before embedding"
            );
        }

        let seq_len = tokens.input_ids.len();

        // (shape, data) tuples avoid coupling to ort's ndarray version
        let input_ids_val = Tensor::from_array(([1usize, seq_len], tokens.input_ids))
            .map_err(|e| EmbedderError::InferenceFailed(format!("input_ids error: {e}")))?;
        let attention_mask_val =
            Tensor::from_array(([1usize, seq_len], tokens.attention_mask.clone())).map_err(
                |e| EmbedderError::InferenceFailed(format!("attention_mask error: {e}")),
            )?;
        let token_type_ids_val = Tensor::from_array(([1usize, seq_len], vec![0i64; seq_len]))
            .map_err(|e| EmbedderError::InferenceFailed(format!("token_type_ids error: {e}")))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| EmbedderError::InferenceFailed(format!("lock poisoned: {e}")))?;
        let outputs = session
            .run(ort::inputs![
                "input_ids" => input_ids_val,
                "attention_mask" => attention_mask_val,
                "token_type_ids" => token_type_ids_val,
            ])
            .map_err(|e| EmbedderError::InferenceFailed(format!("inference failed: {e}")))?;

        // Output shape: [1, seq_len, hidden_size]
        let (_shape, hidden_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("output extraction: {e}")))?;

        if hidden_data.len() != seq_len * self.dimensions {
            return Err(EmbedderError::InferenceFailed(format!(
                "unexpected output size {} for seq_len {seq_len} and {} dimensions",
                hidden_data.len(),
                self.dimensions
            )));
        }

        let mut embedding = mean_pooling(
            hidden_data,
            &tokens.attention_mask,
            seq_len,
            self.dimensions,
        );
        l2_normalize_in_place(&mut embedding);
        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// Mean pooling over hidden states weighted by attention mask.
///
/// `hidden_data` is a flat array with shape `[1, seq_len, hidden_size]`.
fn mean_pooling(
    hidden_data: &[f32],
    attention_mask: &[i64],
    seq_len: usize,
    hidden_size: usize,
) -> Vec<f32> {
    let mut result = vec![0.0f32; hidden_size];
    let mut mask_sum: f32 = 0.0;

    for t in 0..seq_len {
        let mask = attention_mask[t] as f32;
        mask_sum += mask;

        for h in 0..hidden_size {
            result[h] += hidden_data[t * hidden_size + h] * mask;
        }
    }

    if mask_sum > 0.0 {
        for v in &mut result {
            *v /= mask_sum;
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_pooling_simple() {
        let hidden = vec![1.0, 2.0, 3.0];
        let mask = vec![1i64];
        let result = mean_pooling(&hidden, &mask, 1, 3);
        assert_eq!(result, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_mean_pooling_with_padding() {
        // second token is padding
        let hidden = vec![1.0, 2.0, 10.0, 20.0];
        let mask = vec![1i64, 0i64];
        let result = mean_pooling(&hidden, &mask, 2, 2);
        assert_eq!(result, vec![1.0, 2.0]);
    }

    #[test]
    fn test_missing_model_is_load_error() {
        let err = OnnxEmbedder::new(Path::new("/nonexistent/model"), "multilingual-e5-small", 384)
            .err()
            .unwrap();
        assert!(matches!(err, EmbedderError::ModelLoadFailed(_)));
    }

    /// Requires downloaded model files.
    #[test]
    #[ignore]
    fn test_onnx_query_and_passage_framing() {
        let model_dir = Path::new("models/multilingual-e5-small");
        if !model_dir.join("model.onnx").exists() {
            eprintln!("Skipping: model files not downloaded");
            return;
        }

        let embedder = OnnxEmbedder::new(model_dir, "multilingual-e5-small", 384).unwrap();
        let passage = embedder
            .embed("วัดภูมินทร์เปิด 06:00-18:00", EmbedMode::Passage)
            .unwrap();
        let query = embedder
            .embed("วัดภูมินทร์เปิดกี่โมง", EmbedMode::Query)
            .unwrap();

        assert_eq!(passage.len(), 384);
        let sim: f32 = passage.iter().zip(&query).map(|(a, b)| a * b).sum();
        assert!(sim > 0.45, "expected related texts to clear the threshold, got {sim}");
    }

    #[test]
    #[ignore]
    fn test_onnx_long_input_is_truncated_not_rejected() {
        let model_dir = Path::new("models/multilingual-e5-small");
        if !model_dir.join("model.onnx").exists() {
            return;
        }

        let embedder = OnnxEmbedder::new(model_dir, "multilingual-e5-small", 384).unwrap();
        let long_text = "น่าน ".repeat(5000);
        let vec = embedder.embed(&long_text, EmbedMode::Passage).unwrap();
        assert_eq!(vec.len(), 384);
    }
}
