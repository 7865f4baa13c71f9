/// BERT-style tokenizer wrapper around HuggingFace `tokenizers` crate.
///
/// Truncation is configured at load time so inputs beyond the model limit
/// are cut deterministically by token count instead of failing inference.
use std::path::Path;

use anyhow::Result;
use tokenizers::Tokenizer;

/// XLM-RoBERTa / E5 position limit.
const MAX_TOKENS: usize = 512;

/// Wrapper around the HuggingFace tokenizer for BERT-style models.
pub struct BertTokenizer {
    inner: Tokenizer,
    max_length: usize,
}

/// Output of a tokenization operation.
#[derive(Debug, Clone)]
pub struct TokenizerOutput {
    /// Token IDs (input_ids for the model).
    pub input_ids: Vec<i64>,
    /// Attention mask (1 for real tokens, 0 for padding).
    pub attention_mask: Vec<i64>,
    /// Whether the text was cut at `max_length`.
    pub truncated: bool,
}

impl BertTokenizer {
    /// Load a tokenizer from a `tokenizer.json` file in the model directory.
    pub fn from_model_dir(model_dir: &Path) -> Result<Self> {
        let tokenizer_path = model_dir.join("tokenizer.json");

        anyhow::ensure!(
            tokenizer_path.exists(),
            "tokenizer.json not found in {}",
            model_dir.display()
        );

        let mut inner = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("failed to load tokenizer: {e}"))?;

        inner
            .with_truncation(Some(tokenizers::TruncationParams {
                max_length: MAX_TOKENS,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("failed to configure truncation: {e}"))?;

        inner.with_padding(Some(tokenizers::PaddingParams {
            ..Default::default()
        }));

        Ok(Self {
            inner,
            max_length: MAX_TOKENS,
        })
    }

    /// Tokenize a single text, returning input IDs and attention mask.
    pub fn tokenize(&self, text: &str) -> Result<TokenizerOutput> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("failed to encode text: {e}"))?;
        Ok(Self::output(&encoding))
    }

    /// Tokenize a (query, passage) pair for a cross-encoder. The longer
    /// side is cut first when the pair exceeds `max_length`.
    pub fn tokenize_pair(&self, first: &str, second: &str) -> Result<TokenizerOutput> {
        let encoding = self
            .inner
            .encode((first, second), true)
            .map_err(|e| anyhow::anyhow!("failed to encode pair: {e}"))?;
        Ok(Self::output(&encoding))
    }

    fn output(encoding: &tokenizers::Encoding) -> TokenizerOutput {
        TokenizerOutput {
            input_ids: encoding.get_ids().iter().map(|&id| i64::from(id)).collect(),
            attention_mask: encoding
                .get_attention_mask()
                .iter()
                .map(|&m| i64::from(m))
                .collect(),
            truncated: !encoding.get_overflowing().is_empty(),
        }
    }

    /// Get the vocabulary size.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(false)
    }

    /// Get the configured maximum sequence length.
    #[must_use]
    pub fn max_length(&self) -> usize {
        self.max_length
    }
}
