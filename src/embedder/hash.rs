/// Deterministic feature-hashing embedder.
///
/// Produces vectors from character trigrams without any model files, so it
/// serves both as the test embedder and as an offline fallback backend.
/// Texts sharing most of their trigrams land close together, which keeps
/// passage/query round trips meaningful in tests.
use super::{EmbedMode, Embedder, EmbedderError, l2_normalize_in_place};

/// Bumped whenever the feature layout changes, since persisted vectors
/// would no longer be comparable.
const MODEL_ID: &str = "hash-trigram-v1";

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// A hashing embedder that maps character trigrams to signed buckets.
pub struct HashEmbedder {
    pub dimensions: usize,
}

impl HashEmbedder {
    /// Create a new `HashEmbedder` with the given dimensionality.
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn add_feature(&self, embedding: &mut [f32], feature: &str, weight: f32) {
        let h = fnv1a(feature.as_bytes());
        let idx = (h % self.dimensions as u64) as usize;
        let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
        embedding[idx] += sign * weight;
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self { dimensions: 384 }
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str, mode: EmbedMode) -> Result<Vec<f32>, EmbedderError> {
        if self.dimensions == 0 {
            return Err(EmbedderError::ModelLoadFailed(
                "hash embedder configured with zero dimensions".to_string(),
            ));
        }

        let mut embedding = vec![0.0f32; self.dimensions];

        // The framing prefix is one feature; the body trigrams carry the meaning.
        self.add_feature(&mut embedding, mode.prefix(), 1.0);

        let normalized = normalize_text(text);
        let chars: Vec<char> = format!(" {normalized} ").chars().collect();
        let mut gram = String::with_capacity(12);
        for window in chars.windows(3) {
            gram.clear();
            gram.extend(window);
            self.add_feature(&mut embedding, &gram, 1.0);
        }

        l2_normalize_in_place(&mut embedding);
        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> &str {
        MODEL_ID
    }
}

/// Lowercase and collapse whitespace runs.
fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
