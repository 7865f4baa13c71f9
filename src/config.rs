/// Configuration module for NanGuide.
///
/// Handles loading, validating, and providing default configuration values.
/// Secrets are never stored here; the config names the environment variables
/// that hold them.
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db::models::DistanceMetric;
use crate::rag::rerank::{ScoreFloor, default_floors};

// ── Default value functions ──────────────────────────────────────────

fn default_db_path() -> String {
    "./nanguide.db".to_string()
}

fn default_search_top_k() -> usize {
    5
}

fn default_confidence_threshold() -> f32 {
    0.45
}

fn default_answer_timeout_ms() -> u64 {
    30_000
}

fn default_distance() -> DistanceMetric {
    DistanceMetric::Cosine
}

fn default_model_name() -> String {
    "multilingual-e5-small".to_string()
}

fn default_dimensions() -> usize {
    384
}

fn default_dont_know() -> String {
    "ขออภัยค่ะ ไม่พบข้อมูลที่เกี่ยวข้องในระบบ ทีมงานจะรวบรวมข้อมูลเพิ่มเติมให้นะคะ".to_string()
}

fn default_technical_difficulty() -> String {
    "ขออภัยค่ะ ระบบขัดข้องชั่วคราว กรุณาลองใหม่อีกครั้งในภายหลังนะคะ".to_string()
}

fn default_llm_base_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}

fn default_llm_model() -> String {
    "llama-3.3-70b-versatile".to_string()
}

fn default_llm_key_env() -> String {
    "GROQ_API_KEY".to_string()
}

fn default_temperature() -> f32 {
    0.3
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_search_endpoint() -> String {
    "https://www.googleapis.com/customsearch/v1".to_string()
}

fn default_search_key_env() -> String {
    "GOOGLE_API_KEY".to_string()
}

fn default_cse_id_env() -> String {
    "GOOGLE_CSE_ID".to_string()
}

fn default_num_results() -> usize {
    5
}

fn default_research_interval() -> u64 {
    3600
}

fn default_stale_after_hours() -> u64 {
    24
}

fn default_ingestion_interval() -> u64 {
    300
}

fn default_entry_timeout() -> u64 {
    120
}

fn default_llm_timeout() -> u64 {
    60
}

fn default_search_timeout() -> u64 {
    15
}

fn default_reranker_name() -> String {
    "bge-reranker-base".to_string()
}

// ── Config structs ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_search_top_k")]
    pub search_top_k: usize,

    /// Minimum top score required to answer instead of deferring. Compared
    /// against reranker scores when a reranker is enabled, otherwise against
    /// vector similarity.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    /// Payload flags that let a result bypass the threshold (empty = off).
    #[serde(default)]
    pub trusted_flags: Vec<String>,

    #[serde(default = "default_answer_timeout_ms")]
    pub answer_timeout_ms: u64,

    #[serde(default = "default_distance")]
    pub distance: DistanceMetric,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub rerank: RerankConfig,

    #[serde(default)]
    pub messages: MessagesConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub web_search: WebSearchConfig,

    #[serde(default)]
    pub researcher: ResearcherConfig,

    #[serde(default)]
    pub ingestion: IngestionConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderBackend {
    #[default]
    Onnx,
    /// Deterministic, model-free embeddings for offline use and tests.
    Hash,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_model_name")]
    pub name: String,

    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Override for the model directory (defaults to `models/<name>`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,

    #[serde(default)]
    pub backend: EmbedderBackend,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RerankBackend {
    #[default]
    Onnx,
    /// Gate directly on vector similarity.
    None,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RerankConfig {
    #[serde(default)]
    pub backend: RerankBackend,

    #[serde(default = "default_reranker_name")]
    pub name: String,

    /// Override for the model directory (defaults to `models/<name>`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,

    /// Score floors for flagged payloads, strongest first.
    #[serde(default = "default_floors")]
    pub floors: Vec<ScoreFloor>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MessagesConfig {
    #[serde(default = "default_dont_know")]
    pub dont_know: String,

    #[serde(default = "default_technical_difficulty")]
    pub technical_difficulty: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GenerationConfig {
    /// OpenAI-compatible API root (`/chat/completions` is appended).
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default = "default_llm_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WebSearchConfig {
    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_search_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_cse_id_env")]
    pub cse_id_env: String,

    #[serde(default = "default_num_results")]
    pub num_results: usize,

    #[serde(default = "default_search_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ResearcherConfig {
    #[serde(default = "default_research_interval")]
    pub interval_secs: u64,

    /// RESEARCHING entries older than this with no proposal go back to OPEN.
    #[serde(default = "default_stale_after_hours")]
    pub stale_after_hours: u64,

    /// Deadline for researching one entry (search plus draft).
    #[serde(default = "default_entry_timeout")]
    pub entry_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IngestionConfig {
    #[serde(default = "default_ingestion_interval")]
    pub interval_secs: u64,
}

// ── Default impls ────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            search_top_k: default_search_top_k(),
            confidence_threshold: default_confidence_threshold(),
            trusted_flags: Vec::new(),
            answer_timeout_ms: default_answer_timeout_ms(),
            distance: default_distance(),
            model: ModelConfig::default(),
            rerank: RerankConfig::default(),
            messages: MessagesConfig::default(),
            generation: GenerationConfig::default(),
            web_search: WebSearchConfig::default(),
            researcher: ResearcherConfig::default(),
            ingestion: IngestionConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model_name(),
            dimensions: default_dimensions(),
            dir: None,
            backend: EmbedderBackend::default(),
        }
    }
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            backend: RerankBackend::default(),
            name: default_reranker_name(),
            dir: None,
            floors: default_floors(),
        }
    }
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            dont_know: default_dont_know(),
            technical_difficulty: default_technical_difficulty(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key_env: default_llm_key_env(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            endpoint: default_search_endpoint(),
            api_key_env: default_search_key_env(),
            cse_id_env: default_cse_id_env(),
            num_results: default_num_results(),
            timeout_secs: default_search_timeout(),
        }
    }
}

impl Default for ResearcherConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_research_interval(),
            stale_after_hours: default_stale_after_hours(),
            entry_timeout_secs: default_entry_timeout(),
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_ingestion_interval(),
        }
    }
}

// ── Config implementation ────────────────────────────────────────────

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// If `config_path` is empty, defaults to `"config.json"`.
    /// If the file does not exist, returns a default config and generates a
    /// template for the default path. Malformed JSON is an error.
    pub fn load(config_path: &str) -> Result<Self> {
        let path = if config_path.is_empty() {
            "config.json"
        } else {
            config_path
        };

        if !Path::new(path).exists() {
            info!("{path} not found, using defaults");
            let cfg = Self::default();

            if path == "config.json" {
                match cfg.save(path) {
                    Ok(()) => info!("Generated config template: {path}"),
                    Err(e) => warn!("Failed to generate config template: {e}"),
                }
            }

            return Ok(cfg);
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        let cfg: Config =
            serde_json::from_str(&data).with_context(|| format!("invalid JSON in {path}"))?;

        info!("Loaded configuration from {path}");
        cfg.validate()?;
        Ok(cfg)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &str) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to marshal config")?;
        std::fs::write(path, data).with_context(|| format!("failed to write config: {path}"))?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.search_top_k > 0, "search_top_k must be positive");
        anyhow::ensure!(
            self.confidence_threshold.is_finite(),
            "confidence_threshold must be a finite number"
        );
        anyhow::ensure!(
            self.model.dimensions > 0,
            "model.dimensions must be positive"
        );
        anyhow::ensure!(self.answer_timeout_ms > 0, "answer_timeout_ms must be positive");
        anyhow::ensure!(
            self.researcher.interval_secs > 0 && self.ingestion.interval_secs > 0,
            "job intervals must be positive"
        );
        anyhow::ensure!(
            self.researcher.entry_timeout_secs > 0
                && self.generation.timeout_secs > 0
                && self.web_search.timeout_secs > 0,
            "timeouts must be positive"
        );
        anyhow::ensure!(
            self.rerank.floors.iter().all(|f| f.floor.is_finite()),
            "rerank.floors must be finite numbers"
        );
        anyhow::ensure!(
            (1..=10).contains(&self.web_search.num_results),
            "web_search.num_results must be between 1 and 10"
        );
        Ok(())
    }

    #[must_use]
    pub fn answer_timeout(&self) -> Duration {
        Duration::from_millis(self.answer_timeout_ms)
    }

    #[must_use]
    pub fn entry_timeout(&self) -> Duration {
        Duration::from_secs(self.researcher.entry_timeout_secs)
    }
}

// ── Tests ────────────────────────────────────────────────────────────
