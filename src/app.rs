/// Wiring of the request path and the self-correction services around one
/// shared database.
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex as TokioMutex;
use tracing::info;

use crate::collaborators::llm::ChatCompletionClient;
use crate::collaborators::web_search::GoogleSearch;
use crate::collaborators::{Generator, Summarizer, WebSearch};
use crate::config::{Config, EmbedderBackend, RerankBackend};
use crate::correction::approvals::ApprovalStore;
use crate::correction::ingestion::IngestionService;
use crate::correction::log::UnansweredLog;
use crate::correction::researcher::ResearcherAgent;
use crate::db::Db;
use crate::db::models::CollectionSpec;
use crate::embedder::cross_encoder::OnnxCrossEncoder;
use crate::embedder::download::{all_files_present, default_model_dir};
use crate::embedder::hash::HashEmbedder;
use crate::embedder::onnx::OnnxEmbedder;
use crate::embedder::Embedder;
use crate::error::RagError;
use crate::rag::gate::ConfidenceGate;
use crate::rag::index::VectorIndex;
use crate::rag::orchestrator::{AnswerResult, OrchestratorSettings, RagOrchestrator};
use crate::rag::rerank::{RerankStage, Reranker};

/// External services, replaceable in tests.
pub struct Collaborators {
    pub generator: Arc<dyn Generator>,
    pub search: Arc<dyn WebSearch>,
    pub summarizer: Arc<dyn Summarizer>,
}

impl Collaborators {
    /// HTTP-backed collaborators configured from `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let llm = Arc::new(ChatCompletionClient::new(&config.generation).context("Failed to build LLM client")?);
        let search = GoogleSearch::new(&config.web_search).context("Failed to build web search client")?;
        Ok(Self {
            generator: llm.clone(),
            search: Arc::new(search),
            summarizer: llm,
        })
    }
}

#[derive(Clone)]
pub struct App {
    pub config: Arc<Config>,
    pub db: Arc<TokioMutex<Db>>,
    pub embedder: Arc<dyn Embedder>,
    pub index: Arc<VectorIndex>,
    pub log: UnansweredLog,
    pub approvals: ApprovalStore,
    pub orchestrator: Arc<RagOrchestrator>,
    pub researcher: Arc<ResearcherAgent>,
    pub ingestion: Arc<IngestionService>,
}

impl App {
    /// Open the database and build every service from `config`.
    pub async fn open(config: Config) -> Result<Self> {
        let embedder = build_embedder(&config)?;
        let reranker = build_reranker(&config)?;
        let collaborators = Collaborators::from_config(&config)?;
        let db = Db::open(&config.db_path).context("Failed to open database")?;
        Self::assemble(config, db, embedder, reranker, collaborators).await
    }

    /// Build the services over an already opened database.
    ///
    /// Fails if the stored collection was built with another embedding
    /// configuration. Without a `reranker` the configured score floors still
    /// apply to retrieval similarity.
    pub async fn assemble(
        config: Config,
        db: Db,
        embedder: Arc<dyn Embedder>,
        reranker: Option<Arc<dyn Reranker>>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let db = Arc::new(TokioMutex::new(db));

        let spec = CollectionSpec {
            dimension: embedder.dimensions(),
            metric: config.distance,
            model_id: embedder.model_id().to_string(),
        };
        let index = Arc::new(
            VectorIndex::ensure_collection(db.clone(), spec)
                .await
                .context("Vector index initialization halted")?,
        );

        let log = UnansweredLog::new(db.clone());
        let approvals = ApprovalStore::new(db.clone());

        let gate = ConfidenceGate::new(config.confidence_threshold)
            .with_trusted_flags(config.trusted_flags.clone());
        let orchestrator = Arc::new(RagOrchestrator::new(
            embedder.clone(),
            index.clone(),
            collaborators.generator,
            log.clone(),
            OrchestratorSettings {
                gate,
                top_k: config.search_top_k,
                rerank: RerankStage::new(reranker, config.rerank.floors.clone()),
                dont_know: config.messages.dont_know.clone(),
            },
        ));

        let stale_after = i64::try_from(config.researcher.stale_after_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or(chrono::Duration::MAX);
        let researcher = Arc::new(
            ResearcherAgent::new(
                log.clone(),
                approvals.clone(),
                collaborators.search,
                collaborators.summarizer,
                stale_after,
            )
            .with_entry_timeout(config.entry_timeout()),
        );
        let ingestion = Arc::new(IngestionService::new(
            approvals.clone(),
            log.clone(),
            index.clone(),
            embedder.clone(),
        ));

        info!(
            db = %config.db_path,
            threshold = config.confidence_threshold,
            top_k = config.search_top_k,
            "Application ready"
        );

        Ok(Self {
            config,
            db,
            embedder,
            index,
            log,
            approvals,
            orchestrator,
            researcher,
            ingestion,
        })
    }

    /// Answer within the configured deadline.
    pub async fn ask(&self, query: &str) -> Result<AnswerResult, RagError> {
        self.orchestrator
            .answer_within(query, self.config.answer_timeout())
            .await
    }

    /// Message shown to users when a request fails.
    #[must_use]
    pub fn apology(&self) -> &str {
        &self.config.messages.technical_difficulty
    }
}

/// Resolve the model directory from config.
#[must_use]
pub fn model_dir(config: &Config) -> PathBuf {
    config
        .model
        .dir
        .as_ref()
        .map_or_else(|| default_model_dir(&config.model.name), PathBuf::from)
}

/// Resolve the reranker model directory from config.
#[must_use]
pub fn reranker_dir(config: &Config) -> PathBuf {
    config
        .rerank
        .dir
        .as_ref()
        .map_or_else(|| default_model_dir(&config.rerank.name), PathBuf::from)
}

/// Build the configured reranker, if any.
pub fn build_reranker(config: &Config) -> Result<Option<Arc<dyn Reranker>>> {
    match config.rerank.backend {
        RerankBackend::None => {
            info!("Reranking disabled, gating on retrieval similarity");
            Ok(None)
        }
        RerankBackend::Onnx => {
            let dir = reranker_dir(config);
            anyhow::ensure!(
                all_files_present(&dir),
                "reranker files missing in {}; run `nanguide download-model` first",
                dir.display()
            );
            let reranker = OnnxCrossEncoder::new(&dir, &config.rerank.name).context("Failed to load ONNX reranker")?;
            Ok(Some(Arc::new(reranker)))
        }
    }
}

/// Build the configured embedder backend.
pub fn build_embedder(config: &Config) -> Result<Arc<dyn Embedder>> {
    match config.model.backend {
        EmbedderBackend::Hash => {
            info!(dimensions = config.model.dimensions, "Using hashing embedder");
            Ok(Arc::new(HashEmbedder::new(config.model.dimensions)))
        }
        EmbedderBackend::Onnx => {
            let dir = model_dir(config);
            anyhow::ensure!(
                all_files_present(&dir),
                "model files missing in {}; run `nanguide download-model` first",
                dir.display()
            );
            let embedder = OnnxEmbedder::new(&dir, &config.model.name, config.model.dimensions)
                .context("Failed to load ONNX embedder")?;
            Ok(Arc::new(embedder))
        }
    }
}
