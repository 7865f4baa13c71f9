use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use super::gate::{ConfidenceGate, Decision};
use super::index::VectorIndex;
use super::rerank::RerankStage;
use crate::collaborators::Generator;
use crate::correction::log::UnansweredLog;
use crate::db::models::{Document, QueryResult};
use crate::db::search::SearchFilter;
use crate::embedder::{EmbedMode, Embedder, embed_off_thread};
use crate::error::RagError;

/// Where an answer's evidence came from.
#[derive(Debug, Clone, Serialize)]
pub struct Citation {
    pub source_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnswerResult {
    pub text: String,
    pub citations: Vec<Citation>,
    /// Top effective score (reranked when a reranker runs), 0 when nothing was retrieved.
    pub confidence: f32,
    pub deferred: bool,
}

pub struct OrchestratorSettings {
    pub gate: ConfidenceGate,
    pub top_k: usize,
    pub rerank: RerankStage,
    /// Reply used when the gate defers.
    pub dont_know: String,
}

/// The request path: embed, retrieve, rerank, gate, then generate or defer.
pub struct RagOrchestrator {
    embedder: Arc<dyn Embedder>,
    index: Arc<VectorIndex>,
    generator: Arc<dyn Generator>,
    log: UnansweredLog,
    settings: OrchestratorSettings,
    background: TaskTracker,
}

impl RagOrchestrator {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<VectorIndex>,
        generator: Arc<dyn Generator>,
        log: UnansweredLog,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            embedder,
            index,
            generator,
            log,
            settings,
            background: TaskTracker::new(),
        }
    }

    pub async fn answer(&self, query_text: &str) -> Result<AnswerResult, RagError> {
        self.answer_filtered(query_text, None).await
    }

    /// Like [`answer`](Self::answer), but fails with [`RagError::Timeout`]
    /// instead of waiting past `timeout`. In-flight work is dropped.
    pub async fn answer_within(&self, query_text: &str, timeout: Duration) -> Result<AnswerResult, RagError> {
        match tokio::time::timeout(timeout, self.answer(query_text)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(query = query_text, ?timeout, "Answer timed out");
                Err(RagError::Timeout(timeout))
            }
        }
    }

    pub async fn answer_filtered(
        &self,
        query_text: &str,
        filter: Option<&SearchFilter>,
    ) -> Result<AnswerResult, RagError> {
        let query = query_text.trim();
        if query.is_empty() {
            return Ok(self.dont_know(Vec::new(), 0.0));
        }

        let vector = embed_off_thread(self.embedder.clone(), query.to_string(), EmbedMode::Query).await?;
        let candidates = self.index.search(&vector, self.settings.top_k, filter).await?;
        let results = self.settings.rerank.apply(query, candidates).await?;
        let max_score = ConfidenceGate::max_score(&results);
        let confidence = if max_score.is_finite() { max_score.max(0.0) } else { 0.0 };

        match self.settings.gate.evaluate(&results) {
            Decision::Answer => {
                info!(query, max_score, hits = results.len(), "Answering from knowledge base");
                let documents: Vec<Document> = results.iter().map(|r| r.document.clone()).collect();
                let text = self.generate_with_fallback(query, &documents).await?;
                Ok(AnswerResult {
                    text,
                    citations: citations(&results),
                    confidence,
                    deferred: false,
                })
            }
            Decision::Defer => {
                info!(query, max_score, threshold = self.settings.gate.threshold(), "Deferring query");
                self.record_in_background(query.to_string(), max_score);
                Ok(self.dont_know(citations(&results), confidence))
            }
        }
    }

    /// One retry with only the top document before giving up.
    async fn generate_with_fallback(&self, query: &str, documents: &[Document]) -> Result<String, RagError> {
        match self.generator.generate(query, documents).await {
            Ok(text) => Ok(text),
            Err(first) => {
                warn!(error = %first, "Generation failed, retrying with top document only");
                self.generator
                    .generate(query, &documents[..documents.len().min(1)])
                    .await
                    .map_err(|e| RagError::Generation(e.to_string()))
            }
        }
    }

    fn record_in_background(&self, query: String, score: f32) {
        let log = self.log.clone();
        self.background.spawn(async move {
            if let Err(e) = log.record(&query, score).await {
                warn!(query = %query, error = %e, "Failed to record unanswered query");
            }
        });
    }

    /// Wait for pending unanswered-log writes to finish.
    pub async fn wait_for_background(&self) {
        self.background.close();
        self.background.wait().await;
        self.background.reopen();
    }

    fn dont_know(&self, citations: Vec<Citation>, confidence: f32) -> AnswerResult {
        AnswerResult {
            text: self.settings.dont_know.clone(),
            citations,
            confidence,
            deferred: true,
        }
    }
}

fn citations(results: &[QueryResult]) -> Vec<Citation> {
    results
        .iter()
        .map(|r| Citation {
            source_id: r
                .document
                .payload_str("source_id")
                .unwrap_or(&r.document.id)
                .to_string(),
            title: r.document.payload_str("title").map(str::to_string),
            score: r.score(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::CollaboratorError;
    use crate::db::Db;
    use crate::db::models::{CollectionSpec, DistanceMetric, Payload, UnansweredStatus};
    use crate::embedder::EmbedderError;
    use crate::embedder::hash::HashEmbedder;
    use crate::rag::rerank::{Reranker, default_floors};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as TokioMutex;

    /// Returns one fixed vector for every input.
    struct FixedEmbedder(Vec<f32>);

    impl Embedder for FixedEmbedder {
        fn embed(&self, _text: &str, _mode: EmbedMode) -> Result<Vec<f32>, EmbedderError> {
            Ok(self.0.clone())
        }
        fn dimensions(&self) -> usize {
            self.0.len()
        }
        fn model_id(&self) -> &str {
            "fixed"
        }
    }

    /// Fails the first `failures` calls, then echoes the document count.
    #[derive(Default)]
    struct ScriptedGenerator {
        failures: usize,
        calls: AtomicUsize,
        seen: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(&self, _query: &str, documents: &[Document]) -> Result<String, CollaboratorError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(documents.len());
            if n < self.failures {
                return Err(CollaboratorError::Decode("boom".into()));
            }
            Ok(format!("answer from {} documents", documents.len()))
        }
    }

    struct Harness {
        db: Arc<TokioMutex<Db>>,
        index: Arc<VectorIndex>,
        log: UnansweredLog,
    }

    async fn harness(dimension: usize, model_id: &str) -> Harness {
        let db = Arc::new(TokioMutex::new(Db::open_in_memory().unwrap()));
        let spec = CollectionSpec {
            dimension,
            metric: DistanceMetric::Cosine,
            model_id: model_id.into(),
        };
        let index = Arc::new(VectorIndex::ensure_collection(db.clone(), spec).await.unwrap());
        Harness {
            log: UnansweredLog::new(db.clone()),
            db,
            index,
        }
    }

    fn orchestrator(h: &Harness, embedder: Arc<dyn Embedder>, generator: Arc<dyn Generator>) -> RagOrchestrator {
        RagOrchestrator::new(
            embedder,
            h.index.clone(),
            generator,
            h.log.clone(),
            OrchestratorSettings {
                gate: ConfidenceGate::new(0.45),
                top_k: 5,
                rerank: RerankStage::default(),
                dont_know: "ขออภัยค่ะ ไม่พบข้อมูลที่เกี่ยวข้องในระบบ".into(),
            },
        )
    }

    /// Scores passages that contain the query verbatim as highly relevant.
    struct ContainsReranker;

    impl Reranker for ContainsReranker {
        fn score_pairs(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>, EmbedderError> {
            Ok(passages
                .iter()
                .map(|p| if p.contains(query) { 0.93 } else { 0.02 })
                .collect())
        }
        fn model_id(&self) -> &str {
            "contains"
        }
    }

    fn titled(title: &str) -> Payload {
        json!({ "title": title, "source": "knowledge-base" }).as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn test_low_score_defers_and_records() {
        let h = harness(2, "fixed").await;
        // cos(query, doc) = 0.30
        let doc = [0.30_f32, 0.91_f32.sqrt()];
        h.index.upsert("wat-phumin", "วัดภูมินทร์ จิตรกรรมฝาผนัง", &doc, titled("วัดภูมินทร์")).await.unwrap();

        let generator = Arc::new(ScriptedGenerator::default());
        let rag = orchestrator(&h, Arc::new(FixedEmbedder(vec![1.0, 0.0])), generator.clone());

        let query = "ค่าเข้าวัดภูมินทร์เท่าไหร่";
        let result = rag.answer(query).await.unwrap();
        assert!(result.deferred);
        assert_eq!(result.text, "ขออภัยค่ะ ไม่พบข้อมูลที่เกี่ยวข้องในระบบ");
        assert!((result.confidence - 0.30).abs() < 1e-4);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0, "no generation on DEFER");

        rag.wait_for_background().await;
        let entries = h.log.list(None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].query_text, query);
        assert_eq!(entries[0].occurrence_count, 1);
        assert_eq!(entries[0].status, UnansweredStatus::Open);
        assert!((entries[0].max_observed_score.unwrap() - 0.30).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_reranker_promotes_lower_similarity_document() {
        let h = harness(2, "fixed").await;
        // cos 0.30 and 0.20: both below the threshold on similarity alone
        h.index.upsert("doi-phukha", "ดอยภูคา ชมต้นชมพูภูคา", &[0.30, 0.91_f32.sqrt()], titled("ดอยภูคา")).await.unwrap();
        h.index.upsert("wat-phumin", "วัดภูมินทร์ เปิดทุกวัน 06:00-18:00", &[0.20, 0.96_f32.sqrt()], titled("วัดภูมินทร์")).await.unwrap();

        let plain = orchestrator(
            &h,
            Arc::new(FixedEmbedder(vec![1.0, 0.0])),
            Arc::new(ScriptedGenerator::default()),
        );
        assert!(plain.answer("วัดภูมินทร์").await.unwrap().deferred);
        plain.wait_for_background().await;

        let reranked = RagOrchestrator::new(
            Arc::new(FixedEmbedder(vec![1.0, 0.0])),
            h.index.clone(),
            Arc::new(ScriptedGenerator::default()),
            h.log.clone(),
            OrchestratorSettings {
                gate: ConfidenceGate::new(0.45),
                top_k: 5,
                rerank: RerankStage::new(Some(Arc::new(ContainsReranker)), Vec::new()),
                dont_know: "ขออภัยค่ะ".into(),
            },
        );
        let result = reranked.answer("วัดภูมินทร์").await.unwrap();
        assert!(!result.deferred);
        assert_eq!(result.citations[0].source_id, "wat-phumin");
        assert!((result.citations[0].score - 0.93).abs() < 1e-6);
        assert!((result.confidence - 0.93).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_trending_floor_answers_low_similarity() {
        let h = harness(2, "fixed").await;
        let mut payload = titled("ถนนคนเดินน่าน");
        payload.insert("is_trending".into(), json!(true));
        h.index.upsert("walking-street", "ถนนคนเดิน", &[0.10, 0.99_f32.sqrt()], payload).await.unwrap();

        let rag = RagOrchestrator::new(
            Arc::new(FixedEmbedder(vec![1.0, 0.0])),
            h.index.clone(),
            Arc::new(ScriptedGenerator::default()),
            h.log.clone(),
            OrchestratorSettings {
                gate: ConfidenceGate::new(0.45),
                top_k: 5,
                rerank: RerankStage::new(None, default_floors()),
                dont_know: "ขออภัยค่ะ".into(),
            },
        );
        let result = rag.answer("ช่วงนี้มีอะไรน่าเที่ยว").await.unwrap();
        assert!(!result.deferred);
        assert!((result.confidence - 0.85).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_confident_match_answers() {
        let h = harness(2, "fixed").await;
        h.index.upsert("a", "text a", &[1.0, 0.0], titled("A")).await.unwrap();
        h.index.upsert("b", "text b", &[0.6, 0.8], titled("B")).await.unwrap();

        let rag = orchestrator(
            &h,
            Arc::new(FixedEmbedder(vec![1.0, 0.0])),
            Arc::new(ScriptedGenerator::default()),
        );
        let result = rag.answer("anything").await.unwrap();
        assert!(!result.deferred);
        assert_eq!(result.text, "answer from 2 documents");
        assert!((result.confidence - 1.0).abs() < 1e-4);
        assert_eq!(result.citations[0].source_id, "a");
        assert_eq!(result.citations[0].title.as_deref(), Some("A"));

        rag.wait_for_background().await;
        assert!(h.log.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_generation_retries_with_top_document() {
        let h = harness(2, "fixed").await;
        h.index.upsert("a", "a", &[1.0, 0.0], Payload::new()).await.unwrap();
        h.index.upsert("b", "b", &[0.8, 0.6], Payload::new()).await.unwrap();

        let generator = Arc::new(ScriptedGenerator { failures: 1, ..Default::default() });
        let rag = orchestrator(&h, Arc::new(FixedEmbedder(vec![1.0, 0.0])), generator.clone());

        let result = rag.answer("q").await.unwrap();
        assert_eq!(result.text, "answer from 1 documents");
        assert_eq!(*generator.seen.lock().unwrap(), vec![2, 1]);
    }

    #[tokio::test]
    async fn test_generation_error_after_retry() {
        let h = harness(2, "fixed").await;
        h.index.upsert("a", "a", &[1.0, 0.0], Payload::new()).await.unwrap();

        let generator = Arc::new(ScriptedGenerator { failures: 2, ..Default::default() });
        let rag = orchestrator(&h, Arc::new(FixedEmbedder(vec![1.0, 0.0])), generator.clone());

        let err = rag.answer("q").await.unwrap_err();
        assert!(matches!(err, RagError::Generation(_)));
        assert!(err.is_request_failure());
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_index_failure_surfaces_retrieval_unavailable() {
        let h = harness(2, "fixed").await;
        h.db.lock().await.conn.execute_batch("DROP TABLE vec_documents;").unwrap();

        let rag = orchestrator(
            &h,
            Arc::new(FixedEmbedder(vec![1.0, 0.0])),
            Arc::new(ScriptedGenerator::default()),
        );
        let err = rag.answer("q").await.unwrap_err();
        assert!(matches!(err, RagError::RetrievalUnavailable(_)));

        rag.wait_for_background().await;
        assert!(h.log.list(None).await.unwrap().is_empty(), "failures are not deferrals");
    }

    #[tokio::test]
    async fn test_empty_index_defers_without_score() {
        let h = harness(2, "fixed").await;
        let rag = orchestrator(
            &h,
            Arc::new(FixedEmbedder(vec![1.0, 0.0])),
            Arc::new(ScriptedGenerator::default()),
        );
        let result = rag.answer("ดอยเสมอดาวไปยังไง").await.unwrap();
        assert!(result.deferred);
        assert_eq!(result.confidence, 0.0);

        rag.wait_for_background().await;
        let e = h.log.get("ดอยเสมอดาวไปยังไง").await.unwrap().unwrap();
        assert_eq!(e.max_observed_score, None);
    }

    #[tokio::test]
    async fn test_blank_query_is_not_recorded() {
        let h = harness(2, "fixed").await;
        let rag = orchestrator(
            &h,
            Arc::new(FixedEmbedder(vec![1.0, 0.0])),
            Arc::new(ScriptedGenerator::default()),
        );
        assert!(rag.answer("   ").await.unwrap().deferred);
        rag.wait_for_background().await;
        assert!(h.log.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_passage_query_round_trip() {
        let embedder = Arc::new(HashEmbedder::new(256));
        let h = harness(256, embedder.model_id()).await;
        let text = "วัดภูมินทร์ เป็นวัดเก่าแก่ในจังหวัดน่าน มีจิตรกรรมฝาผนังปู่ม่านย่าม่าน";
        let v = embedder.embed(text, EmbedMode::Passage).unwrap();
        h.index.upsert("wat-phumin", text, &v, Payload::new()).await.unwrap();
        let other = "ดอยเสมอดาว อุทยานแห่งชาติศรีน่าน ชมทะเลหมอก";
        let v = embedder.embed(other, EmbedMode::Passage).unwrap();
        h.index.upsert("doi", other, &v, Payload::new()).await.unwrap();

        let rag = orchestrator(&h, embedder, Arc::new(ScriptedGenerator::default()));
        let result = rag.answer(text).await.unwrap();
        assert!(!result.deferred);
        assert_eq!(result.citations[0].source_id, "wat-phumin");
        assert!(result.confidence >= 0.45);
    }

    /// Sleeps before embedding so the deadline expires first.
    struct SlowEmbedder;

    impl Embedder for SlowEmbedder {
        fn embed(&self, _text: &str, _mode: EmbedMode) -> Result<Vec<f32>, EmbedderError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(vec![1.0, 0.0])
        }
        fn dimensions(&self) -> usize {
            2
        }
        fn model_id(&self) -> &str {
            "slow"
        }
    }

    #[tokio::test]
    async fn test_answer_within_times_out() {
        let h = harness(2, "fixed").await;
        let rag = orchestrator(&h, Arc::new(SlowEmbedder), Arc::new(ScriptedGenerator::default()));
        let err = rag.answer_within("q", Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, RagError::Timeout(_)));
        assert!(err.is_request_failure());
    }
}
