use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex as TokioMutex;
use tracing::{info, warn};

use super::approvals::ApprovalStore;
use super::log::UnansweredLog;
use crate::db::models::{Payload, Proposal, ProposalStatus};
use crate::embedder::{EmbedMode, Embedder, embed_off_thread};
use crate::error::RagError;
use crate::rag::index::VectorIndex;

/// Payload `source` of documents created from approved proposals.
pub const SELF_CORRECTION_SOURCE: &str = "self-correction";

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub processed: usize,
    pub ingested: usize,
    pub failed: usize,
}

/// Document key for a proposal's answer. Stable, so a retried ingestion
/// replaces its own earlier upsert.
#[must_use]
pub fn document_key(proposal_id: i64) -> String {
    format!("{SELF_CORRECTION_SOURCE}:{proposal_id}")
}

/// Turns APPROVED proposals into index documents.
pub struct IngestionService {
    approvals: ApprovalStore,
    log: UnansweredLog,
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    running: TokioMutex<()>,
}

impl IngestionService {
    pub fn new(
        approvals: ApprovalStore,
        log: UnansweredLog,
        index: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            approvals,
            log,
            index,
            embedder,
            running: TokioMutex::new(()),
        }
    }

    /// Ingest every APPROVED proposal once.
    ///
    /// A proposal only becomes INGESTED after its document is stored; on any
    /// failure it stays APPROVED for the next run. Returns `None` if another
    /// run is in progress.
    pub async fn run_once(&self) -> Result<Option<IngestReport>, RagError> {
        let Ok(_guard) = self.running.try_lock() else {
            info!("Ingestion run already in progress, skipping");
            return Ok(None);
        };

        let mut report = IngestReport::default();
        for proposal in self.approvals.list(Some(ProposalStatus::Approved)).await? {
            report.processed += 1;
            match self.ingest(&proposal).await {
                Ok(key) => {
                    report.ingested += 1;
                    info!(id = proposal.id, doc = %key, "Ingested proposal");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(id = proposal.id, error = %e, "Ingestion failed, will retry");
                }
            }
        }

        if report.processed > 0 {
            info!(
                processed = report.processed,
                ingested = report.ingested,
                failed = report.failed,
                "Ingestion run finished"
            );
        }
        Ok(Some(report))
    }

    async fn ingest(&self, proposal: &Proposal) -> Result<String, RagError> {
        let text = proposal.proposed_answer.trim().to_string();
        let key = document_key(proposal.id);

        let vector = embed_off_thread(self.embedder.clone(), text.clone(), EmbedMode::Passage).await?;
        self.index.upsert(&key, &text, &vector, proposal_payload(proposal, &key)).await?;

        if !self.log.mark_resolved(&proposal.query_text).await? {
            warn!(query = %proposal.query_text, "No open unanswered entry to resolve");
        }
        self.approvals.mark_ingested(proposal.id, &key).await?;
        Ok(key)
    }
}

fn proposal_payload(proposal: &Proposal, key: &str) -> Payload {
    let value = json!({
        "source": SELF_CORRECTION_SOURCE,
        "source_id": key,
        "title": proposal.query_text,
        "query_text": proposal.query_text,
        "source_refs": proposal.source_refs,
        "proposal_id": proposal.id,
        "confidence": proposal.confidence,
    });
    match value {
        serde_json::Value::Object(map) => map,
        _ => Payload::new(),
    }
}
