use std::sync::Arc;

use tokio::sync::Mutex as TokioMutex;
use tracing::{info, warn};

use crate::db::Db;
use crate::db::models::{NewProposal, Proposal, ProposalStatus};
use crate::db::proposals::is_unique_violation;
use crate::error::RagError;

/// Human-reviewed proposal records.
///
/// Status only moves forward: PENDING → APPROVED → INGESTED, or
/// PENDING → REJECTED. Every other request fails with
/// [`RagError::InvalidTransition`].
#[derive(Clone)]
pub struct ApprovalStore {
    db: Arc<TokioMutex<Db>>,
}

impl ApprovalStore {
    #[must_use]
    pub fn new(db: Arc<TokioMutex<Db>>) -> Self {
        Self { db }
    }

    /// Store a new PENDING proposal.
    pub async fn create(&self, new: &NewProposal) -> Result<Proposal, RagError> {
        let result = self.db.lock().await.insert_proposal(new);
        match result {
            Ok(p) => {
                info!(id = p.id, query = %p.query_text, "Created proposal");
                Ok(p)
            }
            Err(e) if is_unique_violation(&e) => Err(RagError::DuplicateProposal(new.query_text.clone())),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, id: i64) -> Result<Proposal, RagError> {
        self.db
            .lock()
            .await
            .get_proposal(id)?
            .ok_or_else(|| RagError::NotFound(format!("proposal #{id}")))
    }

    pub async fn list(&self, status: Option<ProposalStatus>) -> Result<Vec<Proposal>, RagError> {
        Ok(self.db.lock().await.list_proposals(status)?)
    }

    pub async fn active_for(&self, query_text: &str) -> Result<Option<Proposal>, RagError> {
        let found = self.db.lock().await.active_proposal_for(query_text)?;
        Ok(found.filter(|p| p.status.is_active()))
    }

    pub async fn approve(&self, id: i64) -> Result<Proposal, RagError> {
        self.transition(id, ProposalStatus::Approved).await
    }

    pub async fn reject(&self, id: i64) -> Result<Proposal, RagError> {
        self.transition(id, ProposalStatus::Rejected).await
    }

    /// APPROVED → INGESTED, remembering the document key the answer went into.
    pub async fn mark_ingested(&self, id: i64, doc_key: &str) -> Result<Proposal, RagError> {
        self.apply(id, ProposalStatus::Ingested, Some(doc_key)).await
    }

    /// Move proposal `id` to `to`, enforcing the state machine.
    pub async fn transition(&self, id: i64, to: ProposalStatus) -> Result<Proposal, RagError> {
        self.apply(id, to, None).await
    }

    /// Replace the answer text of a PENDING proposal before it is decided.
    pub async fn revise(&self, id: i64, answer: &str) -> Result<Proposal, RagError> {
        let db = self.db.lock().await;
        let current = db
            .get_proposal(id)?
            .ok_or_else(|| RagError::NotFound(format!("proposal #{id}")))?;
        if !db.revise_proposal_answer(id, answer.trim())? {
            warn!(id, status = %current.status, "Refused to revise a decided proposal");
            return Err(RagError::InvalidTransition {
                id,
                from: current.status,
                to: ProposalStatus::Pending,
            });
        }
        db.get_proposal(id)?
            .ok_or_else(|| RagError::NotFound(format!("proposal #{id}")))
    }

    async fn apply(&self, id: i64, to: ProposalStatus, doc_key: Option<&str>) -> Result<Proposal, RagError> {
        let db = self.db.lock().await;
        let current = db
            .get_proposal(id)?
            .ok_or_else(|| RagError::NotFound(format!("proposal #{id}")))?;
        let from = current.status;

        if !from.can_transition_to(to) {
            warn!(id, %from, %to, "Rejected invalid proposal transition");
            return Err(RagError::InvalidTransition { id, from, to });
        }

        let changed = if to == ProposalStatus::Ingested {
            db.mark_proposal_ingested(id, doc_key)?
        } else {
            db.decide_proposal(id, from, to)?
        };
        // Rows are only written under the lock, so a lost compare-and-set
        // means another connection to the same file got there first.
        if !changed {
            let now = db.get_proposal(id)?.map_or(from, |p| p.status);
            warn!(id, from = %now, %to, "Proposal changed concurrently");
            return Err(RagError::InvalidTransition { id, from: now, to });
        }

        info!(id, %from, %to, "Proposal transitioned");
        db.get_proposal(id)?
            .ok_or_else(|| RagError::NotFound(format!("proposal #{id}")))
    }
}
