use std::time::Duration;

use thiserror::Error;

use crate::collaborators::CollaboratorError;
use crate::db::models::ProposalStatus;
use crate::embedder::EmbedderError;

/// Errors surfaced by the retrieval pipeline and the self-correction loop.
///
/// Request-path variants (`Embedding`, `RetrievalUnavailable`, `Generation`,
/// `Timeout`) are rendered to the user as a technical-difficulty message.
/// They are never turned into a fabricated answer.
#[derive(Error, Debug)]
pub enum RagError {
    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbedderError),

    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    #[error("collection schema mismatch: index has {found}, requested {expected}")]
    SchemaMismatch { expected: String, found: String },

    #[error("answer generation failed: {0}")]
    Generation(String),

    #[error("invalid proposal transition for #{id}: {from} -> {to}")]
    InvalidTransition {
        id: i64,
        from: ProposalStatus,
        to: ProposalStatus,
    },

    #[error("an active proposal already exists for query: {0}")]
    DuplicateProposal(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("external collaborator failed: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl RagError {
    /// Whether the error belongs to the interactive request path.
    #[must_use]
    pub fn is_request_failure(&self) -> bool {
        matches!(
            self,
            RagError::Embedding(_)
                | RagError::RetrievalUnavailable(_)
                | RagError::Generation(_)
                | RagError::Timeout(_)
        )
    }
}
