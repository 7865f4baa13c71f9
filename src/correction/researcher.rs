use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};

use super::approvals::ApprovalStore;
use super::log::UnansweredLog;
use crate::collaborators::{CollaboratorError, Summarizer, WebSearch};
use crate::db::models::{NewProposal, UnansweredEntry};
use crate::error::RagError;

/// Counts from one research run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub processed: usize,
    pub proposed: usize,
    pub skipped: usize,
    pub failed: usize,
    /// RESEARCHING entries reopened by the staleness sweep.
    pub reverted: usize,
}

enum Outcome {
    Proposed,
    Skipped,
}

/// Drains OPEN unanswered queries into PENDING proposals.
///
/// Policy for entries that already have an active proposal: the entry is
/// moved to RESEARCHING (it is under review) and no proposal is created.
/// Failed entries go back to OPEN for the next run. RESEARCHING entries with
/// no active proposal that are older than `stale_after` reopen at the start
/// of each run, which also retries queries whose proposal was rejected.
/// Each entry gets `entry_timeout` for search and drafting together; an
/// entry that overruns counts as failed.
pub struct ResearcherAgent {
    log: UnansweredLog,
    approvals: ApprovalStore,
    search: Arc<dyn WebSearch>,
    summarizer: Arc<dyn Summarizer>,
    stale_after: chrono::Duration,
    entry_timeout: Duration,
    running: TokioMutex<()>,
}

const DEFAULT_ENTRY_TIMEOUT: Duration = Duration::from_secs(120);

impl ResearcherAgent {
    pub fn new(
        log: UnansweredLog,
        approvals: ApprovalStore,
        search: Arc<dyn WebSearch>,
        summarizer: Arc<dyn Summarizer>,
        stale_after: chrono::Duration,
    ) -> Self {
        Self {
            log,
            approvals,
            search,
            summarizer,
            stale_after,
            entry_timeout: DEFAULT_ENTRY_TIMEOUT,
            running: TokioMutex::new(()),
        }
    }

    #[must_use]
    pub fn with_entry_timeout(mut self, entry_timeout: Duration) -> Self {
        self.entry_timeout = entry_timeout;
        self
    }

    /// Process every OPEN entry once.
    ///
    /// Returns `None` without doing anything if another run is in progress.
    pub async fn run_once(&self) -> Result<Option<RunReport>, RagError> {
        let Ok(_guard) = self.running.try_lock() else {
            info!("Research run already in progress, skipping");
            return Ok(None);
        };

        let mut report = RunReport::default();
        if let Some(cutoff) = Utc::now().checked_sub_signed(self.stale_after) {
            report.reverted = self.log.revert_stale(cutoff).await?;
        }
        if report.reverted > 0 {
            info!(count = report.reverted, "Reopened stale researching entries");
        }

        let entries = self.log.list_open().await?;
        for entry in entries {
            report.processed += 1;
            let outcome = tokio::time::timeout(self.entry_timeout, self.research(&entry))
                .await
                .unwrap_or(Err(RagError::Timeout(self.entry_timeout)));
            match outcome {
                Ok(Outcome::Proposed) => report.proposed += 1,
                Ok(Outcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(query = %entry.query_text, error = %e, "Research failed");
                    if let Err(e) = self.log.mark_open(&entry.query_text).await {
                        warn!(query = %entry.query_text, error = %e, "Could not reopen entry");
                    }
                }
            }
        }

        info!(
            processed = report.processed,
            proposed = report.proposed,
            skipped = report.skipped,
            failed = report.failed,
            "Research run finished"
        );
        Ok(Some(report))
    }

    async fn research(&self, entry: &UnansweredEntry) -> Result<Outcome, RagError> {
        let query = entry.query_text.as_str();

        if let Some(existing) = self.approvals.active_for(query).await? {
            debug!(query, proposal = existing.id, "Active proposal exists, not researching");
            self.log.mark_researching(query).await?;
            return Ok(Outcome::Skipped);
        }

        if !self.log.mark_researching(query).await? {
            debug!(query, "Entry is no longer open");
            return Ok(Outcome::Skipped);
        }

        let hits = self.search.search_web(query).await?;
        if hits.is_empty() {
            return Err(CollaboratorError::Empty(format!("web search for {query}")).into());
        }

        let draft = self.summarizer.draft(query, &hits).await?;
        if draft.answer.trim().is_empty() {
            return Err(CollaboratorError::Empty(format!("draft for {query}")).into());
        }
        if !draft.confidence.is_finite() {
            return Err(CollaboratorError::Decode(format!("draft confidence {} for {query}", draft.confidence)).into());
        }

        let new = NewProposal {
            query_text: entry.query_text.clone(),
            proposed_answer: draft.answer,
            source_refs: draft.source_refs,
            confidence: draft.confidence,
        };
        match self.approvals.create(&new).await {
            Ok(_) => Ok(Outcome::Proposed),
            // Someone proposed in the meantime; the entry stays under review.
            Err(RagError::DuplicateProposal(_)) => Ok(Outcome::Skipped),
            Err(e) => Err(e),
        }
    }
}
