use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as TokioMutex;
use tracing::debug;

use crate::db::Db;
use crate::db::models::{UnansweredEntry, UnansweredStatus};
use crate::error::RagError;

/// Durable record of deferred queries, keyed by normalized query text.
#[derive(Clone)]
pub struct UnansweredLog {
    db: Arc<TokioMutex<Db>>,
}

impl UnansweredLog {
    #[must_use]
    pub fn new(db: Arc<TokioMutex<Db>>) -> Self {
        Self { db }
    }

    /// Create the entry or increment it, keeping the highest score seen.
    ///
    /// A non-finite `score` (nothing was retrieved) is recorded as no score.
    pub async fn record(&self, query_text: &str, score: f32) -> Result<UnansweredEntry, RagError> {
        let entry = self
            .db
            .lock()
            .await
            .record_unanswered(query_text, score.is_finite().then_some(score))?;
        debug!(
            query = %entry.query_text,
            occurrences = entry.occurrence_count,
            "Recorded unanswered query"
        );
        Ok(entry)
    }

    pub async fn list_open(&self) -> Result<Vec<UnansweredEntry>, RagError> {
        self.list(Some(UnansweredStatus::Open)).await
    }

    pub async fn list(&self, status: Option<UnansweredStatus>) -> Result<Vec<UnansweredEntry>, RagError> {
        Ok(self.db.lock().await.list_unanswered(status)?)
    }

    pub async fn get(&self, query_text: &str) -> Result<Option<UnansweredEntry>, RagError> {
        Ok(self.db.lock().await.get_unanswered(query_text)?)
    }

    /// OPEN → RESEARCHING; false if the entry was not OPEN.
    pub async fn mark_researching(&self, query_text: &str) -> Result<bool, RagError> {
        Ok(self.db.lock().await.mark_researching(query_text)?)
    }

    /// RESEARCHING → OPEN after a failed attempt.
    pub async fn mark_open(&self, query_text: &str) -> Result<bool, RagError> {
        Ok(self.db.lock().await.mark_open(query_text)?)
    }

    pub async fn mark_resolved(&self, query_text: &str) -> Result<bool, RagError> {
        Ok(self.db.lock().await.mark_resolved(query_text)?)
    }

    /// Reopen RESEARCHING entries stuck since before `cutoff` without a proposal.
    pub async fn revert_stale(&self, cutoff: DateTime<Utc>) -> Result<usize, RagError> {
        Ok(self.db.lock().await.revert_stale_researching(cutoff)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> UnansweredLog {
        UnansweredLog::new(Arc::new(TokioMutex::new(Db::open_in_memory().unwrap())))
    }

    #[tokio::test]
    async fn test_concurrent_records_collapse_into_one_entry() {
        let log = log();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                log.record("What time does X open?", 0.3).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let all = log.list(None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].occurrence_count, 10);
        assert!((all[0].max_observed_score.unwrap() - 0.3).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_record_without_results() {
        let log = log();
        let e = log.record("ไม่มีข้อมูล", f32::NEG_INFINITY).await.unwrap();
        assert_eq!(e.max_observed_score, None);
        assert_eq!(log.list_open().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let log = log();
        log.record("q", 0.2).await.unwrap();
        assert!(log.mark_researching("q").await.unwrap());
        assert!(log.list_open().await.unwrap().is_empty());
        assert!(log.mark_resolved("q").await.unwrap());
        let e = log.get("q").await.unwrap().unwrap();
        assert_eq!(e.status, UnansweredStatus::Resolved);
    }
}
