use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use super::ingestion::IngestionService;
use super::researcher::ResearcherAgent;
use crate::error::RagError;

/// Periodic driver for the research and ingestion jobs.
pub struct Scheduler;

impl Scheduler {
    /// Run both jobs on independent timers until `shutdown` is cancelled.
    ///
    /// The first tick fires immediately. Await `wait()` on the returned
    /// tracker after cancelling to let an in-flight run finish.
    pub fn spawn(
        researcher: Arc<ResearcherAgent>,
        ingestion: Arc<IngestionService>,
        research_every: Duration,
        ingest_every: Duration,
        shutdown: CancellationToken,
    ) -> TaskTracker {
        let tracker = TaskTracker::new();
        info!(
            "Starting scheduler (research every {}s, ingestion every {}s)",
            research_every.as_secs(),
            ingest_every.as_secs()
        );

        tracker.spawn(run_periodically("research", research_every, shutdown.clone(), move || {
            let researcher = researcher.clone();
            async move { researcher.run_once().await.map(|r| r.is_some()) }
        }));
        tracker.spawn(run_periodically("ingestion", ingest_every, shutdown, move || {
            let ingestion = ingestion.clone();
            async move { ingestion.run_once().await.map(|r| r.is_some()) }
        }));

        tracker.close();
        tracker
    }
}

async fn run_periodically<F, Fut>(name: &'static str, every: Duration, shutdown: CancellationToken, job: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<bool, RagError>> + Send,
{
    let mut timer = interval(every);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(job = name, "Scheduler stopping");
                break;
            }
            _ = timer.tick() => {
                match job().await {
                    Ok(true) => debug!(job = name, "Scheduled run completed"),
                    Ok(false) => debug!(job = name, "Scheduled run skipped, previous still running"),
                    Err(e) => error!(job = name, error = %e, "Scheduled run failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{CollaboratorError, Draft, Summarizer, WebHit, WebSearch};
    use crate::correction::approvals::ApprovalStore;
    use crate::correction::log::UnansweredLog;
    use crate::db::Db;
    use crate::db::models::{CollectionSpec, DistanceMetric, ProposalStatus};
    use crate::embedder::Embedder;
    use crate::embedder::hash::HashEmbedder;
    use crate::rag::index::VectorIndex;
    use async_trait::async_trait;
    use tokio::sync::Mutex as TokioMutex;

    struct OneHit;

    #[async_trait]
    impl WebSearch for OneHit {
        async fn search_web(&self, _query: &str) -> Result<Vec<WebHit>, CollaboratorError> {
            Ok(vec![WebHit {
                url: "https://example.org".into(),
                title: "t".into(),
                snippet: "s".into(),
            }])
        }
    }

    struct Echo;

    #[async_trait]
    impl Summarizer for Echo {
        async fn draft(&self, query: &str, _hits: &[WebHit]) -> Result<Draft, CollaboratorError> {
            Ok(Draft {
                answer: format!("about {query}"),
                source_refs: vec!["https://example.org".into()],
                confidence: 0.5,
            })
        }
    }

    #[tokio::test]
    async fn test_scheduler_runs_jobs_and_stops() {
        let db = Arc::new(TokioMutex::new(Db::open_in_memory().unwrap()));
        let embedder = Arc::new(HashEmbedder::new(32));
        let spec = CollectionSpec {
            dimension: 32,
            metric: DistanceMetric::Cosine,
            model_id: embedder.model_id().into(),
        };
        let index = Arc::new(VectorIndex::ensure_collection(db.clone(), spec).await.unwrap());
        let log = UnansweredLog::new(db.clone());
        let approvals = ApprovalStore::new(db.clone());
        let researcher = Arc::new(ResearcherAgent::new(
            log.clone(),
            approvals.clone(),
            Arc::new(OneHit),
            Arc::new(Echo),
            chrono::Duration::hours(24),
        ));
        let ingestion = Arc::new(IngestionService::new(approvals.clone(), log.clone(), index, embedder));

        log.record("น่านมีอะไรเที่ยว", 0.1).await.unwrap();

        let shutdown = CancellationToken::new();
        let tracker = Scheduler::spawn(
            researcher,
            ingestion,
            Duration::from_millis(10),
            Duration::from_millis(10),
            shutdown.clone(),
        );

        // Wait for the immediate first research tick to produce a proposal
        let mut proposal = None;
        for _ in 0..100 {
            if let Some(p) = approvals.list(Some(ProposalStatus::Pending)).await.unwrap().pop() {
                proposal = Some(p);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let proposal = proposal.expect("research tick should create a proposal");
        approvals.approve(proposal.id).await.unwrap();

        let mut ingested = false;
        for _ in 0..100 {
            if approvals.get(proposal.id).await.unwrap().status == ProposalStatus::Ingested {
                ingested = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ingested, "ingestion tick should pick up the approval");

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), tracker.wait())
            .await
            .expect("scheduler should stop after cancellation");
    }
}
