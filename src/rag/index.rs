use std::sync::Arc;

use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, error, info};

use crate::db::models::{CollectionSpec, Payload, PAYLOAD_SOURCE_ID, PAYLOAD_TEXT, QueryResult};
use crate::db::search::SearchFilter;
use crate::db::{CollectionCheck, Db};
use crate::error::RagError;

/// Similarity store over the shared database, pinned to one embedding space.
pub struct VectorIndex {
    db: Arc<TokioMutex<Db>>,
    spec: CollectionSpec,
}

impl VectorIndex {
    /// Create the collection or verify that the stored one matches `spec`.
    ///
    /// A stored collection with a different dimension, metric or model fails
    /// with [`RagError::SchemaMismatch`] and is left untouched.
    pub async fn ensure_collection(db: Arc<TokioMutex<Db>>, spec: CollectionSpec) -> Result<Self, RagError> {
        let check = db.lock().await.ensure_collection(&spec)?;
        match check {
            CollectionCheck::Created | CollectionCheck::Matched => {
                info!(collection = %spec, "Vector index ready");
                Ok(Self { db, spec })
            }
            CollectionCheck::Mismatch(found) => {
                error!(expected = %spec, found = %found, "Embedding configuration does not match the index");
                Err(RagError::SchemaMismatch {
                    expected: spec.to_string(),
                    found: found.to_string(),
                })
            }
        }
    }

    #[must_use]
    pub fn fingerprint(&self) -> &CollectionSpec {
        &self.spec
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), RagError> {
        if vector.len() == self.spec.dimension {
            Ok(())
        } else {
            Err(RagError::SchemaMismatch {
                expected: format!("{} dimensions", self.spec.dimension),
                found: format!("{} dimensions", vector.len()),
            })
        }
    }

    /// Insert or fully replace document `id`.
    ///
    /// `text` is stored as `text_content`; `source_id` defaults to `id`.
    pub async fn upsert(&self, id: &str, text: &str, vector: &[f32], mut payload: Payload) -> Result<(), RagError> {
        self.check_dimension(vector)?;
        payload.insert(PAYLOAD_TEXT.into(), text.into());
        payload
            .entry(PAYLOAD_SOURCE_ID)
            .or_insert_with(|| id.into());

        self.db.lock().await.upsert_document(id, vector, &payload)?;
        debug!(id, "Upserted document");
        Ok(())
    }

    /// Remove document `id`. Missing ids are not an error.
    pub async fn delete(&self, id: &str) -> Result<bool, RagError> {
        Ok(self.db.lock().await.delete_document(id)?)
    }

    /// Top-`k` documents by descending similarity.
    pub async fn search(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<QueryResult>, RagError> {
        self.check_dimension(vector)?;
        let db = self.db.clone().lock_owned().await;
        let vector = vector.to_vec();
        let filter = filter.cloned();
        let metric = self.spec.metric;

        // The scan is synchronous SQLite work
        tokio::task::spawn_blocking(move || db.search(&vector, k, metric, filter.as_ref()))
            .await
            .map_err(|e| RagError::RetrievalUnavailable(format!("search task aborted: {e}")))?
            .map_err(|e| RagError::RetrievalUnavailable(e.to_string()))
    }

    pub async fn count(&self) -> Result<usize, RagError> {
        Ok(self.db.lock().await.count_documents()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::DistanceMetric;
    use serde_json::json;

    fn spec(dimension: usize) -> CollectionSpec {
        CollectionSpec {
            dimension,
            metric: DistanceMetric::Cosine,
            model_id: "test".into(),
        }
    }

    fn shared_db() -> Arc<TokioMutex<Db>> {
        Arc::new(TokioMutex::new(Db::open_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn test_upsert_fills_contract_keys() {
        let index = VectorIndex::ensure_collection(shared_db(), spec(3)).await.unwrap();
        let payload = json!({ "title": "วัดภูมินทร์" }).as_object().unwrap().clone();
        index.upsert("wat-phumin", "จิตรกรรมฝาผนัง", &[1.0, 0.0, 0.0], payload).await.unwrap();

        let hits = index.search(&[1.0, 0.0, 0.0], 5, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        let doc = &hits[0].document;
        assert_eq!(doc.text, "จิตรกรรมฝาผนัง");
        assert_eq!(doc.payload_str("source_id"), Some("wat-phumin"));
        assert_eq!(doc.payload_str("title"), Some("วัดภูมินทร์"));
    }

    #[tokio::test]
    async fn test_reopen_with_other_spec_fails() {
        let db = shared_db();
        VectorIndex::ensure_collection(db.clone(), spec(3)).await.unwrap();
        let again = VectorIndex::ensure_collection(db.clone(), spec(3)).await;
        assert!(again.is_ok());

        let err = VectorIndex::ensure_collection(db, spec(4)).await.err().unwrap();
        assert!(matches!(err, RagError::SchemaMismatch { .. }));
    }

    #[tokio::test]
    async fn test_wrong_vector_length_is_rejected() {
        let index = VectorIndex::ensure_collection(shared_db(), spec(3)).await.unwrap();
        let err = index.upsert("x", "x", &[1.0], Payload::new()).await.unwrap_err();
        assert!(matches!(err, RagError::SchemaMismatch { .. }));
        let err = index.search(&[1.0, 0.0], 5, None).await.unwrap_err();
        assert!(matches!(err, RagError::SchemaMismatch { .. }));
        assert_eq!(index.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_search_failure_is_retrieval_unavailable() {
        let db = shared_db();
        let index = VectorIndex::ensure_collection(db.clone(), spec(3)).await.unwrap();
        db.lock().await.conn.execute_batch("DROP TABLE vec_documents;").unwrap();

        let err = index.search(&[1.0, 0.0, 0.0], 5, None).await.unwrap_err();
        assert!(matches!(err, RagError::RetrievalUnavailable(_)));
    }

    #[tokio::test]
    async fn test_delete_missing_is_noop() {
        let index = VectorIndex::ensure_collection(shared_db(), spec(3)).await.unwrap();
        assert!(!index.delete("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_upserts_to_different_ids() {
        let index = Arc::new(VectorIndex::ensure_collection(shared_db(), spec(3)).await.unwrap());
        let mut handles = Vec::new();
        for i in 0..16 {
            let index = index.clone();
            handles.push(tokio::spawn(async move {
                let v = [1.0, i as f32, 0.5];
                index.upsert(&format!("doc-{i}"), "t", &v, Payload::new()).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(index.count().await.unwrap(), 16);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_searches_interleave_with_writes() {
        let index = Arc::new(VectorIndex::ensure_collection(shared_db(), spec(3)).await.unwrap());
        let district = json!({ "district": "ปัว" }).as_object().unwrap().clone();
        index.upsert("pua", "ปัว", &[1.0, 0.0, 0.0], district).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let index = index.clone();
            handles.push(tokio::spawn(async move {
                index.upsert(&format!("doc-{i}"), "t", &[0.0, 1.0, i as f32], Payload::new()).await?;
                let filter = SearchFilter::default().must("district", "ปัว");
                index.search(&[1.0, 0.0, 0.0], 3, Some(&filter)).await
            }));
        }
        for h in handles {
            let hits = h.await.unwrap().unwrap();
            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].document.id, "pua");
        }
        assert_eq!(index.count().await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_fingerprint_is_the_requested_spec() {
        let index = VectorIndex::ensure_collection(shared_db(), spec(3)).await.unwrap();
        assert_eq!(index.fingerprint().to_string(), "test/3d/cosine");
    }
}
