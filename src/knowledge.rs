/// Bulk loading of the curated knowledge base (JSON Lines, one place per line).
///
/// Each record is flattened into a synthetic passage (title, topic, summary,
/// detail sections, keywords) that is embedded in passage mode.
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::db::models::Payload;
use crate::embedder::{EmbedMode, Embedder, EmbedderError, embed_batch_off_thread};
use crate::error::RagError;
use crate::rag::index::VectorIndex;

/// Payload `source` of curated documents.
pub const KNOWLEDGE_SOURCE: &str = "knowledge-base";

const EMBED_BATCH_SIZE: usize = 16;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DetailSection {
    #[serde(default)]
    pub heading: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LocationData {
    #[serde(default)]
    pub district: Option<String>,
    #[serde(default)]
    pub sub_district: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct KnowledgeRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub details: Vec<DetailSection>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub district: Option<String>,
    #[serde(default)]
    pub sub_district: Option<String>,
    #[serde(default)]
    pub location_data: Option<LocationData>,
}

impl KnowledgeRecord {
    /// Document key: explicit id, else slug.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        self.id
            .as_deref()
            .or(self.slug.as_deref())
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    fn district(&self) -> Option<&str> {
        self.district
            .as_deref()
            .or_else(|| self.location_data.as_ref()?.district.as_deref())
    }

    fn sub_district(&self) -> Option<&str> {
        self.sub_district
            .as_deref()
            .or_else(|| self.location_data.as_ref()?.sub_district.as_deref())
    }

    /// The passage text that gets embedded and shown to the generator.
    #[must_use]
    pub fn synthetic_text(&self) -> String {
        let details = self
            .details
            .iter()
            .map(|d| format!("{}: {}", d.heading, d.content))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "หัวข้อ: {} (หมวดหมู่ย่อย: {})\nสรุป: {}\n\nรายละเอียด:\n{}\n\nคำสำคัญ: {}",
            self.title,
            self.topic,
            self.summary,
            details,
            self.keywords.join(", ")
        )
        .trim()
        .to_string()
    }

    #[must_use]
    pub fn payload(&self) -> Payload {
        let mut payload = Payload::new();
        payload.insert("source".into(), json!(KNOWLEDGE_SOURCE));
        if let Some(key) = self.key() {
            payload.insert("source_id".into(), json!(key));
        }
        payload.insert("title".into(), json!(self.title));
        let optional = [
            ("slug", self.slug.as_deref()),
            ("category", self.category.as_deref()),
            ("district", self.district()),
            ("sub_district", self.sub_district()),
        ];
        for (name, value) in optional {
            if let Some(v) = value {
                payload.insert(name.into(), json!(v));
            }
        }
        payload
    }
}

/// Parse a JSON Lines file. Blank lines are ignored; malformed lines are
/// logged and counted.
pub fn load_jsonl(path: &Path) -> Result<(Vec<KnowledgeRecord>, usize)> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read knowledge file: {}", path.display()))?;

    let mut records = Vec::new();
    let mut malformed = 0;
    for (line_no, line) in data.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<KnowledgeRecord>(line) {
            Ok(r) => records.push(r),
            Err(e) => {
                malformed += 1;
                warn!("Skipping line {}: {e}", line_no + 1);
            }
        }
    }
    info!("Loaded {} knowledge records from {}", records.len(), path.display());
    Ok((records, malformed))
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub indexed: usize,
    pub skipped: usize,
}

/// Embed and upsert every record with a key. Re-running replaces documents
/// in place.
pub async fn index_records(
    index: &VectorIndex,
    embedder: Arc<dyn Embedder>,
    records: &[KnowledgeRecord],
    show_progress: bool,
) -> Result<IndexReport, RagError> {
    let pb = if show_progress {
        let pb = ProgressBar::new(records.len() as u64);
        if let Ok(style) = ProgressStyle::default_bar().template("  {bar:40.cyan/blue} {pos}/{len} {msg}") {
            pb.set_style(style.progress_chars("█▓░"));
        }
        pb
    } else {
        ProgressBar::hidden()
    };

    let mut report = IndexReport::default();
    let keyed: Vec<(&str, &KnowledgeRecord)> = records
        .iter()
        .filter_map(|record| {
            let key = record.key();
            if key.is_none() {
                warn!(title = %record.title, "Skipping knowledge record without id or slug");
                report.skipped += 1;
                pb.inc(1);
            }
            key.map(|k| (k, record))
        })
        .collect();

    for batch in keyed.chunks(EMBED_BATCH_SIZE) {
        let texts: Vec<String> = batch.iter().map(|(_, r)| r.synthetic_text()).collect();
        let vectors = embed_batch_off_thread(embedder.clone(), texts.clone(), EmbedMode::Passage).await?;
        if vectors.len() != batch.len() {
            return Err(EmbedderError::InferenceFailed(format!(
                "embedder returned {} vectors for {} texts",
                vectors.len(),
                batch.len()
            ))
            .into());
        }

        for (((key, record), text), vector) in batch.iter().zip(&texts).zip(&vectors) {
            pb.set_message(key.to_string());
            index.upsert(key, text, vector, record.payload()).await?;
            report.indexed += 1;
            pb.inc(1);
        }
    }
    pb.finish_and_clear();

    info!(indexed = report.indexed, skipped = report.skipped, "Knowledge base indexed");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const PHUMIN: &str = r#"{"slug": "wat-phumin", "title": "วัดภูมินทร์", "topic": "วัด", "summary": "วัดเก่าแก่กลางเมืองน่าน", "details": [{"heading": "ไฮไลท์", "content": "จิตรกรรมปู่ม่านย่าม่าน"}], "keywords": ["วัด", "จิตรกรรม"], "category": "วัด", "location_data": {"district": "เมืองน่าน", "sub_district": "ในเวียง"}}"#;

    #[test]
    fn test_synthetic_text_layout() {
        let record: KnowledgeRecord = serde_json::from_str(PHUMIN).unwrap();
        let text = record.synthetic_text();
        assert!(text.starts_with("หัวข้อ: วัดภูมินทร์ (หมวดหมู่ย่อย: วัด)\nสรุป: วัดเก่าแก่กลางเมืองน่าน"));
        assert!(text.contains("รายละเอียด:\nไฮไลท์: จิตรกรรมปู่ม่านย่าม่าน"));
        assert!(text.ends_with("คำสำคัญ: วัด, จิตรกรรม"));
    }

    #[test]
    fn test_payload_flattens_location() {
        let record: KnowledgeRecord = serde_json::from_str(PHUMIN).unwrap();
        assert_eq!(record.key(), Some("wat-phumin"));
        let payload = record.payload();
        assert_eq!(payload["source"], "knowledge-base");
        assert_eq!(payload["source_id"], "wat-phumin");
        assert_eq!(payload["district"], "เมืองน่าน");
        assert_eq!(payload["sub_district"], "ในเวียง");
        assert_eq!(payload["category"], "วัด");
    }

    #[test]
    fn test_id_takes_precedence_over_slug() {
        let record: KnowledgeRecord =
            serde_json::from_str(r#"{"id": "poi-9", "slug": "doi", "title": "x"}"#).unwrap();
        assert_eq!(record.key(), Some("poi-9"));
        let record: KnowledgeRecord = serde_json::from_str(r#"{"id": "  ", "title": "x"}"#).unwrap();
        assert_eq!(record.key(), None);
    }

    #[test]
    fn test_load_jsonl_skips_bad_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{PHUMIN}").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "not json").unwrap();
        writeln!(file, r#"{{"title": "no key"}}"#).unwrap();

        let (records, malformed) = load_jsonl(file.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(malformed, 1);
    }

    #[tokio::test]
    async fn test_index_records() {
        use crate::db::Db;
        use crate::db::models::{CollectionSpec, DistanceMetric};
        use crate::embedder::hash::HashEmbedder;
        use tokio::sync::Mutex as TokioMutex;

        let db = Arc::new(TokioMutex::new(Db::open_in_memory().unwrap()));
        let embedder = Arc::new(HashEmbedder::new(64));
        let spec = CollectionSpec {
            dimension: 64,
            metric: DistanceMetric::Cosine,
            model_id: embedder.model_id().into(),
        };
        let index = VectorIndex::ensure_collection(db.clone(), spec).await.unwrap();

        let records = vec![
            serde_json::from_str::<KnowledgeRecord>(PHUMIN).unwrap(),
            KnowledgeRecord { title: "keyless".into(), ..Default::default() },
        ];
        let report = index_records(&index, embedder.clone(), &records, false).await.unwrap();
        assert_eq!(report, IndexReport { indexed: 1, skipped: 1 });

        // Re-indexing replaces instead of duplicating
        index_records(&index, embedder, &records, false).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 1);
        let doc = db.lock().await.get_document("wat-phumin").unwrap().unwrap();
        assert_eq!(doc.payload_str("source"), Some(KNOWLEDGE_SOURCE));
    }

    #[tokio::test]
    async fn test_index_records_spans_batches() {
        use crate::db::Db;
        use crate::db::models::{CollectionSpec, DistanceMetric};
        use crate::embedder::hash::HashEmbedder;
        use tokio::sync::Mutex as TokioMutex;

        let db = Arc::new(TokioMutex::new(Db::open_in_memory().unwrap()));
        let embedder = Arc::new(HashEmbedder::new(32));
        let spec = CollectionSpec {
            dimension: 32,
            metric: DistanceMetric::Cosine,
            model_id: embedder.model_id().into(),
        };
        let index = VectorIndex::ensure_collection(db.clone(), spec).await.unwrap();

        let records: Vec<KnowledgeRecord> = (0..EMBED_BATCH_SIZE * 2 + 3)
            .map(|i| KnowledgeRecord {
                slug: Some(format!("poi-{i}")),
                title: format!("จุดที่ {i}"),
                ..Default::default()
            })
            .collect();
        let report = index_records(&index, embedder.clone(), &records, false).await.unwrap();
        assert_eq!(report.indexed, records.len());
        assert_eq!(index.count().await.unwrap(), records.len());

        // Each document keeps the vector of its own text
        let hits = index
            .search(&embedder.embed(&records[20].synthetic_text(), EmbedMode::Passage).unwrap(), 1, None)
            .await
            .unwrap();
        assert_eq!(hits[0].document.id, "poi-20");
    }
}
