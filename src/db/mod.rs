//! Persistence layer: SQLite + sqlite-vec.
//!
//! One database file holds the vector collection, the unanswered-query log
//! and the proposal store, so a single backup captures the whole
//! self-correction state.
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Result, params};
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::Once;
use tracing::info;

pub mod documents;
pub mod models;
pub mod proposals;
pub mod search;
pub mod unanswered;

use models::{CollectionSpec, DistanceMetric};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    doc_key TEXT NOT NULL UNIQUE,
    payload TEXT NOT NULL DEFAULT '{}',
    updated_at DATETIME NOT NULL
);

CREATE TABLE IF NOT EXISTS collection_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    dimension INTEGER NOT NULL,
    metric TEXT NOT NULL,
    model_id TEXT NOT NULL,
    created_at DATETIME NOT NULL
);

CREATE TABLE IF NOT EXISTS unanswered (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    query_key TEXT NOT NULL UNIQUE,
    query_text TEXT NOT NULL,
    first_seen_at DATETIME NOT NULL,
    last_seen_at DATETIME NOT NULL,
    occurrence_count INTEGER NOT NULL DEFAULT 1,
    max_observed_score REAL,
    status TEXT NOT NULL DEFAULT 'OPEN',
    researching_since DATETIME,
    resolved_at DATETIME
);

CREATE INDEX IF NOT EXISTS idx_unanswered_status ON unanswered(status);

CREATE TABLE IF NOT EXISTS proposals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    query_key TEXT NOT NULL,
    query_text TEXT NOT NULL,
    proposed_answer TEXT NOT NULL,
    source_refs TEXT NOT NULL DEFAULT '[]',
    confidence REAL NOT NULL,
    status TEXT NOT NULL DEFAULT 'PENDING',
    created_at DATETIME NOT NULL,
    decided_at DATETIME,
    ingested_at DATETIME,
    ingested_doc_key TEXT
);

CREATE INDEX IF NOT EXISTS idx_proposals_status ON proposals(status);
CREATE INDEX IF NOT EXISTS idx_proposals_query ON proposals(query_key);

-- At most one active proposal per normalized query.
CREATE UNIQUE INDEX IF NOT EXISTS idx_proposals_active
    ON proposals(query_key) WHERE status IN ('PENDING', 'APPROVED');
"#;

static INIT_VEC: Once = Once::new();

/// Initialize the sqlite-vec extension. Safe to call multiple times.
fn init_sqlite_vec() {
    INIT_VEC.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// Outcome of reconciling a requested collection with the stored one.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionCheck {
    /// No collection existed; it was created with the requested spec.
    Created,
    /// The stored collection matches the requested spec.
    Matched,
    /// The stored collection differs; nothing was changed.
    Mismatch(CollectionSpec),
}

/// A wrapper around a SQLite connection initialized with sqlite-vec and the application schema.
pub struct Db {
    pub(crate) conn: Connection,
}

impl Db {
    /// Open a database connection at the given path and initialize the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Initializing database: {}", path.display());

        init_sqlite_vec();
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory database connection (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        init_sqlite_vec();
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        let vec_version: String = conn.query_row("SELECT vec_version()", [], |row| row.get(0))?;
        info!("sqlite-vec version: {}", vec_version);

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    /// Read the stored collection spec, if a collection has been created.
    pub fn collection_spec(&self) -> Result<Option<CollectionSpec>> {
        self.conn
            .query_row(
                "SELECT dimension, metric, model_id FROM collection_meta WHERE id = 1",
                [],
                |row| {
                    let dimension: i64 = row.get(0)?;
                    Ok(CollectionSpec {
                        dimension: dimension as usize,
                        metric: row.get::<_, DistanceMetric>(1)?,
                        model_id: row.get(2)?,
                    })
                },
            )
            .optional()
    }

    /// Create the vector collection or verify the existing one.
    ///
    /// Idempotent for an identical spec. A differing dimension, metric or
    /// model id is reported as `Mismatch` and leaves the database untouched.
    pub fn ensure_collection(&mut self, spec: &CollectionSpec) -> Result<CollectionCheck> {
        if let Some(existing) = self.collection_spec()? {
            if &existing != spec {
                return Ok(CollectionCheck::Mismatch(existing));
            }
            // Recreate the vector table if it went missing; no-op otherwise.
            self.conn.execute_batch(&vec_table_sql(existing.dimension))?;
            return Ok(CollectionCheck::Matched);
        }

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO collection_meta (id, dimension, metric, model_id, created_at) VALUES (1, ?, ?, ?, ?)",
            params![spec.dimension as i64, spec.metric, spec.model_id, Utc::now()],
        )?;
        tx.execute_batch(&vec_table_sql(spec.dimension))?;
        tx.commit()?;

        info!(
            dimension = spec.dimension,
            metric = %spec.metric,
            model = %spec.model_id,
            "Created vector collection"
        );
        Ok(CollectionCheck::Created)
    }
}

fn vec_table_sql(dimension: usize) -> String {
    format!("CREATE VIRTUAL TABLE IF NOT EXISTS vec_documents USING vec0(embedding FLOAT[{dimension}]);")
}

/// Helper to serialize a float32 vector into bytes for vec0 virtual table
pub fn serialize_vector(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(dimension: usize) -> CollectionSpec {
        CollectionSpec {
            dimension,
            metric: DistanceMetric::Cosine,
            model_id: "hash-trigram-v1".to_string(),
        }
    }

    #[test]
    fn test_db_init() {
        let db = Db::open_in_memory().expect("Failed to open in-memory DB");

        let tables: usize = db.conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type='table' AND name IN ('documents', 'collection_meta', 'unanswered', 'proposals');",
            [],
            |row| row.get(0),
        ).unwrap();
        assert_eq!(tables, 4);
        assert!(db.collection_spec().unwrap().is_none());
    }

    #[test]
    fn test_ensure_collection_is_idempotent() {
        let mut db = Db::open_in_memory().unwrap();
        assert_eq!(db.ensure_collection(&spec(8)).unwrap(), CollectionCheck::Created);
        assert_eq!(db.ensure_collection(&spec(8)).unwrap(), CollectionCheck::Matched);
        assert_eq!(db.collection_spec().unwrap(), Some(spec(8)));
    }

    #[test]
    fn test_ensure_collection_reports_mismatch() {
        let mut db = Db::open_in_memory().unwrap();
        db.ensure_collection(&spec(8)).unwrap();

        let check = db.ensure_collection(&spec(16)).unwrap();
        assert_eq!(check, CollectionCheck::Mismatch(spec(8)));

        let mut other_metric = spec(8);
        other_metric.metric = DistanceMetric::L2;
        assert!(matches!(
            db.ensure_collection(&other_metric).unwrap(),
            CollectionCheck::Mismatch(_)
        ));

        let mut other_model = spec(8);
        other_model.model_id = "onnx:multilingual-e5-small".to_string();
        assert!(matches!(
            db.ensure_collection(&other_model).unwrap(),
            CollectionCheck::Mismatch(_)
        ));
    }

    #[test]
    fn test_serialize_vector() {
        let vec = vec![1.0, 2.0, -3.5];
        let bytes = serialize_vector(&vec);
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[0..4], &[0x00, 0x00, 0x80, 0x3f]);
        assert_eq!(&bytes[4..8], &[0x00, 0x00, 0x00, 0x40]);
        assert_eq!(&bytes[8..12], &[0x00, 0x00, 0x60, 0xc0]);
    }
}
