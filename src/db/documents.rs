use super::{Db, models::*, serialize_vector};
use chrono::Utc;
use rusqlite::{OptionalExtension, Result, params};

impl Db {
    /// Insert or fully replace a document and its embedding.
    ///
    /// A replaced document is re-inserted under a new row id, so it counts
    /// as the most recent entry when search scores tie.
    pub fn upsert_document(&mut self, key: &str, embedding: &[f32], payload: &Payload) -> Result<()> {
        let payload_json = serde_json::Value::Object(payload.clone()).to_string();
        let tx = self.conn.transaction()?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM documents WHERE doc_key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(row_id) = existing {
            tx.execute("DELETE FROM vec_documents WHERE rowid = ?", params![row_id])?;
            tx.execute("DELETE FROM documents WHERE id = ?", params![row_id])?;
        }

        tx.execute(
            "INSERT INTO documents (doc_key, payload, updated_at) VALUES (?, ?, ?)",
            params![key, payload_json, Utc::now()],
        )?;
        let row_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO vec_documents (rowid, embedding) VALUES (?, ?)",
            params![row_id, serialize_vector(embedding)],
        )?;

        tx.commit()
    }

    /// Delete a document by key. Returns whether anything was removed.
    pub fn delete_document(&mut self, key: &str) -> Result<bool> {
        let tx = self.conn.transaction()?;
        let row_id: Option<i64> = tx
            .query_row(
                "SELECT id FROM documents WHERE doc_key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        let Some(row_id) = row_id else {
            return Ok(false);
        };

        // vec0 tables do not take part in foreign-key cascades
        tx.execute("DELETE FROM vec_documents WHERE rowid = ?", params![row_id])?;
        tx.execute("DELETE FROM documents WHERE id = ?", params![row_id])?;
        tx.commit()?;
        Ok(true)
    }

    /// Fetch a document by key.
    pub fn get_document(&self, key: &str) -> Result<Option<Document>> {
        self.conn
            .query_row(
                "SELECT doc_key, payload FROM documents WHERE doc_key = ?",
                params![key],
                map_document_row,
            )
            .optional()
    }

    pub fn count_documents(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

pub(crate) fn map_document_row(row: &rusqlite::Row<'_>) -> Result<Document> {
    let key: String = row.get(0)?;
    let payload_json: String = row.get(1)?;
    let payload = parse_payload(&payload_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, e))?;
    Ok(Document::from_payload(key, payload))
}

fn parse_payload(json: &str) -> std::result::Result<Payload, Box<dyn std::error::Error + Send + Sync>> {
    match serde_json::from_str::<serde_json::Value>(json)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(format!("payload is not an object: {other}").into()),
    }
}
