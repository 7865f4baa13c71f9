use super::{Db, models::*};
use chrono::Utc;
use rusqlite::{OptionalExtension, Result, params};

const PROPOSAL_COLUMNS: &str = "id, query_text, proposed_answer, source_refs, confidence, status, \
     created_at, decided_at, ingested_at, ingested_doc_key";

impl Db {
    /// Insert a PENDING proposal.
    ///
    /// Fails with a constraint violation if the query already has an active
    /// (PENDING or APPROVED) proposal; see [`is_unique_violation`].
    pub fn insert_proposal(&self, new: &NewProposal) -> Result<Proposal> {
        let refs = serde_json::to_string(&new.source_refs)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        let sql = format!(
            "INSERT INTO proposals
                (query_key, query_text, proposed_answer, source_refs, confidence, status, created_at)
             VALUES (?, ?, ?, ?, ?, 'PENDING', ?)
             RETURNING {PROPOSAL_COLUMNS}"
        );
        self.conn.query_row(
            &sql,
            params![
                normalize_query(&new.query_text),
                new.query_text.trim(),
                new.proposed_answer,
                refs,
                f64::from(new.confidence.clamp(0.0, 1.0)),
                Utc::now()
            ],
            map_proposal_row,
        )
    }

    pub fn get_proposal(&self, id: i64) -> Result<Option<Proposal>> {
        let sql = format!("SELECT {PROPOSAL_COLUMNS} FROM proposals WHERE id = ?");
        self.conn.query_row(&sql, params![id], map_proposal_row).optional()
    }

    /// List proposals in creation order, optionally restricted to one status.
    pub fn list_proposals(&self, status: Option<ProposalStatus>) -> Result<Vec<Proposal>> {
        let sql = format!(
            "SELECT {PROPOSAL_COLUMNS} FROM proposals
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![status], map_proposal_row)?;
        rows.collect()
    }

    /// The PENDING or APPROVED proposal for a query, if any.
    pub fn active_proposal_for(&self, query_text: &str) -> Result<Option<Proposal>> {
        let sql = format!(
            "SELECT {PROPOSAL_COLUMNS} FROM proposals
             WHERE query_key = ? AND status IN ('PENDING', 'APPROVED')"
        );
        self.conn
            .query_row(&sql, params![normalize_query(query_text)], map_proposal_row)
            .optional()
    }

    /// Compare-and-set a decision (`from` → APPROVED or REJECTED).
    ///
    /// Returns false if the row was not in `from` any more. Transition rules
    /// are enforced by the caller.
    pub fn decide_proposal(&self, id: i64, from: ProposalStatus, to: ProposalStatus) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE proposals SET status = ?3, decided_at = ?4 WHERE id = ?1 AND status = ?2",
            params![id, from, to, Utc::now()],
        )?;
        Ok(changed > 0)
    }

    /// APPROVED → INGESTED, recording the document the answer was stored under.
    pub fn mark_proposal_ingested(&self, id: i64, doc_key: Option<&str>) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE proposals SET status = 'INGESTED', ingested_at = ?2, ingested_doc_key = ?3
             WHERE id = ?1 AND status = 'APPROVED'",
            params![id, Utc::now(), doc_key],
        )?;
        Ok(changed > 0)
    }

    /// Replace the drafted answer of a PENDING proposal (reviewer edit).
    pub fn revise_proposal_answer(&self, id: i64, answer: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE proposals SET proposed_answer = ?2 WHERE id = ?1 AND status = 'PENDING'",
            params![id, answer],
        )?;
        Ok(changed > 0)
    }
}

/// Whether a storage error is a UNIQUE constraint failure.
///
/// NOT NULL and CHECK failures are not duplicates and stay storage errors.
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn map_proposal_row(row: &rusqlite::Row<'_>) -> Result<Proposal> {
    let refs_json: String = row.get(3)?;
    let source_refs: Vec<String> = serde_json::from_str(&refs_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e)))?;
    let confidence: f64 = row.get(4)?;
    Ok(Proposal {
        id: row.get(0)?,
        query_text: row.get(1)?,
        proposed_answer: row.get(2)?,
        source_refs,
        confidence: confidence as f32,
        status: row.get(5)?,
        created_at: row.get(6)?,
        decided_at: row.get(7)?,
        ingested_at: row.get(8)?,
        ingested_doc_key: row.get(9)?,
    })
}
