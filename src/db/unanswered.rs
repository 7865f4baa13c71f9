use super::{Db, models::*};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Result, params};

const ENTRY_COLUMNS: &str = "id, query_text, first_seen_at, last_seen_at, occurrence_count, \
     max_observed_score, status, researching_since, resolved_at";

impl Db {
    /// Record a deferred query, creating the entry or bumping its counter.
    ///
    /// A single statement keyed by the normalized query, so concurrent callers
    /// never produce duplicate rows. `score` of `None` (nothing retrieved)
    /// never lowers an existing maximum. A RESOLVED entry is reopened.
    pub fn record_unanswered(&self, query_text: &str, score: Option<f32>) -> Result<UnansweredEntry> {
        let key = normalize_query(query_text);
        let score = score.filter(|s| s.is_finite()).map(f64::from);
        let sql = format!(
            "INSERT INTO unanswered
                (query_key, query_text, first_seen_at, last_seen_at, occurrence_count, max_observed_score, status)
             VALUES (?1, ?2, ?3, ?3, 1, ?4, 'OPEN')
             ON CONFLICT(query_key) DO UPDATE SET
                last_seen_at = excluded.last_seen_at,
                occurrence_count = occurrence_count + 1,
                max_observed_score = COALESCE(
                    MAX(max_observed_score, excluded.max_observed_score),
                    max_observed_score,
                    excluded.max_observed_score
                ),
                status = CASE WHEN status = 'RESOLVED' THEN 'OPEN' ELSE status END,
                resolved_at = CASE WHEN status = 'RESOLVED' THEN NULL ELSE resolved_at END
             RETURNING {ENTRY_COLUMNS}"
        );
        self.conn.query_row(
            &sql,
            params![key, query_text.trim(), Utc::now(), score],
            map_entry_row,
        )
    }

    pub fn get_unanswered(&self, query_text: &str) -> Result<Option<UnansweredEntry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM unanswered WHERE query_key = ?");
        self.conn
            .query_row(&sql, params![normalize_query(query_text)], map_entry_row)
            .optional()
    }

    /// List entries, oldest first, optionally restricted to one status.
    pub fn list_unanswered(&self, status: Option<UnansweredStatus>) -> Result<Vec<UnansweredEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM unanswered
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![status], map_entry_row)?;
        rows.collect()
    }

    /// OPEN → RESEARCHING. Returns false if the entry was not OPEN.
    pub fn mark_researching(&self, query_text: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE unanswered SET status = 'RESEARCHING', researching_since = ?2
             WHERE query_key = ?1 AND status = 'OPEN'",
            params![normalize_query(query_text), Utc::now()],
        )?;
        Ok(changed > 0)
    }

    /// RESEARCHING → OPEN, used when research for the entry failed.
    pub fn mark_open(&self, query_text: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE unanswered SET status = 'OPEN', researching_since = NULL
             WHERE query_key = ?1 AND status = 'RESEARCHING'",
            params![normalize_query(query_text)],
        )?;
        Ok(changed > 0)
    }

    /// Any status → RESOLVED. Returns false if the entry is missing or already resolved.
    pub fn mark_resolved(&self, query_text: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE unanswered SET status = 'RESOLVED', resolved_at = ?2, researching_since = NULL
             WHERE query_key = ?1 AND status != 'RESOLVED'",
            params![normalize_query(query_text), Utc::now()],
        )?;
        Ok(changed > 0)
    }

    /// Revert RESEARCHING entries started before `cutoff` that have no active proposal.
    pub fn revert_stale_researching(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.conn.execute(
            "UPDATE unanswered SET status = 'OPEN', researching_since = NULL
             WHERE status = 'RESEARCHING'
               AND researching_since < ?1
               AND NOT EXISTS (
                   SELECT 1 FROM proposals p
                   WHERE p.query_key = unanswered.query_key
                     AND p.status IN ('PENDING', 'APPROVED')
               )",
            params![cutoff],
        )
    }
}

fn map_entry_row(row: &rusqlite::Row<'_>) -> Result<UnansweredEntry> {
    let score: Option<f64> = row.get(5)?;
    Ok(UnansweredEntry {
        id: row.get(0)?,
        query_text: row.get(1)?,
        first_seen_at: row.get(2)?,
        last_seen_at: row.get(3)?,
        occurrence_count: row.get(4)?,
        max_observed_score: score.map(|s| s as f32),
        status: row.get(6)?,
        researching_since: row.get(7)?,
        resolved_at: row.get(8)?,
    })
}
