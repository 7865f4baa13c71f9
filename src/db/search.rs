use super::documents::map_document_row;
use super::{Db, models::*, serialize_vector};
use rusqlite::Result;
use rusqlite::types::Value;

/// Payload conditions applied before ranking.
///
/// `must` pairs require the top-level payload key to equal the value;
/// `must_not` pairs exclude documents whose key equals the value (documents
/// missing the key are kept).
#[derive(Debug, Default, Clone)]
pub struct SearchFilter {
    pub must: Vec<(String, serde_json::Value)>,
    pub must_not: Vec<(String, serde_json::Value)>,
}

impl SearchFilter {
    #[must_use]
    pub fn must(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.must.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn must_not(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.must_not.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.must.is_empty() && self.must_not.is_empty()
    }
}

/// JSON path for a top-level payload key.
fn json_path(key: &str) -> String {
    format!("$.\"{}\"", key.replace('"', ""))
}

/// Convert a JSON value to what `json_extract` yields for it.
fn sql_value(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Integer(i64::from(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::Real(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}

impl Db {
    /// Rank documents by similarity to `query_vector`.
    ///
    /// Results are sorted by descending similarity; equal scores put the most
    /// recently inserted document first.
    pub fn search(
        &self,
        query_vector: &[f32],
        top_k: usize,
        metric: DistanceMetric,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<QueryResult>> {
        let mut query = format!(
            r#"
            SELECT
                d.doc_key,
                d.payload,
                {}(v.embedding, ?) AS distance
            FROM vec_documents v
            JOIN documents d ON v.rowid = d.id
            "#,
            metric.sql_function()
        );

        let mut where_clauses = Vec::new();
        let mut params: Vec<Value> = vec![Value::Blob(serialize_vector(query_vector))];

        if let Some(f) = filter {
            for (key, value) in &f.must {
                where_clauses.push("json_extract(d.payload, ?) = ?");
                params.push(Value::Text(json_path(key)));
                params.push(sql_value(value));
            }
            for (key, value) in &f.must_not {
                where_clauses.push("json_extract(d.payload, ?) IS NOT ?");
                params.push(Value::Text(json_path(key)));
                params.push(sql_value(value));
            }
        }

        if !where_clauses.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&where_clauses.join(" AND "));
        }

        query.push_str(" ORDER BY distance ASC, d.id DESC LIMIT ?");
        params.push(Value::Integer(top_k as i64));

        let param_refs: Vec<&dyn rusqlite::ToSql> =
            params.iter().map(|p| p as &dyn rusqlite::ToSql).collect();

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            let document = map_document_row(row)?;
            let distance: f64 = row.get(2)?;
            Ok((document, distance))
        })?;

        let mut results = Vec::new();
        for (rank, row) in rows.enumerate() {
            let (document, distance) = row?;
            results.push(QueryResult {
                document,
                similarity_score: metric.similarity(distance),
                rerank_score: None,
                rank,
            });
        }

        Ok(results)
    }
}
