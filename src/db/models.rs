use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Open metadata map attached to every document.
///
/// `source_id` and `text_content` are always present once a document has
/// been upserted; everything else is free-form.
pub type Payload = serde_json::Map<String, serde_json::Value>;

pub const PAYLOAD_SOURCE_ID: &str = "source_id";
pub const PAYLOAD_TEXT: &str = "text_content";

/// A stored knowledge unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub id: String,
    pub text: String,
    pub payload: Payload,
}

impl Document {
    pub(crate) fn from_payload(id: String, payload: Payload) -> Self {
        let text = payload
            .get(PAYLOAD_TEXT)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Self { id, text, payload }
    }

    /// A string payload field, if present.
    #[must_use]
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}

/// One ranked hit of a similarity search.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub document: Document,
    /// Higher is more similar. Cosine collections report cosine similarity.
    pub similarity_score: f32,
    /// Relevance assigned by the rerank stage, floors included.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
    pub rank: usize,
}

impl QueryResult {
    /// The score ranking and gating use: reranked if available, else similarity.
    #[must_use]
    pub fn score(&self) -> f32 {
        self.rerank_score.unwrap_or(self.similarity_score)
    }
}

/// Distance function the collection ranks with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    Cosine,
    L2,
}

impl DistanceMetric {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::L2 => "l2",
        }
    }

    /// sqlite-vec scalar distance function for this metric.
    pub(crate) fn sql_function(self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "vec_distance_cosine",
            DistanceMetric::L2 => "vec_distance_l2",
        }
    }

    /// Map a raw distance onto a "higher is better" similarity score.
    #[must_use]
    pub fn similarity(self, distance: f64) -> f32 {
        match self {
            DistanceMetric::Cosine => (1.0 - distance) as f32,
            DistanceMetric::L2 => (1.0 / (1.0 + distance)) as f32,
        }
    }
}

/// Pinned identity of a vector collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub dimension: usize,
    pub metric: DistanceMetric,
    pub model_id: String,
}

impl fmt::Display for CollectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}d/{}", self.model_id, self.dimension, self.metric)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnansweredStatus {
    Open,
    Researching,
    Resolved,
}

impl UnansweredStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            UnansweredStatus::Open => "OPEN",
            UnansweredStatus::Researching => "RESEARCHING",
            UnansweredStatus::Resolved => "RESOLVED",
        }
    }
}

/// A deferred query waiting for research.
#[derive(Debug, Clone, Serialize)]
pub struct UnansweredEntry {
    pub id: i64,
    pub query_text: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub occurrence_count: i64,
    /// Best score seen across all deferrals; `None` if every search came back empty.
    pub max_observed_score: Option<f32>,
    pub status: UnansweredStatus,
    pub researching_since: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Review state of a proposal.
///
/// PENDING → APPROVED → INGESTED, PENDING → REJECTED. Nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalStatus {
    Pending,
    Approved,
    Rejected,
    Ingested,
}

impl ProposalStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ProposalStatus::Pending => "PENDING",
            ProposalStatus::Approved => "APPROVED",
            ProposalStatus::Rejected => "REJECTED",
            ProposalStatus::Ingested => "INGESTED",
        }
    }

    #[must_use]
    pub fn can_transition_to(self, next: ProposalStatus) -> bool {
        matches!(
            (self, next),
            (ProposalStatus::Pending, ProposalStatus::Approved)
                | (ProposalStatus::Pending, ProposalStatus::Rejected)
                | (ProposalStatus::Approved, ProposalStatus::Ingested)
        )
    }

    /// Active proposals block new research for the same query.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, ProposalStatus::Pending | ProposalStatus::Approved)
    }
}

/// A researched answer awaiting human review.
#[derive(Debug, Clone, Serialize)]
pub struct Proposal {
    pub id: i64,
    pub query_text: String,
    pub proposed_answer: String,
    pub source_refs: Vec<String>,
    pub confidence: f32,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub ingested_at: Option<DateTime<Utc>>,
    pub ingested_doc_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewProposal {
    pub query_text: String,
    pub proposed_answer: String,
    pub source_refs: Vec<String>,
    pub confidence: f32,
}

/// Key used to deduplicate queries: whitespace collapsed, case folded.
#[must_use]
pub fn normalize_query(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

// ── Text-enum plumbing ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown value: {}", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

macro_rules! text_enum {
    ($ty:ty, { $($text:literal => $variant:expr),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_uppercase().as_str() {
                    $($text => Ok($variant),)+
                    other => Err(UnknownVariant(other.to_string())),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: UnknownVariant| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_enum!(DistanceMetric, {
    "COSINE" => DistanceMetric::Cosine,
    "L2" => DistanceMetric::L2,
});

text_enum!(UnansweredStatus, {
    "OPEN" => UnansweredStatus::Open,
    "RESEARCHING" => UnansweredStatus::Researching,
    "RESOLVED" => UnansweredStatus::Resolved,
});

text_enum!(ProposalStatus, {
    "PENDING" => ProposalStatus::Pending,
    "APPROVED" => ProposalStatus::Approved,
    "REJECTED" => ProposalStatus::Rejected,
    "INGESTED" => ProposalStatus::Ingested,
});
