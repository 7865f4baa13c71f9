//! Self-correction loop: deferred queries are researched, reviewed by a
//! human and ingested back into the index.
//!
//! ```text
//! DEFER ─▶ UnansweredLog ─▶ ResearcherAgent ─▶ ApprovalStore (PENDING)
//!                                                  │ human
//!                                                  ▼
//!          VectorIndex ◀── IngestionService ◀── APPROVED
//! ```
pub mod approvals;
pub mod ingestion;
pub mod log;
pub mod researcher;
pub mod scheduler;
