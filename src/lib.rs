//! # NanGuide: self-correcting tourism RAG core
//!
//! Answers traveller questions about Nan province from a local vector index,
//! defers when retrieval is not confident, and closes the gap through a
//! research and human-approval loop.
//!
//! ## Architecture
//!
//! - **[`config`]**: configuration loading and validation
//! - **[`db`]**: SQLite + sqlite-vec storage (documents, unanswered log, proposals)
//! - **[`embedder`]**: text embedding via ONNX Runtime (multilingual-e5-small)
//! - **[`rag`]**: vector index, confidence gate and answer orchestration
//! - **[`correction`]**: unanswered log, researcher, approvals, ingestion, scheduler
//! - **[`collaborators`]**: LLM and web search clients behind traits
//! - **[`knowledge`]**: JSON Lines knowledge base loading
//! - **[`app`]**: wiring of all services around one database
//! - **[`mcp`]**: MCP server with 9 tool handlers (stdio transport via rmcp)

pub mod app;
pub mod collaborators;
pub mod config;
pub mod correction;
pub mod db;
pub mod embedder;
pub mod error;
pub mod knowledge;
pub mod mcp;
pub mod rag;
