//! The confidence-gated request path.
//!
//! [`RagOrchestrator`](orchestrator::RagOrchestrator) embeds the question,
//! asks the [`VectorIndex`](index::VectorIndex) for the closest documents,
//! rescores them in the [`RerankStage`](rerank::RerankStage) and lets the
//! [`ConfidenceGate`](gate::ConfidenceGate) decide between answering and
//! deferring to the self-correction loop.
pub mod gate;
pub mod index;
pub mod orchestrator;
pub mod rerank;
