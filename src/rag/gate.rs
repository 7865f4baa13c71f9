use serde::Serialize;

use crate::db::models::QueryResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Answer,
    Defer,
}

/// Decides whether retrieved evidence is strong enough to answer.
///
/// Pure: no I/O, no state beyond its configuration.
#[derive(Debug, Clone)]
pub struct ConfidenceGate {
    threshold: f32,
    trusted_flags: Vec<String>,
}

impl ConfidenceGate {
    #[must_use]
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            trusted_flags: Vec::new(),
        }
    }

    /// Payload flags (e.g. `is_direct_match`) that answer regardless of score.
    #[must_use]
    pub fn with_trusted_flags(mut self, flags: Vec<String>) -> Self {
        self.trusted_flags = flags;
        self
    }

    #[must_use]
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Best score in the result set; negative infinity when empty.
    #[must_use]
    pub fn max_score(results: &[QueryResult]) -> f32 {
        results
            .iter()
            .map(QueryResult::score)
            .fold(f32::NEG_INFINITY, f32::max)
    }

    #[must_use]
    pub fn evaluate(&self, results: &[QueryResult]) -> Decision {
        if Self::max_score(results) >= self.threshold || self.has_trusted(results) {
            Decision::Answer
        } else {
            Decision::Defer
        }
    }

    fn has_trusted(&self, results: &[QueryResult]) -> bool {
        !self.trusted_flags.is_empty()
            && results.iter().any(|r| {
                self.trusted_flags
                    .iter()
                    .any(|flag| r.document.payload.get(flag).is_some_and(is_truthy))
            })
    }
}

pub(crate) fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        serde_json::Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Document, Payload};
    use serde_json::json;

    fn result(score: f32) -> QueryResult {
        result_with(score, Payload::new())
    }

    fn result_with(score: f32, payload: Payload) -> QueryResult {
        QueryResult {
            document: Document::from_payload("doc".into(), payload),
            similarity_score: score,
            rerank_score: None,
            rank: 0,
        }
    }

    #[test]
    fn test_empty_results_defer() {
        let gate = ConfidenceGate::new(0.45);
        assert_eq!(gate.evaluate(&[]), Decision::Defer);
        assert_eq!(ConfidenceGate::max_score(&[]), f32::NEG_INFINITY);
        // Even a permissive threshold cannot answer from nothing
        assert_eq!(ConfidenceGate::new(-10.0).evaluate(&[]), Decision::Defer);
    }

    #[test]
    fn test_threshold_boundary() {
        let gate = ConfidenceGate::new(0.45);
        assert_eq!(gate.evaluate(&[result(0.45)]), Decision::Answer);
        assert_eq!(gate.evaluate(&[result(0.449_99)]), Decision::Defer);
        assert_eq!(gate.evaluate(&[result(0.9), result(0.1)]), Decision::Answer);
        assert_eq!(gate.evaluate(&[result(0.30)]), Decision::Defer);
    }

    #[test]
    fn test_score_sweep() {
        let gate = ConfidenceGate::new(0.45);
        for i in 0..=100 {
            let score = i as f32 / 100.0;
            let expected = if score >= 0.45 { Decision::Answer } else { Decision::Defer };
            assert_eq!(gate.evaluate(&[result(score), result(score / 2.0)]), expected, "score {score}");
        }
    }

    #[test]
    fn test_rerank_score_replaces_similarity() {
        let gate = ConfidenceGate::new(0.45);
        let mut demoted = result(0.9);
        demoted.rerank_score = Some(0.1);
        assert_eq!(gate.evaluate(&[demoted]), Decision::Defer);

        let mut promoted = result(0.1);
        promoted.rerank_score = Some(0.8);
        assert_eq!(gate.evaluate(&[promoted]), Decision::Answer);
    }

    #[test]
    fn test_max_is_order_independent() {
        let results = [result(0.2), result(0.6), result(0.4)];
        assert!((ConfidenceGate::max_score(&results) - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_trusted_flag_override() {
        let flagged = json!({ "is_direct_match": true }).as_object().unwrap().clone();
        let results = [result_with(0.1, flagged)];

        let plain = ConfidenceGate::new(0.45);
        assert_eq!(plain.evaluate(&results), Decision::Defer);

        let trusting = ConfidenceGate::new(0.45).with_trusted_flags(vec!["is_direct_match".into()]);
        assert_eq!(trusting.evaluate(&results), Decision::Answer);

        let off = json!({ "is_direct_match": false }).as_object().unwrap().clone();
        assert_eq!(trusting.evaluate(&[result_with(0.1, off)]), Decision::Defer);
    }
}
