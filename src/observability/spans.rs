//! Span constructors for the metered operations.

use std::time::Instant;
use tracing::{Level, Span, field, span};

use crate::types::GenerationType;

pub fn deduction_span(user_id: &str, model_id: &str, request_type: &str) -> Span {
    span!(
        Level::INFO,
        "ledger.deduct",
        user_id = user_id,
        model_id = model_id,
        request_type = request_type,
        tokens = field::Empty,
        path = field::Empty,
        success = field::Empty,
    )
}

pub fn quota_span(user_id: &str, kind: GenerationType) -> Span {
    span!(
        Level::DEBUG,
        "quota.check",
        user_id = user_id,
        generation_type = kind.as_str(),
        current = field::Empty,
        limit = field::Empty,
    )
}

/// Times one generation call inside its own span.
pub struct GenerationSpan {
    span: Span,
    start: Instant,
}

impl GenerationSpan {
    pub fn new(user_id: &str, request_type: &str, model_id: &str) -> Self {
        let span = span!(
            Level::INFO,
            "metering.generate",
            user_id = user_id,
            request_type = request_type,
            model_id = model_id,
            latency_ms = field::Empty,
            success = field::Empty,
        );
        Self {
            span,
            start: Instant::now(),
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Records the outcome and returns the elapsed milliseconds.
    pub fn finish(self, success: bool) -> f64 {
        let latency_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.span.record("latency_ms", latency_ms as u64);
        self.span.record("success", success);
        latency_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_span_finish() {
        let span = GenerationSpan::new("u1", GenerationType::Image.as_str(), "flux-pro");
        assert!(span.finish(true) >= 0.0);
    }
}
