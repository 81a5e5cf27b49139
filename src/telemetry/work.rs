//! Claim operation span helpers.
//!
//! One span per engine call. The `claim.outcome` field is declared empty
//! and filled in by [`record_outcome`] once the call resolves.

use tracing::Span;

/// Start a span for one engine operation (`claim.assign`,
/// `claim.complete`, `claim.reclaim`) within a scope.
pub fn start_claim_span(operation: &'static str, scope: &str) -> Span {
    tracing::info_span!(
        "claim",
        "otel.name" = operation,
        "claim.scope" = scope,
        "claim.id" = tracing::field::Empty,
        "claim.outcome" = tracing::field::Empty,
        "claim.attempts" = tracing::field::Empty,
    )
}

/// Attach the claim id once it is known.
pub fn record_claim_id(span: &Span, claim_id: &impl std::fmt::Display) {
    span.record("claim.id", tracing::field::display(claim_id));
}

/// Record how the operation resolved and how many store attempts it took.
pub fn record_outcome(span: &Span, outcome: &str, attempts: u32) {
    span.record("claim.outcome", outcome);
    span.record("claim.attempts", attempts);
}
