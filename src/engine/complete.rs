//! Completion recorder: exactly-once `finished_count` increments.

use crate::error::Error;
use crate::model::{Claim, ClaimId};
use crate::outcome::Failure;
use crate::policy::SurveyPolicy;
use crate::retry::RetryPolicy;
use crate::store::{CompleteAttempt, Store};
use crate::telemetry::metrics;
use crate::telemetry::work::{record_claim_id, record_outcome, start_claim_span};
use opentelemetry::KeyValue;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;
use tracing::{Instrument, info};

use super::failure_from;

/// A recorded completion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    pub claim: Claim,
    /// The unit's `finished_count` after this completion.
    pub finished_count: u32,
}

/// Fetch a claim by id before its survey is known, so a caller can pick
/// the policy from the claim's own scope. Store errors are classified the
/// same way as for [`Recorder::complete`].
pub async fn locate_claim<S: Store>(
    store: &S,
    claim_id: ClaimId,
    retry: &RetryPolicy,
) -> std::result::Result<Claim, Failure> {
    match retry
        .run("locate_claim", move |_| store.get_claim(claim_id))
        .await
    {
        Ok(claim) => Ok(claim),
        Err(Error::NotFound(_)) => Err(Failure::claim_not_found()),
        Err(e) => Err(failure_from("locate_claim", "unscoped", &e)),
    }
}

pub struct Recorder<S> {
    store: Arc<S>,
    policy: Arc<SurveyPolicy>,
}

impl<S> Clone for Recorder<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            policy: Arc::clone(&self.policy),
        }
    }
}

impl<S: Store> Recorder<S> {
    pub fn new(store: Arc<S>, policy: Arc<SurveyPolicy>) -> Self {
        Self { store, policy }
    }

    /// Complete `claim_id` with `result`. A duplicate submission reports
    /// "already completed" and leaves the first result in place.
    pub async fn complete(
        &self,
        claim_id: ClaimId,
        result: serde_json::Value,
    ) -> std::result::Result<Completion, Failure> {
        let scope = self.policy.name.as_str();
        let span = start_claim_span("claim.complete", scope);
        record_claim_id(&span, &claim_id);
        let started = Instant::now();
        let attempts = &AtomicU32::new(0);
        let result = &result;

        let attempt = self
            .policy
            .retry
            .complete
            .run("complete", move |attempt| {
                attempts.store(attempt, Ordering::Relaxed);
                self.store.try_complete(claim_id, result)
            })
            .instrument(span.clone())
            .await;

        let outcome = match attempt {
            Ok(CompleteAttempt::Completed {
                claim,
                finished_count,
            }) => {
                span.in_scope(|| {
                    info!(
                        claim_id = %claim.id,
                        unit_id = %claim.work_unit_id,
                        finished_count,
                        "completed"
                    );
                });
                Ok(Completion {
                    claim,
                    finished_count,
                })
            }
            Ok(CompleteAttempt::NotFound) => Err(Failure::claim_not_found()),
            Ok(CompleteAttempt::AlreadyCompleted) => Err(Failure::already_submitted()),
            Err(e) => Err(span.in_scope(|| failure_from("complete", scope, &e))),
        };

        let label = match &outcome {
            Ok(_) => "completed",
            Err(failure) => failure.kind.as_str(),
        };
        record_outcome(&span, label, attempts.load(Ordering::Relaxed));
        metrics::claims_completed().add(
            1,
            &[
                KeyValue::new("scope", scope.to_string()),
                KeyValue::new("result", label),
            ],
        );
        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "claim.complete")],
        );
        outcome
    }
}
