//! Reclaimer: return abandoned open claims to the pool.
//!
//! A sweep lists open claims older than the survey's deadline and reclaims
//! each in its own transaction. A transient failure restarts the whole
//! sweep; claims already reclaimed are no longer listed, so no unit is
//! decremented twice.

use crate::outcome::Failure;
use crate::policy::SurveyPolicy;
use crate::store::{ReclaimAttempt, Store};
use crate::telemetry::metrics;
use crate::telemetry::work::{record_outcome, start_claim_span};
use chrono::Utc;
use opentelemetry::KeyValue;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{Instrument, debug, info};

use super::failure_from;

/// What one sweep did, summed over its attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    pub scope: String,
    pub reclaimed: usize,
    /// Listed as stale but completed or gone by the time they were locked.
    pub skipped: usize,
    pub attempts: u32,
}

pub struct Reclaimer<S> {
    store: Arc<S>,
    policy: Arc<SurveyPolicy>,
}

impl<S> Clone for Reclaimer<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            policy: Arc::clone(&self.policy),
        }
    }
}

impl<S: Store> Reclaimer<S> {
    pub fn new(store: Arc<S>, policy: Arc<SurveyPolicy>) -> Self {
        Self { store, policy }
    }

    pub async fn sweep(&self) -> std::result::Result<ReclaimReport, Failure> {
        let scope = self.policy.name.as_str();
        let span = start_claim_span("claim.reclaim", scope);
        let started = Instant::now();
        let cutoff = Utc::now() - self.policy.reclaim_deadline();
        let reclaimed = &AtomicUsize::new(0);
        let skipped = &AtomicUsize::new(0);
        let attempts = &AtomicU32::new(0);
        let store = &self.store;

        let result = self
            .policy
            .retry
            .reclaim
            .run("reclaim", move |attempt| async move {
                attempts.store(attempt, Ordering::Relaxed);
                let stale = store.stale_claims(scope, cutoff).await?;
                debug!(attempt, stale = stale.len(), "sweeping stale claims");
                for claim in &stale {
                    match store.reclaim(claim).await? {
                        ReclaimAttempt::Reclaimed => {
                            reclaimed.fetch_add(1, Ordering::Relaxed);
                            metrics::claims_reclaimed()
                                .add(1, &[KeyValue::new("scope", scope.to_string())]);
                            debug!(
                                claim_id = %claim.id,
                                unit_id = %claim.work_unit_id,
                                worker = %claim.worker,
                                "reclaimed"
                            );
                        }
                        ReclaimAttempt::Skipped => {
                            skipped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                Ok(())
            })
            .instrument(span.clone())
            .await;

        let attempts = attempts.load(Ordering::Relaxed);
        let reclaimed = reclaimed.load(Ordering::Relaxed);
        let outcome = match result {
            Ok(()) => {
                span.in_scope(|| {
                    info!(
                        reclaimed,
                        skipped = skipped.load(Ordering::Relaxed),
                        attempts,
                        "reclaimed {reclaimed} stale claims"
                    );
                });
                Ok(ReclaimReport {
                    scope: scope.to_string(),
                    reclaimed,
                    skipped: skipped.load(Ordering::Relaxed),
                    attempts,
                })
            }
            Err(e) => Err(span.in_scope(|| failure_from("reclaim", scope, &e))),
        };

        record_outcome(
            &span,
            match &outcome {
                Ok(_) => "swept",
                Err(failure) => failure.kind.as_str(),
            },
            attempts,
        );
        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "claim.reclaim")],
        );
        outcome
    }
}
