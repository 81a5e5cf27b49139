//! Assigner: resolve a worker identity to a claim.
//!
//! Each attempt starts by re-reading the identity's claim, so an attempt
//! retried after an ambiguous commit resumes instead of claiming twice.

use crate::error::{Error, Result};
use crate::model::{ClaimId, Ticket, WorkerIdentity};
use crate::outcome::Failure;
use crate::policy::SurveyPolicy;
use crate::store::{ClaimAttempt, ClaimRequest, Store};
use crate::telemetry::metrics;
use crate::telemetry::work::{record_claim_id, record_outcome, start_claim_span};
use opentelemetry::KeyValue;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;
use tracing::{Instrument, debug, info, warn};

use super::failure_from;

/// A claim handed to the worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "assignment", rename_all = "snake_case")]
pub enum Assignment {
    /// A new claim was created by this call.
    Created(Box<Ticket>),
    /// The identity already held this open claim.
    Resumed(Box<Ticket>),
}

impl Assignment {
    pub fn ticket(&self) -> &Ticket {
        match self {
            Assignment::Created(t) | Assignment::Resumed(t) => t,
        }
    }

    pub fn into_ticket(self) -> Ticket {
        match self {
            Assignment::Created(t) | Assignment::Resumed(t) => *t,
        }
    }

    pub fn claim_id(&self) -> ClaimId {
        self.ticket().claim.id
    }

    pub fn is_resumed(&self) -> bool {
        matches!(self, Assignment::Resumed(_))
    }

    fn label(&self) -> &'static str {
        match self {
            Assignment::Created(_) => "created",
            Assignment::Resumed(_) => "resumed",
        }
    }
}

/// Result of one assignment attempt that did not need a retry.
enum Step {
    Assigned(Assignment),
    AlreadyCompleted,
    Exhausted,
}

pub struct Assigner<S> {
    store: Arc<S>,
    policy: Arc<SurveyPolicy>,
}

impl<S> Clone for Assigner<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            policy: Arc::clone(&self.policy),
        }
    }
}

impl<S: Store> Assigner<S> {
    pub fn new(store: Arc<S>, policy: Arc<SurveyPolicy>) -> Self {
        Self { store, policy }
    }

    pub async fn assign(
        &self,
        worker: &WorkerIdentity,
        tier: Option<&str>,
    ) -> std::result::Result<Assignment, Failure> {
        let scope = self.policy.name.as_str();
        let span = start_claim_span("claim.assign", scope);
        let started = Instant::now();
        let attempts = &AtomicU32::new(0);

        let result = self
            .policy
            .retry
            .assign
            .run("assign", move |attempt| {
                attempts.store(attempt, Ordering::Relaxed);
                self.attempt(worker, tier)
            })
            .instrument(span.clone())
            .await;

        let outcome = match result {
            Ok(Step::Assigned(assignment)) => {
                record_claim_id(&span, &assignment.claim_id());
                span.in_scope(|| {
                    info!(
                        worker = %worker,
                        claim_id = %assignment.claim_id(),
                        unit_id = %assignment.ticket().unit.id,
                        resumed = assignment.is_resumed(),
                        "assigned"
                    );
                });
                Ok(assignment)
            }
            Ok(Step::AlreadyCompleted) => Err(Failure::already_finished_task()),
            Ok(Step::Exhausted) => Err(Failure::no_work()),
            // Every sampled window filled up before we could commit.
            Err(e) if e.is_contention() => {
                span.in_scope(|| warn!(worker = %worker, error = %e, "lost every claim race"));
                Err(Failure::no_work())
            }
            Err(e) => Err(span.in_scope(|| failure_from("assign", scope, &e))),
        };

        let label = match &outcome {
            Ok(assignment) => assignment.label(),
            Err(failure) => failure.kind.as_str(),
        };
        record_outcome(&span, label, attempts.load(Ordering::Relaxed));
        metrics::claims_assigned().add(
            1,
            &[
                KeyValue::new("scope", scope.to_string()),
                KeyValue::new("result", label),
            ],
        );
        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "claim.assign")],
        );
        outcome
    }

    /// Resume, or run one claim transaction. A lost race surfaces as
    /// [`Error::Contention`] so the retry wrapper runs the whole attempt again.
    async fn attempt(&self, worker: &WorkerIdentity, tier: Option<&str>) -> Result<Step> {
        let scope = self.policy.name.as_str();

        if let Some(claim) = self.store.find_claim(scope, worker).await? {
            if claim.completed {
                return Ok(Step::AlreadyCompleted);
            }
            let unit = self.store.get_unit(claim.work_unit_id).await?;
            return Ok(Step::Assigned(Assignment::Resumed(Box::new(Ticket {
                claim,
                unit,
            }))));
        }

        let request = ClaimRequest {
            scope,
            worker,
            tier,
            window: self.policy.candidate_window,
            conflict: self.policy.conflict,
        };
        match self.store.try_claim(request).await? {
            ClaimAttempt::Claimed(ticket) => Ok(Step::Assigned(Assignment::Created(ticket))),
            ClaimAttempt::Exhausted => Ok(Step::Exhausted),
            ClaimAttempt::Lost => {
                debug!(worker = %worker, "claim attempt lost a race");
                Err(Error::Contention(format!("claim for {worker} lost a race")))
            }
        }
    }
}
