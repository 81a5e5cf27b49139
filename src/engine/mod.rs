//! Claim engine: assignment, completion and reclamation for one survey.
//!
//! An [`Engine`] binds a [`Store`] to a validated [`SurveyPolicy`]. Worker
//! facing calls return `Result<T, Failure>`; store errors are classified
//! and logged here and never cross this boundary.

pub mod assign;
pub mod complete;
pub mod reclaim;

pub use assign::{Assigner, Assignment};
pub use complete::{Completion, Recorder, locate_claim};
pub use reclaim::{ReclaimReport, Reclaimer};

use crate::error::{Error, Result};
use crate::model::{ClaimId, Feedback, NewWorkUnit, Tally, UnitId, WorkerIdentity};
use crate::outcome::Failure;
use crate::policy::SurveyPolicy;
use crate::store::Store;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Map an error that outlived its retry policy to a boundary failure.
///
/// Transient errors become "retry later". Everything else is an internal
/// failure whose details stay in the log.
pub(crate) fn failure_from(operation: &'static str, scope: &str, err: &Error) -> Failure {
    if err.is_transient() {
        warn!(operation, scope, error = %err, "retries exhausted");
        Failure::retry_later()
    } else {
        error!(operation, scope, error = %err, "operation failed");
        Failure::internal()
    }
}

/// Assigner, recorder and reclaimer for one survey, sharing a store.
pub struct Engine<S> {
    store: Arc<S>,
    policy: Arc<SurveyPolicy>,
    assigner: Assigner<S>,
    recorder: Recorder<S>,
    reclaimer: Reclaimer<S>,
}

impl<S> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            policy: Arc::clone(&self.policy),
            assigner: self.assigner.clone(),
            recorder: self.recorder.clone(),
            reclaimer: self.reclaimer.clone(),
        }
    }
}

impl<S: Store> Engine<S> {
    /// Build an engine. Fails if the policy does not validate.
    pub fn new(store: Arc<S>, policy: SurveyPolicy) -> Result<Self> {
        policy.validate()?;
        let policy = Arc::new(policy);
        Ok(Self {
            assigner: Assigner::new(Arc::clone(&store), Arc::clone(&policy)),
            recorder: Recorder::new(Arc::clone(&store), Arc::clone(&policy)),
            reclaimer: Reclaimer::new(Arc::clone(&store), Arc::clone(&policy)),
            store,
            policy,
        })
    }

    pub fn scope(&self) -> &str {
        &self.policy.name
    }

    pub fn policy(&self) -> &SurveyPolicy {
        &self.policy
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Resume the identity's claim or hand out a new one.
    pub async fn assign(
        &self,
        worker: &WorkerIdentity,
        tier: Option<&str>,
    ) -> std::result::Result<Assignment, Failure> {
        self.assigner.assign(worker, tier).await
    }

    /// Mark a claim finished and store its result.
    pub async fn complete(
        &self,
        claim_id: ClaimId,
        result: serde_json::Value,
    ) -> std::result::Result<Completion, Failure> {
        self.recorder.complete(claim_id, result).await
    }

    /// One reclaim sweep over stale open claims.
    pub async fn reclaim(&self) -> std::result::Result<ReclaimReport, Failure> {
        self.reclaimer.sweep().await
    }

    /// Whether at least one unit (of `tier`, if given) still has spare
    /// capacity. Does not account for the worker's conflicts.
    pub async fn has_available_work(
        &self,
        tier: Option<&str>,
    ) -> std::result::Result<bool, Failure> {
        let scope = self.scope();
        self.policy
            .retry
            .assign
            .run("has_available_work", move |_| {
                self.store.has_capacity(scope, tier)
            })
            .await
            .map_err(|e| failure_from("has_available_work", scope, &e))
    }

    /// Store free-text feedback. Returns `false` when the text is blank and
    /// nothing was written.
    pub async fn record_feedback(
        &self,
        worker: &WorkerIdentity,
        body: &str,
    ) -> std::result::Result<bool, Failure> {
        let body = body.trim();
        if body.is_empty() {
            return Ok(false);
        }
        let feedback = Feedback {
            scope: self.scope().to_string(),
            worker: worker.clone(),
            body: body.to_string(),
            created_at: chrono::Utc::now(),
        };
        let feedback = &feedback;
        self.policy
            .retry
            .complete
            .run("record_feedback", move |_| self.store.insert_feedback(feedback))
            .await
            .map_err(|e| failure_from("record_feedback", self.scope(), &e))?;
        Ok(true)
    }

    /// Bulk-create units in this survey with the policy's capacity.
    pub async fn load_units(&self, units: &[NewWorkUnit]) -> Result<Vec<UnitId>> {
        let ids = self
            .store
            .insert_units(self.scope(), self.policy.capacity, units)
            .await?;
        info!(
            scope = self.scope(),
            count = ids.len(),
            capacity = self.policy.capacity,
            "loaded work units"
        );
        Ok(ids)
    }

    /// Operator counters for this survey.
    pub async fn tally(&self) -> Result<Tally> {
        self.store.tally(self.scope()).await
    }
}
