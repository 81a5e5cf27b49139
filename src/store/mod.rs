//! The narrow transactional interface the engine runs against.
//!
//! Each method is one store round trip or one transaction. Methods named
//! `try_*` and [`Store::reclaim`] run a whole critical section atomically
//! and report lost races as data ([`ClaimAttempt::Lost`]) or as
//! [`crate::error::Error::Contention`], never by partially applying.
//!
//! Implementations: [`crate::db::Db`] (Postgres) and [`MemoryStore`].

pub mod memory;

pub use memory::{MemoryStore, Op};

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::*;
use crate::policy::ConflictRule;

/// Inputs to one assignment transaction.
#[derive(Debug, Clone, Copy)]
pub struct ClaimRequest<'a> {
    pub scope: &'a str,
    pub worker: &'a WorkerIdentity,
    pub tier: Option<&'a str>,
    pub window: u32,
    pub conflict: ConflictRule,
}

/// What one assignment transaction did.
#[derive(Debug, Clone)]
pub enum ClaimAttempt {
    /// Committed: a new claim and the unit with its incremented count.
    Claimed(Box<Ticket>),
    /// No candidate in the sampled window was eligible. Nothing written.
    Exhausted,
    /// Rolled back: the conditional increment hit zero rows, or the
    /// identity gained a claim concurrently. Re-run the whole attempt.
    Lost,
}

/// What one completion transaction did.
#[derive(Debug, Clone)]
pub enum CompleteAttempt {
    /// Committed. Carries the completed claim and the unit's new
    /// `finished_count`.
    Completed { claim: Claim, finished_count: u32 },
    NotFound,
    AlreadyCompleted,
}

/// What one per-claim reclaim transaction did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimAttempt {
    /// Unit decremented and claim deleted.
    Reclaimed,
    /// The claim was completed or deleted since it was listed. Nothing written.
    Skipped,
}

pub trait Store: Send + Sync {
    /// The claim held by this identity within a scope, open or completed.
    fn find_claim(
        &self,
        scope: &str,
        worker: &WorkerIdentity,
    ) -> impl Future<Output = Result<Option<Claim>>> + Send;

    fn get_claim(&self, id: ClaimId) -> impl Future<Output = Result<Claim>> + Send;

    fn get_unit(&self, id: UnitId) -> impl Future<Output = Result<WorkUnit>> + Send;

    /// One assignment transaction: sample candidates, screen them against
    /// the worker's holdings, conditionally increment, insert the claim.
    fn try_claim(
        &self,
        request: ClaimRequest<'_>,
    ) -> impl Future<Output = Result<ClaimAttempt>> + Send;

    /// One completion transaction with an in-transaction recheck of the
    /// completed flag.
    fn try_complete(
        &self,
        id: ClaimId,
        result: &serde_json::Value,
    ) -> impl Future<Output = Result<CompleteAttempt>> + Send;

    /// Open claims in `scope` created before `cutoff`, oldest first.
    fn stale_claims(
        &self,
        scope: &str,
        cutoff: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Claim>>> + Send;

    /// One reclaim transaction: verify the claim is still open, decrement
    /// its unit (exactly one row), delete it (exactly one row).
    fn reclaim(&self, claim: &Claim) -> impl Future<Output = Result<ReclaimAttempt>> + Send;

    /// At least one unit in scope (and tier, if given) has spare capacity.
    fn has_capacity(
        &self,
        scope: &str,
        tier: Option<&str>,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Bulk-create units with the given capacity. All or nothing.
    fn insert_units(
        &self,
        scope: &str,
        capacity: u32,
        units: &[NewWorkUnit],
    ) -> impl Future<Output = Result<Vec<UnitId>>> + Send;

    fn tally(&self, scope: &str) -> impl Future<Output = Result<Tally>> + Send;

    fn insert_feedback(&self, feedback: &Feedback) -> impl Future<Output = Result<()>> + Send;
}
