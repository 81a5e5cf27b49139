//! In-process store.
//!
//! Every transactional step runs under one mutex, which gives the same
//! all-or-nothing behavior the Postgres store gets from `SERIALIZABLE`
//! transactions. Used by the test suite and for dry runs without a
//! database. Faults can be injected per operation call to exercise the
//! engine's retry paths.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;

use super::{ClaimAttempt, ClaimRequest, CompleteAttempt, ReclaimAttempt, Store};
use crate::error::{Error, Result};
use crate::model::*;
use crate::policy::screen;

/// Transactional operations that can have faults injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Claim,
    Complete,
    Reclaim,
    /// Claim lookup by id.
    Lookup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Fault {
    /// Fail before touching anything, as a lock timeout would.
    Transient,
    /// Report a lost conditional increment.
    LostRace,
    /// Fail as if a counter update matched zero rows.
    Integrity,
}

#[derive(Default)]
struct Inner {
    units: HashMap<UnitId, WorkUnit>,
    claims: HashMap<ClaimId, Claim>,
    feedback: Vec<Feedback>,
    calls: HashMap<Op, usize>,
    faults: HashSet<(Op, usize, Fault)>,
}

impl Inner {
    /// Count a call of `op` and return the fault planned for it, if any.
    fn tick(&mut self, op: Op) -> Result<Option<Fault>> {
        let n = self.calls.entry(op).or_default();
        *n += 1;
        let n = *n;
        if self.faults.remove(&(op, n, Fault::Transient)) {
            return Err(Error::Transient(format!(
                "injected failure on {op:?} call {n}"
            )));
        }
        if self.faults.remove(&(op, n, Fault::Integrity)) {
            return Err(Error::Integrity(format!(
                "injected counter mismatch on {op:?} call {n}"
            )));
        }
        if self.faults.remove(&(op, n, Fault::LostRace)) {
            return Ok(Some(Fault::LostRace));
        }
        Ok(None)
    }

    fn identity_claim(&self, scope: &str, worker: &WorkerIdentity) -> Option<&Claim> {
        self.claims
            .values()
            .find(|c| c.scope == scope && &c.worker == worker)
    }

    fn holdings(&self, scope: &str, worker_id: &str) -> Holdings {
        let mut held = Holdings::default();
        for claim in self
            .claims
            .values()
            .filter(|c| c.scope == scope && c.worker.worker_id == worker_id)
        {
            let key = self
                .units
                .get(&claim.work_unit_id)
                .and_then(|u| u.conflict_key.clone());
            held.add(claim.work_unit_id, key);
        }
        held
    }
}

fn tier_matches(unit: &WorkUnit, tier: Option<&str>) -> bool {
    tier.is_none_or(|t| unit.tier.as_deref() == Some(t))
}

/// Store backend held entirely in memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Other("memory store mutex poisoned".into()))
    }

    // -----------------------------------------------------------------------
    // Fault injection
    // -----------------------------------------------------------------------

    /// Make the `call`-th (1-based) invocation of `op` fail with a
    /// transient error before it writes anything.
    pub fn fail_call(&self, op: Op, call: usize) -> Result<()> {
        self.lock()?.faults.insert((op, call, Fault::Transient));
        Ok(())
    }

    /// Make the `call`-th assignment transaction report a lost race.
    pub fn lose_claim_race(&self, call: usize) -> Result<()> {
        self.lock()?.faults.insert((Op::Claim, call, Fault::LostRace));
        Ok(())
    }

    /// Make the `call`-th invocation of `op` fail with an integrity
    /// violation before it writes anything.
    pub fn break_counters(&self, op: Op, call: usize) -> Result<()> {
        self.lock()?.faults.insert((op, call, Fault::Integrity));
        Ok(())
    }

    /// How many times `op` has been invoked.
    pub fn calls(&self, op: Op) -> Result<usize> {
        Ok(self.lock()?.calls.get(&op).copied().unwrap_or(0))
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn units(&self, scope: &str) -> Result<Vec<WorkUnit>> {
        let inner = self.lock()?;
        let mut units: Vec<WorkUnit> = inner
            .units
            .values()
            .filter(|u| u.scope == scope)
            .cloned()
            .collect();
        units.sort_by_key(|u| u.created_at);
        Ok(units)
    }

    pub fn claims(&self, scope: &str) -> Result<Vec<Claim>> {
        let inner = self.lock()?;
        let mut claims: Vec<Claim> = inner
            .claims
            .values()
            .filter(|c| c.scope == scope)
            .cloned()
            .collect();
        claims.sort_by_key(|c| c.created_at);
        Ok(claims)
    }

    pub fn feedback(&self, scope: &str) -> Result<Vec<Feedback>> {
        let inner = self.lock()?;
        Ok(inner
            .feedback
            .iter()
            .filter(|f| f.scope == scope)
            .cloned()
            .collect())
    }

    /// Shift a claim's `created_at` into the past.
    pub fn backdate_claim(&self, id: ClaimId, age: chrono::Duration) -> Result<()> {
        let mut inner = self.lock()?;
        let claim = inner
            .claims
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("claim {id}")))?;
        claim.created_at -= age;
        Ok(())
    }

    /// Verify the counter invariants for every unit in `scope`.
    pub fn check_invariants(&self, scope: &str) -> Result<()> {
        let inner = self.lock()?;
        for unit in inner.units.values().filter(|u| u.scope == scope) {
            let live = inner
                .claims
                .values()
                .filter(|c| c.work_unit_id == unit.id)
                .count() as u32;
            let done = inner
                .claims
                .values()
                .filter(|c| c.work_unit_id == unit.id && c.completed)
                .count() as u32;
            if unit.claimed_count != live {
                return Err(Error::Integrity(format!(
                    "unit {}: claimed_count {} but {live} live claims",
                    unit.id, unit.claimed_count
                )));
            }
            if unit.claimed_count > unit.capacity {
                return Err(Error::Integrity(format!(
                    "unit {}: claimed_count {} exceeds capacity {}",
                    unit.id, unit.claimed_count, unit.capacity
                )));
            }
            if unit.finished_count != done {
                return Err(Error::Integrity(format!(
                    "unit {}: finished_count {} but {done} completed claims",
                    unit.id, unit.finished_count
                )));
            }
        }
        Ok(())
    }
}

impl Store for MemoryStore {
    async fn find_claim(&self, scope: &str, worker: &WorkerIdentity) -> Result<Option<Claim>> {
        Ok(self.lock()?.identity_claim(scope, worker).cloned())
    }

    async fn get_claim(&self, id: ClaimId) -> Result<Claim> {
        let mut inner = self.lock()?;
        inner.tick(Op::Lookup)?;
        inner
            .claims
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("claim {id}")))
    }

    async fn get_unit(&self, id: UnitId) -> Result<WorkUnit> {
        self.lock()?
            .units
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("work unit {id}")))
    }

    async fn try_claim(&self, request: ClaimRequest<'_>) -> Result<ClaimAttempt> {
        let mut inner = self.lock()?;
        if inner.tick(Op::Claim)? == Some(Fault::LostRace) {
            return Ok(ClaimAttempt::Lost);
        }

        // Mirrors the unique index on the identity in Postgres.
        if inner.identity_claim(request.scope, request.worker).is_some() {
            return Ok(ClaimAttempt::Lost);
        }

        let held = inner.holdings(request.scope, &request.worker.worker_id);
        let mut candidates: Vec<WorkUnit> = inner
            .units
            .values()
            .filter(|u| u.scope == request.scope && u.has_capacity())
            .filter(|u| tier_matches(u, request.tier))
            .cloned()
            .collect();
        candidates.shuffle(&mut rand::rng());
        candidates.truncate(request.window as usize);

        let Some(pick) = screen(&candidates, &held, request.conflict) else {
            return Ok(ClaimAttempt::Exhausted);
        };

        let unit = inner
            .units
            .get_mut(&pick.id)
            .ok_or_else(|| Error::Integrity(format!("candidate unit {} vanished", pick.id)))?;
        if !unit.has_capacity() {
            return Ok(ClaimAttempt::Lost);
        }
        unit.claimed_count += 1;
        let unit = unit.clone();

        let claim = Claim::open(&unit, request.worker, Utc::now());
        inner.claims.insert(claim.id, claim.clone());
        Ok(ClaimAttempt::Claimed(Box::new(Ticket { claim, unit })))
    }

    async fn try_complete(&self, id: ClaimId, result: &serde_json::Value) -> Result<CompleteAttempt> {
        let mut guard = self.lock()?;
        guard.tick(Op::Complete)?;
        let inner = &mut *guard;

        let Some(claim) = inner.claims.get_mut(&id) else {
            return Ok(CompleteAttempt::NotFound);
        };
        if claim.completed {
            return Ok(CompleteAttempt::AlreadyCompleted);
        }

        let unit = inner.units.get_mut(&claim.work_unit_id).ok_or_else(|| {
            Error::Integrity(format!("claim {id} references missing unit {}", claim.work_unit_id))
        })?;
        if unit.finished_count >= unit.claimed_count {
            return Err(Error::Integrity(format!(
                "unit {}: finished_count would exceed claimed_count {}",
                unit.id, unit.claimed_count
            )));
        }

        unit.finished_count += 1;
        claim.completed = true;
        claim.completed_at = Some(Utc::now());
        claim.result = Some(result.clone());

        Ok(CompleteAttempt::Completed {
            claim: claim.clone(),
            finished_count: unit.finished_count,
        })
    }

    async fn stale_claims(&self, scope: &str, cutoff: DateTime<Utc>) -> Result<Vec<Claim>> {
        let inner = self.lock()?;
        let mut stale: Vec<Claim> = inner
            .claims
            .values()
            .filter(|c| c.scope == scope && c.is_open() && c.created_at < cutoff)
            .cloned()
            .collect();
        stale.sort_by_key(|c| c.created_at);
        Ok(stale)
    }

    async fn reclaim(&self, claim: &Claim) -> Result<ReclaimAttempt> {
        let mut guard = self.lock()?;
        guard.tick(Op::Reclaim)?;
        let inner = &mut *guard;

        match inner.claims.get(&claim.id) {
            Some(current) if current.is_open() => {}
            _ => return Ok(ReclaimAttempt::Skipped),
        }

        let unit = inner.units.get_mut(&claim.work_unit_id).ok_or_else(|| {
            Error::Integrity(format!(
                "claim {} references missing unit {}",
                claim.id, claim.work_unit_id
            ))
        })?;
        if unit.claimed_count == 0 {
            return Err(Error::Integrity(format!(
                "unit {}: claimed_count already zero while claim {} is live",
                unit.id, claim.id
            )));
        }
        unit.claimed_count -= 1;
        inner.claims.remove(&claim.id);
        Ok(ReclaimAttempt::Reclaimed)
    }

    async fn has_capacity(&self, scope: &str, tier: Option<&str>) -> Result<bool> {
        Ok(self
            .lock()?
            .units
            .values()
            .any(|u| u.scope == scope && u.has_capacity() && tier_matches(u, tier)))
    }

    async fn insert_units(
        &self,
        scope: &str,
        capacity: u32,
        units: &[NewWorkUnit],
    ) -> Result<Vec<UnitId>> {
        if capacity == 0 {
            return Err(Error::Config("unit capacity must be at least 1".into()));
        }
        let mut inner = self.lock()?;
        let now = Utc::now();
        let mut ids = Vec::with_capacity(units.len());
        for new in units {
            let unit = WorkUnit {
                id: UnitId::new(),
                scope: scope.to_string(),
                capacity,
                claimed_count: 0,
                finished_count: 0,
                conflict_key: new.conflict_key.clone(),
                tier: new.tier.clone(),
                payload: new.payload.clone(),
                created_at: now,
            };
            ids.push(unit.id);
            inner.units.insert(unit.id, unit);
        }
        Ok(ids)
    }

    async fn tally(&self, scope: &str) -> Result<Tally> {
        let inner = self.lock()?;
        let mut tally = Tally {
            scope: scope.to_string(),
            ..Default::default()
        };
        for unit in inner.units.values().filter(|u| u.scope == scope) {
            tally.units += 1;
            tally.capacity += u64::from(unit.capacity);
            tally.claimed += u64::from(unit.claimed_count);
            tally.finished += u64::from(unit.finished_count);
            if unit.has_capacity() {
                tally.open_units += 1;
            }
        }
        Ok(tally)
    }

    async fn insert_feedback(&self, feedback: &Feedback) -> Result<()> {
        self.lock()?.feedback.push(feedback.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ConflictRule;

    fn request<'a>(scope: &'a str, worker: &'a WorkerIdentity) -> ClaimRequest<'a> {
        ClaimRequest {
            scope,
            worker,
            tier: None,
            window: 10,
            conflict: ConflictRule::Group,
        }
    }

    #[tokio::test]
    async fn injected_transient_failure_writes_nothing() {
        let store = MemoryStore::new();
        store
            .insert_units("s", 1, &[NewWorkUnit::default()])
            .await
            .unwrap();
        store.fail_call(Op::Claim, 1).unwrap();

        let who = WorkerIdentity::new("w", "st", "se");
        let err = store.try_claim(request("s", &who)).await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.claims("s").unwrap().is_empty());
        assert_eq!(store.units("s").unwrap()[0].claimed_count, 0);

        // Second call is clean.
        assert!(matches!(
            store.try_claim(request("s", &who)).await.unwrap(),
            ClaimAttempt::Claimed(_)
        ));
        assert_eq!(store.calls(Op::Claim).unwrap(), 2);
    }

    #[tokio::test]
    async fn injected_integrity_fault_is_not_transient() {
        let store = MemoryStore::new();
        store
            .insert_units("s", 1, &[NewWorkUnit::default()])
            .await
            .unwrap();
        store.break_counters(Op::Claim, 1).unwrap();

        let who = WorkerIdentity::new("w", "st", "se");
        let err = store.try_claim(request("s", &who)).await.unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
        assert!(!err.is_transient());
        assert!(store.claims("s").unwrap().is_empty());
        store.check_invariants("s").unwrap();
    }

    #[tokio::test]
    async fn second_claim_for_identity_is_lost() {
        let store = MemoryStore::new();
        store
            .insert_units("s", 3, &[NewWorkUnit::default(), NewWorkUnit::default()])
            .await
            .unwrap();
        let who = WorkerIdentity::new("w", "st", "se");
        assert!(matches!(
            store.try_claim(request("s", &who)).await.unwrap(),
            ClaimAttempt::Claimed(_)
        ));
        assert!(matches!(
            store.try_claim(request("s", &who)).await.unwrap(),
            ClaimAttempt::Lost
        ));
        store.check_invariants("s").unwrap();
    }

    #[tokio::test]
    async fn reclaim_of_completed_claim_is_skipped() {
        let store = MemoryStore::new();
        store
            .insert_units("s", 1, &[NewWorkUnit::default()])
            .await
            .unwrap();
        let who = WorkerIdentity::new("w", "st", "se");
        let ClaimAttempt::Claimed(ticket) = store.try_claim(request("s", &who)).await.unwrap() else {
            panic!("expected a claim");
        };
        store
            .try_complete(ticket.claim.id, &serde_json::json!({"guess": "yes"}))
            .await
            .unwrap();

        assert_eq!(
            store.reclaim(&ticket.claim).await.unwrap(),
            ReclaimAttempt::Skipped
        );
        assert_eq!(store.units("s").unwrap()[0].claimed_count, 1);
        store.check_invariants("s").unwrap();
    }
}
