//! Core data model.
//!
//! A work unit is something a crowd worker can be assigned: a batch of
//! clips, a question, an action. A claim binds one worker identity to one
//! unit until it is completed or reclaimed.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Ids
// ---------------------------------------------------------------------------

/// Newtype for work unit IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub Uuid);

impl UnitId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UnitId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype for claim IDs. This is the reference handed to the worker and
/// echoed back on submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimId(pub Uuid);

impl ClaimId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClaimId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClaimId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ClaimId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

// ---------------------------------------------------------------------------
// Worker identity
// ---------------------------------------------------------------------------

/// One survey attempt: the (worker, study, session) triple supplied by the
/// recruiting platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub worker_id: String,
    pub study_id: String,
    pub session_id: String,
}

impl WorkerIdentity {
    pub fn new(
        worker_id: impl Into<String>,
        study_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            study_id: study_id.into(),
            session_id: session_id.into(),
        }
    }

    /// All three parts are present. Handlers reject anything else before
    /// reaching the engine.
    pub fn is_complete(&self) -> bool {
        !self.worker_id.trim().is_empty()
            && !self.study_id.trim().is_empty()
            && !self.session_id.trim().is_empty()
    }
}

impl std::fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.worker_id, self.study_id, self.session_id)
    }
}

// ---------------------------------------------------------------------------
// Work unit
// ---------------------------------------------------------------------------

/// An assignable item of crowdsourced work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: UnitId,

    /// The survey this unit belongs to. Claims, holdings and tallies are
    /// all scoped by it.
    pub scope: String,

    /// Maximum number of live claims.
    pub capacity: u32,

    /// Live (open or completed) claims referencing this unit.
    pub claimed_count: u32,

    /// Completed claims. Authoritative input to consensus.
    pub finished_count: u32,

    /// Units sharing a conflict key are tied to the same underlying item;
    /// one worker gets at most one of them.
    pub conflict_key: Option<String>,

    /// Optional filter attribute (domain, difficulty tier).
    pub tier: Option<String>,

    /// Pointer to the content. Opaque to the engine.
    pub payload: serde_json::Value,

    pub created_at: DateTime<Utc>,
}

impl WorkUnit {
    pub fn has_capacity(&self) -> bool {
        self.claimed_count < self.capacity
    }
}

/// Builder for units created during data preparation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewWorkUnit {
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub conflict_key: Option<String>,
    #[serde(default)]
    pub tier: Option<String>,
}

impl NewWorkUnit {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }

    pub fn conflict_key(mut self, key: impl Into<String>) -> Self {
        self.conflict_key = Some(key.into());
        self
    }

    pub fn tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Claim
// ---------------------------------------------------------------------------

/// A binding between a worker identity and a work unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub id: ClaimId,
    pub work_unit_id: UnitId,
    pub scope: String,
    pub worker: WorkerIdentity,
    pub created_at: DateTime<Utc>,
    /// Once true the claim never changes again.
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    /// Classification or annotation submitted by the worker.
    pub result: Option<serde_json::Value>,
}

impl Claim {
    pub fn open(unit: &WorkUnit, worker: &WorkerIdentity, now: DateTime<Utc>) -> Self {
        Self {
            id: ClaimId::new(),
            work_unit_id: unit.id,
            scope: unit.scope.clone(),
            worker: worker.clone(),
            created_at: now,
            completed: false,
            completed_at: None,
            result: None,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.completed
    }
}

/// A claim together with the unit it references. What a worker is handed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub claim: Claim,
    pub unit: WorkUnit,
}

// ---------------------------------------------------------------------------
// Holdings
// ---------------------------------------------------------------------------

/// What one worker_id already holds within a scope, across all sessions.
/// Input to candidate screening.
#[derive(Debug, Clone, Default)]
pub struct Holdings {
    pub units: HashSet<UnitId>,
    pub groups: HashSet<String>,
}

impl Holdings {
    pub fn add(&mut self, unit: UnitId, conflict_key: Option<String>) {
        self.units.insert(unit);
        if let Some(key) = conflict_key {
            self.groups.insert(key);
        }
    }
}

// ---------------------------------------------------------------------------
// Tally
// ---------------------------------------------------------------------------

/// Per-scope counters for operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub scope: String,
    pub units: u64,
    /// Units with `claimed_count < capacity`.
    pub open_units: u64,
    pub capacity: u64,
    pub claimed: u64,
    pub finished: u64,
}

impl Tally {
    /// Claims handed out but not yet finished.
    pub fn in_progress(&self) -> u64 {
        self.claimed.saturating_sub(self.finished)
    }

    pub fn report(&self) -> TallyReport<'_> {
        TallyReport {
            tally: self,
            in_progress: self.in_progress(),
        }
    }
}

/// Operator view of a [`Tally`] with derived counters inlined.
#[derive(Debug, Serialize)]
pub struct TallyReport<'a> {
    #[serde(flatten)]
    pub tally: &'a Tally,
    pub in_progress: u64,
}

// ---------------------------------------------------------------------------
// Feedback
// ---------------------------------------------------------------------------

/// Free-text feedback left by a worker at submission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    pub scope: String,
    pub worker: WorkerIdentity,
    pub body: String,
    pub created_at: DateTime<Utc>,
}
