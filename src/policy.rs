//! Survey policy configuration and registry.
//!
//! A survey policy parameterizes one assigner/recorder/reclaimer triple:
//! capacity, conflict rule, candidate window, reclaim deadline and retry
//! tunables. Policies live in one TOML file per survey.

use crate::error::{Error, Result};
use crate::model::{Holdings, WorkUnit};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Lower bound on the candidate window. Smaller windows make false
/// "no work" answers likely once a few units fill up.
pub const MIN_CANDIDATE_WINDOW: u32 = 10;

/// Upper bound on the candidate window. Larger windows turn the screening
/// scan into a table scan under contention.
pub const MAX_CANDIDATE_WINDOW: u32 = 30;

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct PolicyFile {
    survey: SurveyPolicy,
}

/// Which of a worker's existing claims exclude a candidate unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictRule {
    /// Never the same unit twice for one worker_id.
    Unit,
    /// Never two units with the same conflict key for one worker_id.
    #[default]
    Group,
}

impl ConflictRule {
    /// Whether `held` rules `unit` out for this worker.
    pub fn conflicts(self, unit: &WorkUnit, held: &Holdings) -> bool {
        if held.units.contains(&unit.id) {
            return true;
        }
        match self {
            ConflictRule::Unit => false,
            ConflictRule::Group => unit
                .conflict_key
                .as_ref()
                .is_some_and(|key| held.groups.contains(key)),
        }
    }
}

/// Pick the first candidate with spare capacity that does not conflict with
/// the worker's holdings. Candidates arrive already shuffled.
pub fn screen<'a>(
    candidates: &'a [WorkUnit],
    held: &Holdings,
    rule: ConflictRule,
) -> Option<&'a WorkUnit> {
    candidates
        .iter()
        .find(|unit| unit.has_capacity() && !rule.conflicts(unit, held))
}

/// Retry tunables per operation class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "RetryPolicy::for_assign")]
    pub assign: RetryPolicy,
    #[serde(default = "RetryPolicy::for_complete")]
    pub complete: RetryPolicy,
    #[serde(default = "RetryPolicy::for_reclaim")]
    pub reclaim: RetryPolicy,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            assign: RetryPolicy::for_assign(),
            complete: RetryPolicy::for_complete(),
            reclaim: RetryPolicy::for_reclaim(),
        }
    }
}

impl RetrySettings {
    /// Zero-delay retries everywhere.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            assign: RetryPolicy::immediate(max_attempts),
            complete: RetryPolicy::immediate(max_attempts),
            reclaim: RetryPolicy::immediate(max_attempts),
        }
    }
}

fn default_capacity() -> u32 {
    1
}

fn default_window() -> u32 {
    10
}

fn default_reclaim_after() -> u32 {
    30
}

/// One survey's claim policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurveyPolicy {
    /// Also the scope name units and claims are filed under.
    pub name: String,
    /// Distinct workers per unit: 1 for single-answer tasks, 3 for majority vote.
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    #[serde(default)]
    pub conflict: ConflictRule,
    /// Randomized candidates fetched per assignment attempt.
    #[serde(default = "default_window")]
    pub candidate_window: u32,
    /// Open claims older than this are returned to the pool.
    #[serde(default = "default_reclaim_after")]
    pub reclaim_after_minutes: u32,
    #[serde(default)]
    pub retry: RetrySettings,
}

impl SurveyPolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: default_capacity(),
            conflict: ConflictRule::default(),
            candidate_window: default_window(),
            reclaim_after_minutes: default_reclaim_after(),
            retry: RetrySettings::default(),
        }
    }

    pub fn capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn conflict(mut self, rule: ConflictRule) -> Self {
        self.conflict = rule;
        self
    }

    pub fn candidate_window(mut self, window: u32) -> Self {
        self.candidate_window = window;
        self
    }

    pub fn reclaim_after_minutes(mut self, minutes: u32) -> Self {
        self.reclaim_after_minutes = minutes;
        self
    }

    pub fn retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn reclaim_deadline(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.reclaim_after_minutes))
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("survey name must not be empty".into()));
        }
        if self.capacity == 0 {
            return Err(Error::Config(format!(
                "survey {}: capacity must be at least 1",
                self.name
            )));
        }
        if !(MIN_CANDIDATE_WINDOW..=MAX_CANDIDATE_WINDOW).contains(&self.candidate_window) {
            return Err(Error::Config(format!(
                "survey {}: candidate_window must be within {MIN_CANDIDATE_WINDOW}..={MAX_CANDIDATE_WINDOW}",
                self.name
            )));
        }
        if self.reclaim_after_minutes == 0 {
            return Err(Error::Config(format!(
                "survey {}: reclaim_after_minutes must be at least 1",
                self.name
            )));
        }
        self.retry.assign.validate()?;
        self.retry.complete.validate()?;
        self.retry.reclaim.validate()?;
        Ok(())
    }

    /// Parse and validate one policy document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let file: PolicyFile = toml::from_str(content)
            .map_err(|e| Error::Config(format!("bad survey policy: {e}")))?;
        file.survey.validate()?;
        Ok(file.survey)
    }
}

/// Registry of loaded survey policies, indexed by name.
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    surveys: HashMap<String, SurveyPolicy>,
}

impl PolicyRegistry {
    /// Create an empty registry.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load all `.toml` files from a directory and build the registry.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut registry = Self::empty();

        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::Config(format!("cannot read policy dir {}: {e}", dir.display()))
        })?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                let content = std::fs::read_to_string(&path)?;
                let policy = SurveyPolicy::from_toml(&content)
                    .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
                registry.insert(policy)?;
            }
        }

        Ok(registry)
    }

    /// Add a policy. Two files naming the same survey is a config error.
    pub fn insert(&mut self, policy: SurveyPolicy) -> Result<()> {
        if self.surveys.contains_key(&policy.name) {
            return Err(Error::Config(format!(
                "survey {} is defined more than once",
                policy.name
            )));
        }
        self.surveys.insert(policy.name.clone(), policy);
        Ok(())
    }

    /// Look up a policy by survey name.
    pub fn get(&self, name: &str) -> Option<&SurveyPolicy> {
        self.surveys.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&SurveyPolicy> {
        self.get(name)
            .ok_or_else(|| Error::Config(format!("no policy for survey {name}")))
    }

    pub fn len(&self) -> usize {
        self.surveys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surveys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UnitId;
    use chrono::Utc;

    fn unit(claimed: u32, key: Option<&str>) -> WorkUnit {
        WorkUnit {
            id: UnitId::new(),
            scope: "s".into(),
            capacity: 3,
            claimed_count: claimed,
            finished_count: 0,
            conflict_key: key.map(String::from),
            tier: None,
            payload: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn screen_skips_full_and_conflicting_units() {
        let full = unit(3, None);
        let same_group = unit(0, Some("action-7"));
        let free = unit(1, Some("action-9"));
        let mut held = Holdings::default();
        held.add(UnitId::new(), Some("action-7".into()));

        let candidates = vec![full, same_group, free.clone()];
        let picked = screen(&candidates, &held, ConflictRule::Group).unwrap();
        assert_eq!(picked.id, free.id);
    }

    #[test]
    fn unit_rule_ignores_conflict_keys() {
        let same_group = unit(0, Some("action-7"));
        let mut held = Holdings::default();
        held.add(UnitId::new(), Some("action-7".into()));

        let candidates = vec![same_group.clone()];
        assert!(screen(&candidates, &held, ConflictRule::Group).is_none());
        assert_eq!(
            screen(&candidates, &held, ConflictRule::Unit).unwrap().id,
            same_group.id
        );
    }

    #[test]
    fn held_unit_always_conflicts() {
        let u = unit(0, None);
        let mut held = Holdings::default();
        held.add(u.id, None);
        assert!(ConflictRule::Unit.conflicts(&u, &held));
        assert!(ConflictRule::Group.conflicts(&u, &held));
    }

    #[test]
    fn parses_minimal_policy_with_defaults() {
        let policy = SurveyPolicy::from_toml("[survey]\nname = \"heval\"\n").unwrap();
        assert_eq!(policy.capacity, 1);
        assert_eq!(policy.conflict, ConflictRule::Group);
        assert_eq!(policy.candidate_window, 10);
        assert_eq!(policy.retry, RetrySettings::default());
    }

    #[test]
    fn rejects_oversized_window() {
        let err = SurveyPolicy::from_toml(
            "[survey]\nname = \"heval\"\ncandidate_window = 500\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn window_bounds_are_inclusive() {
        for window in [MIN_CANDIDATE_WINDOW, MAX_CANDIDATE_WINDOW] {
            SurveyPolicy::new("heval")
                .candidate_window(window)
                .validate()
                .unwrap();
        }
        for window in [1, MIN_CANDIDATE_WINDOW - 1, MAX_CANDIDATE_WINDOW + 1] {
            let err = SurveyPolicy::new("heval")
                .candidate_window(window)
                .validate()
                .unwrap_err();
            assert!(matches!(err, Error::Config(_)), "accepted window {window}");
        }
    }
}
