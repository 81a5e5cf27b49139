//! Claim transactions against Postgres.
//!
//! Every write path runs at SERIALIZABLE and guards its row changes with
//! conditional predicates checked through `rows_affected`. Serialization
//! failures and lock timeouts come back as [`Error::Database`] and are
//! classified by [`Error::is_transient`].

use crate::error::{Error, Result};
use crate::model::*;
use crate::policy::screen;
use crate::store::{ClaimAttempt, ClaimRequest, CompleteAttempt, ReclaimAttempt, Store};
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use super::Db;

/// SQLSTATE for unique_violation.
const UNIQUE_VIOLATION: &str = "23505";

const UNIT_COLUMNS: &str =
    "id, scope, capacity, claimed_count, finished_count, conflict_key, tier, payload, created_at";

const CLAIM_COLUMNS: &str = "id, work_unit_id, scope, worker_id, study_id, session_id, created_at, completed, completed_at, result";

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == UNIQUE_VIOLATION)
}

impl Store for Db {
    async fn find_claim(&self, scope: &str, worker: &WorkerIdentity) -> Result<Option<Claim>> {
        let sql = format!(
            "SELECT {CLAIM_COLUMNS} FROM claims
             WHERE scope = $1 AND worker_id = $2 AND study_id = $3 AND session_id = $4"
        );
        let row: Option<ClaimRow> = sqlx::query_as(&sql)
            .bind(scope)
            .bind(&worker.worker_id)
            .bind(&worker.study_id)
            .bind(&worker.session_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(ClaimRow::into_claim))
    }

    async fn get_claim(&self, id: ClaimId) -> Result<Claim> {
        let sql = format!("SELECT {CLAIM_COLUMNS} FROM claims WHERE id = $1");
        let row: Option<ClaimRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_optional(self.pool())
            .await?;
        row.map(ClaimRow::into_claim)
            .ok_or_else(|| Error::NotFound(format!("claim {id}")))
    }

    async fn get_unit(&self, id: UnitId) -> Result<WorkUnit> {
        let sql = format!("SELECT {UNIT_COLUMNS} FROM work_units WHERE id = $1");
        let row: Option<UnitRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_optional(self.pool())
            .await?;
        row.map(UnitRow::into_unit)
            .ok_or_else(|| Error::NotFound(format!("work unit {id}")))
    }

    async fn try_claim(&self, request: ClaimRequest<'_>) -> Result<ClaimAttempt> {
        let worker = request.worker;
        let mut tx = self.begin_serializable().await?;

        // A concurrent request for the same identity may have committed
        // since the caller's lookup.
        let existing: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM claims
             WHERE scope = $1 AND worker_id = $2 AND study_id = $3 AND session_id = $4",
        )
        .bind(request.scope)
        .bind(&worker.worker_id)
        .bind(&worker.study_id)
        .bind(&worker.session_id)
        .fetch_optional(&mut *tx)
        .await?;
        if existing.is_some() {
            tx.rollback().await?;
            return Ok(ClaimAttempt::Lost);
        }

        let held_rows: Vec<(Uuid, Option<String>)> = sqlx::query_as(
            "SELECT u.id, u.conflict_key FROM claims c
             JOIN work_units u ON u.id = c.work_unit_id
             WHERE c.scope = $1 AND c.worker_id = $2",
        )
        .bind(request.scope)
        .bind(&worker.worker_id)
        .fetch_all(&mut *tx)
        .await?;
        let mut held = Holdings::default();
        for (unit_id, key) in held_rows {
            held.add(UnitId(unit_id), key);
        }

        let sql = format!(
            "SELECT {UNIT_COLUMNS} FROM work_units
             WHERE scope = $1 AND claimed_count < capacity
             AND ($2::text IS NULL OR tier = $2)
             ORDER BY random()
             LIMIT $3"
        );
        let candidates: Vec<WorkUnit> = sqlx::query_as::<_, UnitRow>(&sql)
            .bind(request.scope)
            .bind(request.tier)
            .bind(i64::from(request.window))
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .map(UnitRow::into_unit)
            .collect();

        let Some(pick) = screen(&candidates, &held, request.conflict) else {
            tx.rollback().await?;
            return Ok(ClaimAttempt::Exhausted);
        };

        let updated = sqlx::query(
            "UPDATE work_units SET claimed_count = claimed_count + 1
             WHERE id = $1 AND claimed_count < capacity",
        )
        .bind(pick.id.0)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated != 1 {
            debug!(unit_id = %pick.id, "capacity taken between read and increment");
            tx.rollback().await?;
            return Ok(ClaimAttempt::Lost);
        }

        let sql = format!("SELECT {UNIT_COLUMNS} FROM work_units WHERE id = $1");
        let unit = sqlx::query_as::<_, UnitRow>(&sql)
            .bind(pick.id.0)
            .fetch_one(&mut *tx)
            .await?
            .into_unit();

        let claim = Claim::open(&unit, worker, Utc::now());
        let inserted = sqlx::query(
            "INSERT INTO claims (id, work_unit_id, scope, worker_id, study_id, session_id, created_at, completed)
             VALUES ($1, $2, $3, $4, $5, $6, $7, false)",
        )
        .bind(claim.id.0)
        .bind(unit.id.0)
        .bind(&claim.scope)
        .bind(&worker.worker_id)
        .bind(&worker.study_id)
        .bind(&worker.session_id)
        .bind(claim.created_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                // Dropping the transaction rolls back the increment too.
                return Ok(ClaimAttempt::Lost);
            }
            Err(e) => return Err(e.into()),
        }

        tx.commit().await?;
        Ok(ClaimAttempt::Claimed(Box::new(Ticket { claim, unit })))
    }

    async fn try_complete(&self, id: ClaimId, result: &serde_json::Value) -> Result<CompleteAttempt> {
        let mut tx = self.begin_serializable().await?;

        let row: Option<(Uuid, bool)> =
            sqlx::query_as("SELECT work_unit_id, completed FROM claims WHERE id = $1 FOR UPDATE")
                .bind(id.0)
                .fetch_optional(&mut *tx)
                .await?;
        let unit_id = match row {
            None => {
                tx.rollback().await?;
                return Ok(CompleteAttempt::NotFound);
            }
            Some((_, true)) => {
                tx.rollback().await?;
                return Ok(CompleteAttempt::AlreadyCompleted);
            }
            Some((unit_id, false)) => unit_id,
        };

        let now = Utc::now();
        let marked = sqlx::query(
            "UPDATE claims SET completed = true, completed_at = $2, result = $3
             WHERE id = $1 AND completed = false",
        )
        .bind(id.0)
        .bind(now)
        .bind(result)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if marked != 1 {
            return Err(Error::Contention(format!("claim {id} changed during completion")));
        }

        let finished: Option<(i32,)> = sqlx::query_as(
            "UPDATE work_units SET finished_count = finished_count + 1
             WHERE id = $1 AND finished_count < claimed_count
             RETURNING finished_count",
        )
        .bind(unit_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((finished_count,)) = finished else {
            return Err(Error::Integrity(format!(
                "work unit {unit_id} has no unfinished claim to complete"
            )));
        };

        let sql = format!("SELECT {CLAIM_COLUMNS} FROM claims WHERE id = $1");
        let claim = sqlx::query_as::<_, ClaimRow>(&sql)
            .bind(id.0)
            .fetch_one(&mut *tx)
            .await?
            .into_claim();

        tx.commit().await?;
        Ok(CompleteAttempt::Completed {
            claim,
            finished_count: finished_count as u32,
        })
    }

    async fn stale_claims(&self, scope: &str, cutoff: DateTime<Utc>) -> Result<Vec<Claim>> {
        let sql = format!(
            "SELECT {CLAIM_COLUMNS} FROM claims
             WHERE scope = $1 AND NOT completed AND created_at < $2
             ORDER BY created_at"
        );
        let rows: Vec<ClaimRow> = sqlx::query_as(&sql)
            .bind(scope)
            .bind(cutoff)
            .fetch_all(self.pool())
            .await?;
        Ok(rows.into_iter().map(ClaimRow::into_claim).collect())
    }

    async fn reclaim(&self, claim: &Claim) -> Result<ReclaimAttempt> {
        let mut tx = self.begin_serializable().await?;

        let open: Option<(Uuid,)> = sqlx::query_as(
            "SELECT work_unit_id FROM claims WHERE id = $1 AND NOT completed FOR UPDATE",
        )
        .bind(claim.id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((unit_id,)) = open else {
            tx.rollback().await?;
            return Ok(ReclaimAttempt::Skipped);
        };

        let decremented = sqlx::query(
            "UPDATE work_units SET claimed_count = claimed_count - 1
             WHERE id = $1 AND claimed_count > 0",
        )
        .bind(unit_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if decremented != 1 {
            return Err(Error::Integrity(format!(
                "work unit {unit_id} has claimed_count 0 with an open claim {}",
                claim.id
            )));
        }

        let deleted = sqlx::query("DELETE FROM claims WHERE id = $1 AND NOT completed")
            .bind(claim.id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted != 1 {
            return Err(Error::Integrity(format!(
                "claim {} vanished while locked",
                claim.id
            )));
        }

        tx.commit().await?;
        Ok(ReclaimAttempt::Reclaimed)
    }

    async fn has_capacity(&self, scope: &str, tier: Option<&str>) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (
                SELECT 1 FROM work_units
                WHERE scope = $1 AND claimed_count < capacity
                AND ($2::text IS NULL OR tier = $2)
             )",
        )
        .bind(scope)
        .bind(tier)
        .fetch_one(self.pool())
        .await?;
        Ok(exists)
    }

    async fn insert_units(
        &self,
        scope: &str,
        capacity: u32,
        units: &[NewWorkUnit],
    ) -> Result<Vec<UnitId>> {
        let capacity = i32::try_from(capacity)
            .map_err(|_| Error::Config(format!("capacity {capacity} out of range")))?;
        let now = Utc::now();
        let mut tx = self.pool().begin().await?;
        let mut ids = Vec::with_capacity(units.len());

        for new in units {
            let id = UnitId::new();
            sqlx::query(
                "INSERT INTO work_units (id, scope, capacity, claimed_count, finished_count, conflict_key, tier, payload, created_at)
                 VALUES ($1, $2, $3, 0, 0, $4, $5, $6, $7)",
            )
            .bind(id.0)
            .bind(scope)
            .bind(capacity)
            .bind(&new.conflict_key)
            .bind(&new.tier)
            .bind(&new.payload)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            ids.push(id);
        }

        tx.commit().await?;
        Ok(ids)
    }

    async fn tally(&self, scope: &str) -> Result<Tally> {
        let (units, open_units, capacity, claimed, finished): (i64, i64, i64, i64, i64) =
            sqlx::query_as(
                "SELECT COUNT(*)::bigint,
                        COUNT(*) FILTER (WHERE claimed_count < capacity)::bigint,
                        COALESCE(SUM(capacity), 0)::bigint,
                        COALESCE(SUM(claimed_count), 0)::bigint,
                        COALESCE(SUM(finished_count), 0)::bigint
                 FROM work_units WHERE scope = $1",
            )
            .bind(scope)
            .fetch_one(self.pool())
            .await?;

        Ok(Tally {
            scope: scope.to_string(),
            units: units as u64,
            open_units: open_units as u64,
            capacity: capacity as u64,
            claimed: claimed as u64,
            finished: finished as u64,
        })
    }

    async fn insert_feedback(&self, feedback: &Feedback) -> Result<()> {
        sqlx::query(
            "INSERT INTO feedback (scope, worker_id, study_id, session_id, body, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&feedback.scope)
        .bind(&feedback.worker.worker_id)
        .bind(&feedback.worker.study_id)
        .bind(&feedback.worker.session_id)
        .bind(&feedback.body)
        .bind(feedback.created_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct UnitRow {
    id: Uuid,
    scope: String,
    capacity: i32,
    claimed_count: i32,
    finished_count: i32,
    conflict_key: Option<String>,
    tier: Option<String>,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl UnitRow {
    fn into_unit(self) -> WorkUnit {
        // CHECK constraints keep the counters non-negative.
        WorkUnit {
            id: UnitId(self.id),
            scope: self.scope,
            capacity: self.capacity as u32,
            claimed_count: self.claimed_count as u32,
            finished_count: self.finished_count as u32,
            conflict_key: self.conflict_key,
            tier: self.tier,
            payload: self.payload,
            created_at: self.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ClaimRow {
    id: Uuid,
    work_unit_id: Uuid,
    scope: String,
    worker_id: String,
    study_id: String,
    session_id: String,
    created_at: DateTime<Utc>,
    completed: bool,
    completed_at: Option<DateTime<Utc>>,
    result: Option<serde_json::Value>,
}

impl ClaimRow {
    fn into_claim(self) -> Claim {
        Claim {
            id: ClaimId(self.id),
            work_unit_id: UnitId(self.work_unit_id),
            scope: self.scope,
            worker: WorkerIdentity {
                worker_id: self.worker_id,
                study_id: self.study_id,
                session_id: self.session_id,
            },
            created_at: self.created_at,
            completed: self.completed,
            completed_at: self.completed_at,
            result: self.result,
        }
    }
}
