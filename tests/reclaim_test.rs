//! Reclaimer sweeps against the in-memory store.

use crowdclaim::engine::{Assignment, Engine};
use crowdclaim::model::{NewWorkUnit, WorkerIdentity};
use crowdclaim::outcome::FailureKind;
use crowdclaim::policy::{RetrySettings, SurveyPolicy};
use crowdclaim::store::{MemoryStore, Op};
use serde_json::json;
use std::sync::Arc;

fn stale() -> chrono::Duration {
    chrono::Duration::minutes(31)
}

async fn engine(capacity: u32, units: usize) -> Engine<MemoryStore> {
    let policy = SurveyPolicy::new("heval")
        .capacity(capacity)
        .reclaim_after_minutes(30)
        .retry(RetrySettings::immediate(5));
    let engine = Engine::new(Arc::new(MemoryStore::new()), policy).unwrap();
    let units: Vec<_> = (0..units)
        .map(|n| NewWorkUnit::new(json!({ "clip": n })))
        .collect();
    engine.load_units(&units).await.unwrap();
    engine
}

fn worker(n: usize) -> WorkerIdentity {
    WorkerIdentity::new(format!("w{n}"), "study-1", format!("sess-{n}"))
}

#[tokio::test]
async fn stale_claim_is_reclaimed_and_fresh_one_kept() {
    let engine = engine(3, 1).await;
    let old = engine.assign(&worker(1), None).await.unwrap();
    let fresh = engine.assign(&worker(2), None).await.unwrap();
    engine
        .store()
        .backdate_claim(old.claim_id(), stale())
        .unwrap();

    let report = engine.reclaim().await.unwrap();

    assert_eq!(report.reclaimed, 1);
    assert_eq!(report.skipped, 0);
    assert_eq!(report.attempts, 1);
    let unit = &engine.store().units("heval").unwrap()[0];
    assert_eq!(unit.claimed_count, 1);
    let claims = engine.store().claims("heval").unwrap();
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].id, fresh.claim_id());
}

#[tokio::test]
async fn sweep_survives_transient_failure_midway() {
    let engine = engine(1, 5).await;
    for n in 0..5 {
        let assignment = engine.assign(&worker(n), None).await.unwrap();
        engine
            .store()
            .backdate_claim(assignment.claim_id(), stale())
            .unwrap();
    }
    engine.store().fail_call(Op::Reclaim, 3).unwrap();

    let report = engine.reclaim().await.unwrap();

    assert_eq!(report.reclaimed, 5);
    assert_eq!(report.attempts, 2);
    // Two succeeded, one failed, then the three survivors on the retry.
    assert_eq!(engine.store().calls(Op::Reclaim).unwrap(), 6);
    for unit in engine.store().units("heval").unwrap() {
        assert_eq!(unit.claimed_count, 0);
    }
    engine.store().check_invariants("heval").unwrap();
}

#[tokio::test]
async fn completed_claims_are_never_reclaimed() {
    let engine = engine(1, 1).await;
    let id = engine.assign(&worker(1), None).await.unwrap().claim_id();
    engine.complete(id, json!({"label": "fake"})).await.unwrap();
    engine.store().backdate_claim(id, stale()).unwrap();

    let report = engine.reclaim().await.unwrap();

    assert_eq!(report.reclaimed, 0);
    let unit = &engine.store().units("heval").unwrap()[0];
    assert_eq!(unit.claimed_count, 1);
    assert_eq!(unit.finished_count, 1);
}

#[tokio::test]
async fn reclaimed_identity_gets_a_new_claim() {
    let engine = engine(1, 1).await;
    let w = worker(1);
    let first = engine.assign(&w, None).await.unwrap();
    engine
        .store()
        .backdate_claim(first.claim_id(), stale())
        .unwrap();
    engine.reclaim().await.unwrap();

    let failure = engine
        .complete(first.claim_id(), json!({}))
        .await
        .unwrap_err();
    assert!(failure.is(FailureKind::ClaimNotFound));

    let second = engine.assign(&w, None).await.unwrap();
    assert!(matches!(second, Assignment::Created(_)));
    assert_ne!(second.claim_id(), first.claim_id());
}

#[tokio::test]
async fn empty_sweep_reports_zero() {
    let engine = engine(1, 2).await;
    engine.assign(&worker(1), None).await.unwrap();

    let report = engine.reclaim().await.unwrap();
    assert_eq!(report.reclaimed, 0);
    assert_eq!(report.attempts, 1);
    assert_eq!(engine.tally().await.unwrap().claimed, 1);
}

#[tokio::test]
async fn counter_mismatch_fails_the_sweep_without_retry() {
    let engine = engine(1, 2).await;
    for n in 0..2 {
        let id = engine.assign(&worker(n), None).await.unwrap().claim_id();
        engine.store().backdate_claim(id, stale()).unwrap();
    }
    engine.store().break_counters(Op::Reclaim, 1).unwrap();

    let failure = engine.reclaim().await.unwrap_err();
    assert!(failure.is(FailureKind::Internal));
    assert_eq!(engine.store().calls(Op::Reclaim).unwrap(), 1);
    assert_eq!(engine.store().claims("heval").unwrap().len(), 2);
    for unit in engine.store().units("heval").unwrap() {
        assert_eq!(unit.claimed_count, 1);
    }
    engine.store().check_invariants("heval").unwrap();
}

#[tokio::test]
async fn persistent_failure_fails_the_sweep() {
    let engine = engine(1, 1).await;
    let id = engine.assign(&worker(1), None).await.unwrap().claim_id();
    engine.store().backdate_claim(id, stale()).unwrap();
    for call in 1..=5 {
        engine.store().fail_call(Op::Reclaim, call).unwrap();
    }

    let failure = engine.reclaim().await.unwrap_err();
    assert!(failure.is(FailureKind::RetryLater));
    assert_eq!(engine.tally().await.unwrap().claimed, 1);
    engine.store().check_invariants("heval").unwrap();
}
