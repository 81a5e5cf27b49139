//! Completion recorder and feedback against the in-memory store.

use crowdclaim::engine::{Engine, locate_claim};
use crowdclaim::model::{ClaimId, NewWorkUnit, WorkerIdentity};
use crowdclaim::outcome::FailureKind;
use crowdclaim::policy::{RetrySettings, SurveyPolicy};
use crowdclaim::retry::RetryPolicy;
use crowdclaim::store::{MemoryStore, Op};
use serde_json::json;
use std::sync::Arc;

async fn engine(capacity: u32) -> Engine<MemoryStore> {
    let policy = SurveyPolicy::new("aqa")
        .capacity(capacity)
        .retry(RetrySettings::immediate(4));
    let engine = Engine::new(Arc::new(MemoryStore::new()), policy).unwrap();
    engine
        .load_units(&[NewWorkUnit::new(json!({"question": "q1"}))])
        .await
        .unwrap();
    engine
}

fn worker(n: usize) -> WorkerIdentity {
    WorkerIdentity::new(format!("w{n}"), "study-9", format!("sess-{n}"))
}

#[tokio::test]
async fn completion_records_result_and_counts_once() {
    let engine = engine(3).await;
    let assignment = engine.assign(&worker(1), None).await.unwrap();

    let done = engine
        .complete(assignment.claim_id(), json!({"answer": "B"}))
        .await
        .unwrap();

    assert_eq!(done.finished_count, 1);
    assert!(done.claim.completed);
    assert!(done.claim.completed_at.is_some());
    assert_eq!(done.claim.result, Some(json!({"answer": "B"})));

    let tally = engine.tally().await.unwrap();
    assert_eq!(tally.claimed, 1);
    assert_eq!(tally.finished, 1);
    assert_eq!(tally.in_progress(), 0);
}

#[tokio::test]
async fn duplicate_submission_keeps_first_result() {
    let engine = engine(3).await;
    let id = engine.assign(&worker(1), None).await.unwrap().claim_id();

    engine.complete(id, json!({"answer": "A"})).await.unwrap();
    let failure = engine
        .complete(id, json!({"answer": "C"}))
        .await
        .unwrap_err();

    assert!(failure.is(FailureKind::AlreadyCompleted));
    let claims = engine.store().claims("aqa").unwrap();
    assert_eq!(claims[0].result, Some(json!({"answer": "A"})));
    assert_eq!(engine.tally().await.unwrap().finished, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_completions_increment_exactly_once() {
    let engine = engine(1).await;
    let id = engine.assign(&worker(1), None).await.unwrap().claim_id();

    let (a, b) = tokio::join!(
        {
            let engine = engine.clone();
            tokio::spawn(async move { engine.complete(id, json!({"n": 1})).await })
        },
        {
            let engine = engine.clone();
            tokio::spawn(async move { engine.complete(id, json!({"n": 2})).await })
        }
    );
    let outcomes = [a.unwrap(), b.unwrap()];

    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
    let failure = outcomes
        .iter()
        .find_map(|o| o.as_ref().err())
        .unwrap();
    assert!(failure.is(FailureKind::AlreadyCompleted));

    let unit = &engine.store().units("aqa").unwrap()[0];
    assert_eq!(unit.finished_count, 1);
    engine.store().check_invariants("aqa").unwrap();
}

#[tokio::test]
async fn unknown_claim_is_not_found() {
    let engine = engine(1).await;
    let failure = engine
        .complete(ClaimId::new(), json!({}))
        .await
        .unwrap_err();
    assert!(failure.is(FailureKind::ClaimNotFound));
}

#[tokio::test]
async fn transient_failure_is_retried_without_double_count() {
    let engine = engine(1).await;
    let id = engine.assign(&worker(1), None).await.unwrap().claim_id();
    engine.store().fail_call(Op::Complete, 1).unwrap();

    let done = engine.complete(id, json!({"ok": true})).await.unwrap();
    assert_eq!(done.finished_count, 1);
    assert_eq!(engine.store().calls(Op::Complete).unwrap(), 2);
}

#[tokio::test]
async fn persistent_failure_reports_retry_later() {
    let engine = engine(1).await;
    let id = engine.assign(&worker(1), None).await.unwrap().claim_id();
    for call in 1..=4 {
        engine.store().fail_call(Op::Complete, call).unwrap();
    }

    let failure = engine.complete(id, json!({})).await.unwrap_err();
    assert!(failure.is(FailureKind::RetryLater));

    // Nothing was written, so a later submission still lands.
    let done = engine.complete(id, json!({})).await.unwrap();
    assert_eq!(done.finished_count, 1);
}

#[tokio::test]
async fn counter_mismatch_is_internal_and_not_retried() {
    let engine = engine(1).await;
    let id = engine.assign(&worker(1), None).await.unwrap().claim_id();
    engine.store().break_counters(Op::Complete, 1).unwrap();

    let failure = engine.complete(id, json!({"answer": "A"})).await.unwrap_err();
    assert!(failure.is(FailureKind::Internal));
    assert_eq!(engine.store().calls(Op::Complete).unwrap(), 1);

    let unit = &engine.store().units("aqa").unwrap()[0];
    assert_eq!(unit.finished_count, 0);
    let claim = &engine.store().claims("aqa").unwrap()[0];
    assert!(!claim.completed);
    assert_eq!(claim.result, None);
    engine.store().check_invariants("aqa").unwrap();
}

#[tokio::test]
async fn locate_claim_finds_scope_for_known_claim() {
    let engine = engine(1).await;
    let id = engine.assign(&worker(1), None).await.unwrap().claim_id();
    engine.store().fail_call(Op::Lookup, 1).unwrap();

    let claim = locate_claim(engine.store(), id, &RetryPolicy::immediate(3))
        .await
        .unwrap();
    assert_eq!(claim.scope, "aqa");
    assert_eq!(engine.store().calls(Op::Lookup).unwrap(), 2);
}

#[tokio::test]
async fn locate_claim_classifies_store_errors() {
    let engine = engine(1).await;
    let retry = RetryPolicy::immediate(3);

    let failure = locate_claim(engine.store(), ClaimId::new(), &retry)
        .await
        .unwrap_err();
    assert!(failure.is(FailureKind::ClaimNotFound));

    let id = engine.assign(&worker(1), None).await.unwrap().claim_id();
    let before = engine.store().calls(Op::Lookup).unwrap();
    for call in before + 1..=before + 3 {
        engine.store().fail_call(Op::Lookup, call).unwrap();
    }
    let failure = locate_claim(engine.store(), id, &retry).await.unwrap_err();
    assert!(failure.is(FailureKind::RetryLater));

    engine.store().break_counters(Op::Lookup, before + 4).unwrap();
    let failure = locate_claim(engine.store(), id, &retry).await.unwrap_err();
    assert!(failure.is(FailureKind::Internal));
}

#[tokio::test]
async fn status_report_includes_in_progress() {
    let engine = engine(3).await;
    let first = engine.assign(&worker(1), None).await.unwrap().claim_id();
    engine.assign(&worker(2), None).await.unwrap();
    engine.complete(first, json!({})).await.unwrap();

    let tally = engine.tally().await.unwrap();
    let v = serde_json::to_value(tally.report()).unwrap();
    assert_eq!(v["scope"], "aqa");
    assert_eq!(v["claimed"], 2);
    assert_eq!(v["finished"], 1);
    assert_eq!(v["in_progress"], 1);
}

#[tokio::test]
async fn blank_feedback_is_ignored() {
    let engine = engine(1).await;
    let stored = engine.record_feedback(&worker(1), "   \n").await.unwrap();
    assert!(!stored);
    assert!(engine.store().feedback("aqa").unwrap().is_empty());
}

#[tokio::test]
async fn feedback_is_stored_trimmed() {
    let engine = engine(1).await;
    let stored = engine
        .record_feedback(&worker(1), "  clip 3 had no audio \n")
        .await
        .unwrap();
    assert!(stored);

    let feedback = engine.store().feedback("aqa").unwrap();
    assert_eq!(feedback.len(), 1);
    assert_eq!(feedback[0].body, "clip 3 had no audio");
    assert_eq!(feedback[0].worker, worker(1));
}
