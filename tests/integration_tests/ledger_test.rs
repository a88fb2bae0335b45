//! Ledger durability tests against on-disk databases

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use crate::common::seed;
use pubcrawl::models::{FailureReason, TaskStatus};
use pubcrawl::storage::{CrawlLedger, SqliteLedger, TaskOutcome};

#[test]
fn test_resume_never_reprocesses_terminal_tasks() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ledger.db");
    let seeds = vec![seed("A"), seed("B"), seed("C")];

    {
        let ledger = SqliteLedger::open(&path).unwrap();
        assert_eq!(ledger.seed(&seeds).unwrap(), 3);

        let first = ledger.next_pending("w0").unwrap().unwrap();
        ledger
            .record_outcome(&first.identifier, "w0", &TaskOutcome::done(Vec::new()))
            .unwrap();
        let second = ledger.next_pending("w0").unwrap().unwrap();
        ledger
            .record_outcome(
                &second.identifier,
                "w0",
                &TaskOutcome::failed(FailureReason::HttpStatus(404)),
            )
            .unwrap();
    }

    // Restart: reopen and reseed the same input
    let ledger = SqliteLedger::open(&path).unwrap();
    assert_eq!(ledger.seed(&seeds).unwrap(), 0);

    let remaining = ledger.next_pending("w1").unwrap().unwrap();
    let terminal: HashSet<String> = ledger
        .list_by_status(TaskStatus::Done, None)
        .unwrap()
        .into_iter()
        .chain(ledger.list_by_status(TaskStatus::Failed, None).unwrap())
        .map(|t| t.identifier)
        .collect();

    assert_eq!(terminal.len(), 2);
    assert!(!terminal.contains(&remaining.identifier));
    assert!(ledger.next_pending("w1").unwrap().is_none());
}

#[test]
fn test_stale_claims_requeued_exactly_once() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ledger.db");

    {
        let ledger = SqliteLedger::open(&path).unwrap();
        ledger.seed(&[seed("A"), seed("B")]).unwrap();
        ledger.next_pending("crashed-worker").unwrap().unwrap();
        // Process dies here without recording an outcome
    }

    let ledger = SqliteLedger::open(&path).unwrap();
    assert_eq!(ledger.stats().unwrap().in_progress, 1);

    assert_eq!(ledger.requeue_stale(Duration::ZERO).unwrap(), 1);
    assert_eq!(ledger.requeue_stale(Duration::ZERO).unwrap(), 0);

    let counts = ledger.stats().unwrap();
    assert_eq!(counts.pending, 2);
    assert_eq!(counts.in_progress, 0);
}

#[test]
fn test_fresh_claims_survive_requeue() {
    let ledger = SqliteLedger::in_memory().unwrap();
    ledger.seed(&[seed("A")]).unwrap();
    ledger.next_pending("w0").unwrap().unwrap();

    assert_eq!(ledger.requeue_stale(Duration::from_secs(3600)).unwrap(), 0);
    assert_eq!(ledger.stats().unwrap().in_progress, 1);
}

#[test]
fn test_concurrent_claims_are_exclusive() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ledger.db");
    let ids: Vec<String> = (0..40).map(|i| format!("10.1000/art{i}")).collect();

    SqliteLedger::open(&path)
        .unwrap()
        .seed(&ids.iter().map(|id| seed(id)).collect::<Vec<_>>())
        .unwrap();

    // Separate connections contend through SQLite itself
    let handles: Vec<_> = (0..4)
        .map(|w| {
            let path = path.clone();
            std::thread::spawn(move || {
                let ledger = Arc::new(SqliteLedger::open(&path).unwrap());
                let mut claimed = Vec::new();
                while let Some(task) = ledger.next_pending(&format!("w{w}")).unwrap() {
                    claimed.push(task.identifier);
                }
                claimed
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap());
    }

    let unique: HashSet<_> = all.iter().cloned().collect();
    assert_eq!(all.len(), ids.len(), "every task claimed exactly once");
    assert_eq!(unique.len(), ids.len());
}

#[test]
fn test_failure_history_accumulates_across_runs() {
    let ledger = SqliteLedger::in_memory().unwrap();
    ledger.seed(&[seed("A")]).unwrap();

    for _ in 0..2 {
        let task = ledger.next_pending("w0").unwrap().unwrap();
        let outcome = TaskOutcome::pending(Some(FailureReason::Timeout))
            .with_failures(vec![pubcrawl::models::CandidateFailure {
                url: "https://x.org/a".to_string(),
                reason: FailureReason::Timeout,
                strategy: Some("direct".to_string()),
            }])
            .with_attempts(2);
        ledger.record_outcome(&task.identifier, "w0", &outcome).unwrap();
    }

    let task = ledger.get("A").unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempts, 4);
    assert_eq!(task.failures.len(), 2);
    assert_eq!(task.last_error, Some(FailureReason::Timeout));
}

#[test]
fn test_requeued_claim_cannot_be_recorded_by_old_owner() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ledger.db");

    let first_process = SqliteLedger::open(&path).unwrap();
    first_process.seed(&[seed("A")]).unwrap();
    first_process.next_pending("p1").unwrap().unwrap();

    // A second process treats the claim as stale and takes it over
    let second_process = SqliteLedger::open(&path).unwrap();
    assert_eq!(second_process.requeue_stale(Duration::ZERO).unwrap(), 1);
    second_process.next_pending("p2").unwrap().unwrap();

    let err = first_process
        .record_outcome("A", "p1", &TaskOutcome::done(Vec::new()))
        .unwrap_err();
    assert!(err.is_lost_claim());

    second_process
        .record_outcome("A", "p2", &TaskOutcome::failed(FailureReason::HttpStatus(404)))
        .unwrap();
    let task = first_process.get("A").unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.claimed_by.is_none());
}
