//! Interruption and crash recovery

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{build_engine, fast_config, seed, FixedResolver, PDF_BODY};
use pubcrawl::crawler::{RunLimits, ShutdownSignal, StopReason};
use pubcrawl::models::{FailureReason, TaskStatus};
use pubcrawl::storage::{open_ledger, CrawlLedger};

async fn pdf_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/pdf")
                .set_body_bytes(PDF_BODY.to_vec()),
        )
        .mount(&server)
        .await;
    server
}

fn resolver_for(server: &MockServer, ids: &[&str]) -> FixedResolver {
    ids.iter().fold(FixedResolver::new(), |r, id| {
        r.with(id, &[format!("{}/{id}.pdf", server.uri())])
    })
}

#[tokio::test]
async fn test_shutdown_leaves_waiting_task_pending() {
    let server = pdf_server().await;
    let dir = TempDir::new().unwrap();
    let ledger_path = dir.path().join("ledger.db");

    {
        let ledger = open_ledger(&ledger_path).unwrap();
        ledger.seed(&[seed("first"), seed("second")]).unwrap();

        // Second request to the host would wait 30s in the throttle
        let mut slow = fast_config();
        slow.throttle.min_delay_ms = 30_000;
        slow.throttle.max_delay_ms = 60_000;

        let shutdown = ShutdownSignal::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.trigger();
        });

        let summary = build_engine(
            &slow,
            Arc::clone(&ledger),
            resolver_for(&server, &["first", "second"]),
        )
        .run(RunLimits::default(), shutdown)
        .await
        .unwrap();

        assert_eq!(summary.stop_reason, StopReason::Shutdown);
        assert_eq!(summary.done, 1);
        assert_eq!(summary.requeued, 1);

        let waiting = ledger.list_by_status(TaskStatus::Pending, None).unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].last_error, Some(FailureReason::Interrupted));
        assert_eq!(waiting[0].attempts, 0);
        assert_eq!(ledger.stats().unwrap().in_progress, 0);
    }

    // Restart on the same dataset
    let ledger = open_ledger(&ledger_path).unwrap();
    let summary = build_engine(
        &fast_config(),
        Arc::clone(&ledger),
        resolver_for(&server, &["first", "second"]),
    )
    .run(RunLimits::default(), ShutdownSignal::new())
    .await
    .unwrap();

    assert_eq!(summary.processed, 1, "only the interrupted task is revisited");
    assert_eq!(summary.stop_reason, StopReason::Exhausted);
    assert_eq!(ledger.stats().unwrap().done, 2);
}

#[tokio::test]
async fn test_crashed_claim_is_requeued_and_completed() {
    let server = pdf_server().await;
    let dir = TempDir::new().unwrap();
    let ledger_path = dir.path().join("ledger.db");

    {
        let ledger = open_ledger(&ledger_path).unwrap();
        ledger.seed(&[seed("orphan")]).unwrap();
        ledger.next_pending("dead-worker").unwrap().unwrap();
    }

    let ledger = open_ledger(&ledger_path).unwrap();
    assert_eq!(ledger.stats().unwrap().in_progress, 1);

    let mut config = fast_config();
    config.crawler.stale_after_secs = 0;
    let summary = build_engine(&config, Arc::clone(&ledger), resolver_for(&server, &["orphan"]))
        .run(RunLimits::default(), ShutdownSignal::new())
        .await
        .unwrap();

    assert_eq!(summary.requeued_stale, 1);
    let task = ledger.get("orphan").unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    assert!(task.claimed_by.is_none());
}

#[tokio::test]
async fn test_fresh_claims_are_not_stolen() {
    let server = pdf_server().await;
    let dir = TempDir::new().unwrap();
    let ledger = open_ledger(dir.path().join("ledger.db")).unwrap();
    ledger.seed(&[seed("busy"), seed("free")]).unwrap();

    // Another process holds one of the two tasks
    let held = ledger.next_pending("other-process").unwrap().unwrap();

    let summary = build_engine(
        &fast_config(),
        Arc::clone(&ledger),
        resolver_for(&server, &["busy", "free"]),
    )
    .run(RunLimits::default(), ShutdownSignal::new())
    .await
    .unwrap();

    assert_eq!(summary.requeued_stale, 0);
    assert_eq!(summary.done, 1);
    let task = ledger.get(&held.identifier).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.claimed_by.as_deref(), Some("other-process"));
}

#[tokio::test]
async fn test_deadline_stops_claiming() {
    let server = pdf_server().await;
    let ids = ["a", "b", "c"];
    let dir = TempDir::new().unwrap();
    let ledger = open_ledger(dir.path().join("ledger.db")).unwrap();
    ledger
        .seed(&ids.iter().map(|id| seed(id)).collect::<Vec<_>>())
        .unwrap();

    let mut config = fast_config();
    config.throttle.min_delay_ms = 400;
    config.throttle.max_delay_ms = 400;
    let summary = build_engine(&config, Arc::clone(&ledger), resolver_for(&server, &ids))
        .run(
            RunLimits {
                max_duration: Some(Duration::from_millis(200)),
                max_articles: None,
            },
            ShutdownSignal::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.stop_reason, StopReason::Deadline);
    assert!(summary.processed < 3);
    assert!(ledger.stats().unwrap().pending >= 1);
}
