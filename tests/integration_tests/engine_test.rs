//! Crawl engine scenario tests
//!
//! Each test seeds an in-memory ledger, points a fixed resolver at a mock
//! server and checks the recorded task states after a run.

use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::{build_engine, fast_config, seed, FixedResolver, ARTICLE_HTML, PDF_BODY};
use pubcrawl::crawler::{RunLimits, ShutdownSignal, StopReason};
use pubcrawl::models::{ChallengeType, FailureReason, FileRole, TaskStatus};
use pubcrawl::storage::{CrawlLedger, FileStore, SharedLedger, SqliteLedger};

fn memory_ledger(ids: &[&str]) -> SharedLedger {
    let ledger = SqliteLedger::in_memory().unwrap();
    ledger
        .seed(&ids.iter().map(|id| seed(id)).collect::<Vec<_>>())
        .unwrap();
    Arc::new(ledger)
}

fn pdf() -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "application/pdf")
        .set_body_bytes(PDF_BODY.to_vec())
}

#[tokio::test]
async fn test_done_skipped_and_fallback_candidate() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/u1"))
        .respond_with(pdf())
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/u2"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/u3"))
        .respond_with(pdf())
        .expect(1)
        .mount(&server)
        .await;

    let url = |p: &str| format!("{}/{p}", server.uri());
    let resolver = FixedResolver::new()
        .with("A", &[url("u1")])
        .with("B", &[])
        .with("C", &[url("u2"), url("u3")]);

    let ledger = memory_ledger(&["A", "B", "C"]);
    let engine = build_engine(&fast_config(), Arc::clone(&ledger), resolver);
    let summary = engine
        .run(RunLimits::default(), ShutdownSignal::new())
        .await
        .unwrap();

    assert_eq!(summary.stop_reason, StopReason::Exhausted);
    assert_eq!(summary.done, 2);
    assert_eq!(summary.skipped, 1);

    let a = ledger.get("A").unwrap().unwrap();
    assert_eq!(a.status, TaskStatus::Done);
    assert_eq!(a.files.len(), 1);
    assert_eq!(a.files[0].role, FileRole::Main);

    let b = ledger.get("B").unwrap().unwrap();
    assert_eq!(b.status, TaskStatus::Skipped);
    assert_eq!(b.last_error, Some(FailureReason::ResolutionEmpty));

    let c = ledger.get("C").unwrap().unwrap();
    assert_eq!(c.status, TaskStatus::Done);
    assert_eq!(c.files.len(), 1);
    assert_eq!(c.files[0].url, url("u3"));
    assert_eq!(c.failures.len(), 1);
    assert_eq!(c.failures[0].url, url("u2"));
    assert_eq!(c.failures[0].reason, FailureReason::HttpStatus(500));
    assert_eq!(c.attempts, 3);
}

#[tokio::test]
async fn test_rate_limited_host_enters_cooldown() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/t\d$"))
        .respond_with(ResponseTemplate::new(429))
        .expect(5)
        .mount(&server)
        .await;

    let ids = ["T0", "T1", "T2", "T3", "T4", "T5"];
    let resolver = ids.iter().enumerate().fold(FixedResolver::new(), |r, (i, id)| {
        r.with(id, &[format!("{}/t{i}", server.uri())])
    });

    let mut config = fast_config();
    config.throttle.cooldown_threshold = 5;
    let ledger = memory_ledger(&ids);
    let engine = build_engine(&config, Arc::clone(&ledger), resolver);
    engine
        .run(RunLimits::default(), ShutdownSignal::new())
        .await
        .unwrap();

    let failed = ledger.list_by_status(TaskStatus::Failed, None).unwrap();
    assert_eq!(failed.len(), 6);

    let rate_limited = failed
        .iter()
        .filter(|t| t.last_error == Some(FailureReason::BotChallenge(ChallengeType::TooManyRequests)))
        .count();
    assert_eq!(rate_limited, 5);

    let cooled: Vec<_> = failed
        .iter()
        .filter(|t| t.last_error == Some(FailureReason::HostCoolingDown))
        .collect();
    assert_eq!(cooled.len(), 1);
    assert_eq!(cooled[0].attempts, 0, "no network call for the quarantined host");
}

#[tokio::test]
async fn test_supplemental_only_is_no_fulltext() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/suppl/table1.csv"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/csv")
                .set_body_string("gene,count\nYFG1,3\n"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/missing.pdf"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let resolver = FixedResolver::new().with(
        "S",
        &[
            format!("{}/suppl/table1.csv", server.uri()),
            format!("{}/missing.pdf", server.uri()),
        ],
    );
    let ledger = memory_ledger(&["S"]);
    build_engine(&fast_config(), Arc::clone(&ledger), resolver)
        .run(RunLimits::default(), ShutdownSignal::new())
        .await
        .unwrap();

    let task = ledger.get("S").unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.last_error, Some(FailureReason::NoFulltext));
    assert_eq!(task.files.len(), 1);
    assert_eq!(task.files[0].role, FileRole::Supplemental);
}

#[tokio::test]
async fn test_retryable_failure_returns_task_to_queue() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let mut config = fast_config();
    config.crawler.max_fetch_attempts = 4;
    let resolver = FixedResolver::new().with("R", &[format!("{}/r.pdf", server.uri())]);
    let ledger = memory_ledger(&["R"]);

    let summary = build_engine(&config, Arc::clone(&ledger), resolver)
        .run(RunLimits::default(), ShutdownSignal::new())
        .await
        .unwrap();

    // Two claims of two attempts each exhaust the budget
    let task = ledger.get("R").unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 4);
    assert_eq!(task.last_error, Some(FailureReason::HttpStatus(502)));
    assert_eq!(task.failures.len(), 2);
    assert_eq!(summary.requeued, 1);
}

#[tokio::test]
async fn test_fetch_budget_caps_attempts_within_a_claim() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502))
        .expect(3)
        .mount(&server)
        .await;

    let mut config = fast_config();
    config.crawler.max_fetch_attempts = 3;
    let resolver = FixedResolver::new().with("R", &[format!("{}/r.pdf", server.uri())]);
    let ledger = memory_ledger(&["R"]);

    build_engine(&config, Arc::clone(&ledger), resolver)
        .run(RunLimits::default(), ShutdownSignal::new())
        .await
        .unwrap();

    // Second claim has one attempt left, not a full strategy round
    let task = ledger.get("R").unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 3);
    assert_eq!(task.last_error, Some(FailureReason::HttpStatus(502)));
}

#[tokio::test]
async fn test_articles_sharing_a_dynamic_url() {
    let server = MockServer::start().await;
    let mut variant = PDF_BODY.to_vec();
    variant.extend_from_slice(b"\n% render 1");
    Mock::given(method("GET"))
        .and(path("/shared.pdf"))
        .respond_with(pdf().set_delay(std::time::Duration::from_millis(200)))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/shared.pdf"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/pdf")
                .set_body_bytes(variant),
        )
        .expect(0)
        .mount(&server)
        .await;

    let shared = format!("{}/shared.pdf", server.uri());
    let resolver = FixedResolver::new()
        .with("S1", &[shared.clone()])
        .with("S2", &[shared]);

    let mut config = fast_config();
    config.crawler.workers = 2;
    let ledger = memory_ledger(&["S1", "S2"]);
    let summary = build_engine(&config, Arc::clone(&ledger), resolver)
        .run(RunLimits::default(), ShutdownSignal::new())
        .await
        .unwrap();

    assert_eq!(summary.stop_reason, StopReason::Exhausted);
    assert_eq!(summary.done, 2);
    let s1 = ledger.get("S1").unwrap().unwrap();
    let s2 = ledger.get("S2").unwrap().unwrap();
    assert_eq!(s1.files[0].content_hash, s2.files[0].content_hash);
}

#[tokio::test]
async fn test_html_landing_page_kept_as_unknown() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/landing"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_string("<html><head><title>Redirect</title></head><body>See PDF</body></html>"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/article"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html; charset=utf-8")
                .set_body_string(ARTICLE_HTML),
        )
        .mount(&server)
        .await;

    let resolver = FixedResolver::new()
        .with("U", &[format!("{}/landing", server.uri())])
        .with("M", &[format!("{}/landing", server.uri()), format!("{}/article", server.uri())]);
    let ledger = memory_ledger(&["U", "M"]);
    build_engine(&fast_config(), Arc::clone(&ledger), resolver)
        .run(RunLimits::default(), ShutdownSignal::new())
        .await
        .unwrap();

    let unknown = ledger.get("U").unwrap().unwrap();
    assert_eq!(unknown.status, TaskStatus::Done);
    assert_eq!(unknown.files[0].role, FileRole::Unknown);

    let main = ledger.get("M").unwrap().unwrap();
    assert_eq!(main.status, TaskStatus::Done);
    assert_eq!(main.files.len(), 1);
    assert_eq!(main.files[0].role, FileRole::Main);
}

#[tokio::test]
async fn test_article_limit_stops_claiming() {
    let server = MockServer::start().await;
    Mock::given(method("GET")).respond_with(pdf()).mount(&server).await;

    let ids = ["A", "B", "C"];
    let resolver = ids.iter().fold(FixedResolver::new(), |r, id| {
        r.with(id, &[format!("{}/{id}.pdf", server.uri())])
    });
    let ledger = memory_ledger(&ids);

    let summary = build_engine(&fast_config(), Arc::clone(&ledger), resolver)
        .run(
            RunLimits {
                max_articles: Some(2),
                max_duration: None,
            },
            ShutdownSignal::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.stop_reason, StopReason::ArticleLimit);
    assert_eq!(summary.processed, 2);
    let counts = ledger.stats().unwrap();
    assert_eq!(counts.done, 2);
    assert_eq!(counts.pending, 1);
}

#[tokio::test]
async fn test_files_written_to_dataset() {
    let server = MockServer::start().await;
    Mock::given(method("GET")).respond_with(pdf()).mount(&server).await;

    let dir = TempDir::new().unwrap();
    let files = FileStore::new(&dir.path().join("files")).unwrap();
    let resolver = FixedResolver::new().with("10.1000/xyz", &[format!("{}/xyz.pdf", server.uri())]);
    let ledger = memory_ledger(&["10.1000/xyz"]);

    build_engine(&fast_config(), Arc::clone(&ledger), resolver)
        .with_file_store(files)
        .run(RunLimits::default(), ShutdownSignal::new())
        .await
        .unwrap();

    let task = ledger.get("10.1000/xyz").unwrap().unwrap();
    let stored = task.files[0].path.as_ref().expect("file path recorded");
    assert!(stored.starts_with(dir.path()));
    assert_eq!(std::fs::read(stored).unwrap(), PDF_BODY);
    assert_eq!(task.files[0].mime_type, "application/pdf");
}

#[tokio::test]
async fn test_multiple_workers_drain_ledger() {
    let server = MockServer::start().await;
    Mock::given(method("GET")).respond_with(pdf()).mount(&server).await;

    let ids: Vec<String> = (0..12).map(|i| format!("art{i}")).collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let resolver = ids.iter().fold(FixedResolver::new(), |r, id| {
        r.with(id, &[format!("{}/{id}.pdf", server.uri())])
    });

    let mut config = fast_config();
    config.crawler.workers = 4;
    let ledger = memory_ledger(&id_refs);
    let summary = build_engine(&config, Arc::clone(&ledger), resolver)
        .run(RunLimits::default(), ShutdownSignal::new())
        .await
        .unwrap();

    assert_eq!(summary.done, 12);
    assert_eq!(ledger.stats().unwrap().done, 12);
}
