//! End-to-end runner tests: a real worker driving a mock HTTP server,
//! reporting through the in-memory bus.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use stampede::bus::{MemoryBus, ResultBus};
use stampede::launcher::LaunchError;
use stampede::plan::RunnerSpec;
use stampede::report::RunnerReport;
use stampede::worker::{LoadWorker, Respawn};

/// Captures handoff specs instead of starting processes.
#[derive(Default)]
struct RecordingRespawn {
    specs: Arc<Mutex<Vec<RunnerSpec>>>,
}

#[async_trait]
impl Respawn for RecordingRespawn {
    async fn respawn(&self, spec: &RunnerSpec) -> Result<(), LaunchError> {
        self.specs.lock().await.push(spec.clone());
        Ok(())
    }
}

fn spec(url: &str, requests: i64, concurrency: i64) -> RunnerSpec {
    RunnerSpec {
        runner_id: 0,
        region: "us-east-1".to_string(),
        requests,
        concurrency,
        timelimit_secs: 0,
        previous_completed: 0,
        execution_cap_secs: 60,
        reporting_interval_secs: 60,
        queue_url: "memory".to_string(),
        queue_region: "us-east-1".to_string(),
        url: url.to_string(),
        method: "GET".to_string(),
        body: String::new(),
        headers: Vec::new(),
        timeout_secs: 1,
    }
}

async fn drain_bus(bus: &MemoryBus) -> Vec<RunnerReport> {
    let mut reports = Vec::new();
    loop {
        let batch = bus.receive().await.unwrap();
        if batch.is_empty() {
            return reports;
        }
        reports.extend(batch);
    }
}

async fn run_worker(spec: RunnerSpec, bus: Arc<MemoryBus>) {
    let worker = LoadWorker::new(spec, bus, Box::new(RecordingRespawn::default())).unwrap();
    worker.run().await.unwrap();
}

#[tokio::test]
async fn single_request_reports_one_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
        .mount(&server)
        .await;

    let bus = Arc::new(MemoryBus::new());
    run_worker(spec(&format!("{}/ok", server.uri()), 1, 1), bus.clone()).await;

    let reports = drain_bus(&bus).await;
    let last = reports.last().unwrap();
    assert!(last.finished);

    let total: i64 = reports.iter().map(|r| r.request_count).sum();
    assert_eq!(total, 1);
    let ok: i64 = reports
        .iter()
        .filter_map(|r| r.statuses.get("200"))
        .sum();
    assert_eq!(ok, 1);
    assert!(reports.iter().all(|r| r.fatal_error.is_empty()));
}

#[tokio::test]
async fn shard_completes_its_full_request_budget() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("payload"))
        .mount(&server)
        .await;

    let bus = Arc::new(MemoryBus::new());
    run_worker(spec(&server.uri(), 50, 5), bus.clone()).await;

    let reports = drain_bus(&bus).await;
    assert!(reports.last().unwrap().finished);
    let total: i64 = reports.iter().map(|r| r.request_count).sum();
    assert_eq!(total, 50);
    let ok: i64 = reports
        .iter()
        .filter_map(|r| r.statuses.get("200"))
        .sum();
    assert_eq!(ok, 50);
    let bytes: i64 = reports.iter().map(|r| r.bytes_read).sum();
    assert_eq!(bytes, 50 * "payload".len() as i64);
}

// A 503 for every request is still a served response: it lands in the
// status histogram, not in the error counters.
#[tokio::test]
async fn server_errors_count_as_responses_not_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let bus = Arc::new(MemoryBus::new());
    run_worker(spec(&server.uri(), 10, 2), bus.clone()).await;

    let reports = drain_bus(&bus).await;
    let unavailable: i64 = reports
        .iter()
        .filter_map(|r| r.statuses.get("503"))
        .sum();
    assert_eq!(unavailable, 10);
    assert_eq!(reports.iter().map(|r| r.timed_out).sum::<i64>(), 0);
    assert_eq!(reports.iter().map(|r| r.connection_errors).sum::<i64>(), 0);
    assert!(reports.iter().all(|r| r.fatal_error.is_empty()));
}

#[tokio::test]
async fn refused_connections_latch_the_fatal_error() {
    // Port 1 refuses immediately on any sane test host.
    let bus = Arc::new(MemoryBus::new());
    run_worker(spec("http://127.0.0.1:1/", 10, 2), bus.clone()).await;

    let reports = drain_bus(&bus).await;
    let errors: i64 = reports.iter().map(|r| r.connection_errors).sum();
    assert_eq!(errors, 10);
    assert!(reports.iter().all(|r| r.statuses.is_empty()));
    assert!(reports
        .iter()
        .any(|r| r.fatal_error == "Over 50% of requests failed, aborting"));
    assert!(reports.last().unwrap().finished);
}

#[tokio::test]
async fn deadline_driven_worker_finishes_at_the_timelimit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut spec = spec(&server.uri(), 0, 2);
    spec.timelimit_secs = 1;
    spec.reporting_interval_secs = 1;

    let bus = Arc::new(MemoryBus::new());
    run_worker(spec, bus.clone()).await;

    let reports = drain_bus(&bus).await;
    assert!(reports.last().unwrap().finished);
    assert!(reports.iter().map(|r| r.request_count).sum::<i64>() > 0);
}

#[tokio::test]
async fn execution_cap_hands_the_slot_off_with_the_same_runner_id() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(400)))
        .mount(&server)
        .await;

    let mut spec = spec(&server.uri(), 50, 1);
    spec.runner_id = 4;
    spec.timelimit_secs = 30;
    spec.execution_cap_secs = 1;
    spec.timeout_secs = 5;

    let bus = Arc::new(MemoryBus::new());
    let respawn = RecordingRespawn::default();
    let handoffs = respawn.specs.clone();
    let worker = LoadWorker::new(spec, bus.clone(), Box::new(respawn)).unwrap();
    worker.run().await.unwrap();

    let handoffs = handoffs.lock().await;
    assert_eq!(handoffs.len(), 1, "expected exactly one handoff");
    let next = &handoffs[0];
    assert_eq!(next.runner_id, 4);
    assert_eq!(next.requests, 50);
    assert!(next.previous_completed > 0 && next.previous_completed < 50);
    assert!(next.timelimit_secs < 30 && next.timelimit_secs > 0);

    // The handoff publishes a non-final report covering the work so far.
    let reports = drain_bus(&bus).await;
    let last = reports.last().unwrap();
    assert!(!last.finished);
    let total: i64 = reports.iter().map(|r| r.request_count).sum();
    assert_eq!(total, next.previous_completed);
}

#[tokio::test]
async fn forked_worker_only_issues_the_remaining_requests() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut spec = spec(&server.uri(), 20, 2);
    spec.previous_completed = 15;

    let bus = Arc::new(MemoryBus::new());
    run_worker(spec, bus.clone()).await;

    let reports = drain_bus(&bus).await;
    assert!(reports.last().unwrap().finished);
    assert_eq!(reports.iter().map(|r| r.request_count).sum::<i64>(), 5);
}
