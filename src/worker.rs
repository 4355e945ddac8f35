//! The runner process: drives HTTP requests for one slot of the workload.
//!
//! A worker owns `concurrency` driver fibers fed from a bounded token queue
//! (pre-filled and closed when the shard is request-bounded, open-ended when
//! it is deadline-bounded). Fibers send one [`RequestOutcome`] per attempt
//! over a rendezvous channel to the control loop, which is the only writer
//! to the rolling metric. The control loop publishes a report every
//! reporting interval and, when the per-invocation execution budget runs out
//! before the shard is done, hands the slot off to a fresh process with the
//! same runner-id (the self-fork).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, HOST, USER_AGENT};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::bus::ResultBus;
use crate::launcher::LaunchError;
use crate::metric::RollingMetric;
use crate::plan::RunnerSpec;
use crate::report::{RequestOutcome, RequestState};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("invalid header line: {0}")]
    Header(String),

    #[error("invalid HTTP method: {0}")]
    Method(String),
}

/// Starts a successor process for a slot whose execution budget ran out.
///
/// The Lambda backing self-invokes the function; the container backing
/// re-execs the runner binary. Tests capture the handoff spec.
#[async_trait]
pub trait Respawn: Send + Sync {
    async fn respawn(&self, spec: &RunnerSpec) -> Result<(), LaunchError>;
}

/// Per-request parameters resolved once at startup and shared by all fibers.
struct RequestPlan {
    method: reqwest::Method,
    url: String,
    host: String,
    body: String,
    headers: HeaderMap,
}

impl RequestPlan {
    fn from_spec(spec: &RunnerSpec) -> Result<Self, WorkerError> {
        let method = reqwest::Method::from_bytes(spec.method.as_bytes())
            .map_err(|_| WorkerError::Method(spec.method.clone()))?;
        let host = reqwest::Url::parse(&spec.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();

        let mut headers = HeaderMap::new();
        for line in &spec.headers {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| WorkerError::Header(line.clone()))?;
            let value: HeaderValue = value
                .trim()
                .parse()
                .map_err(|_| WorkerError::Header(line.clone()))?;
            let name = name.trim();
            // A user-supplied Host replaces the one derived from the URL
            // instead of being appended alongside it.
            if name.eq_ignore_ascii_case("host") {
                headers.insert(HOST, value);
            } else {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| WorkerError::Header(line.clone()))?;
                headers.insert(name, value);
            }
        }
        if !headers.contains_key(ACCEPT_ENCODING) {
            headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        }
        if !headers.contains_key(USER_AGENT) {
            headers.insert(
                USER_AGENT,
                HeaderValue::from_static(concat!("stampede/", env!("CARGO_PKG_VERSION"))),
            );
        }

        Ok(Self {
            method,
            url: spec.url.clone(),
            host,
            body: spec.body.clone(),
            headers,
        })
    }
}

/// Issues one request and classifies the outcome. Never fails: every error
/// becomes a counted outcome, because failure rates are the measurement.
async fn fetch(client: &reqwest::Client, plan: &RequestPlan, started: Instant) -> RequestOutcome {
    let begin = Instant::now();
    let mut outcome = RequestOutcome {
        start_offset: begin.duration_since(started).as_nanos() as i64,
        host: plan.host.clone(),
        method: plan.method.to_string(),
        status: 0,
        elapsed_first_byte: 0,
        elapsed_last_byte: 0,
        elapsed: 0,
        bytes: 0,
        timeout: false,
        connection_error: false,
        state: RequestState::ConnectionError,
    };

    let mut request = client
        .request(plan.method.clone(), &plan.url)
        .headers(plan.headers.clone());
    if !plan.body.is_empty() {
        request = request.body(plan.body.clone());
    }

    let mut response = match request.send().await {
        Ok(response) => response,
        Err(error) => {
            outcome.elapsed = begin.elapsed().as_nanos() as i64;
            if error.is_timeout() {
                outcome.timeout = true;
                outcome.state = RequestState::Timeout;
            } else {
                outcome.connection_error = true;
                outcome.state = RequestState::ConnectionError;
            }
            return outcome;
        }
    };

    outcome.status = response.status().as_u16();
    let mut first_byte_at = None;
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                first_byte_at.get_or_insert_with(Instant::now);
                outcome.bytes += chunk.len() as i64;
            }
            Ok(None) => break,
            Err(error) => {
                outcome.elapsed = begin.elapsed().as_nanos() as i64;
                if error.is_timeout() {
                    outcome.timeout = true;
                    outcome.state = RequestState::Timeout;
                } else {
                    outcome.connection_error = true;
                    outcome.state = RequestState::ReadError;
                }
                return outcome;
            }
        }
    }

    let done = Instant::now();
    outcome.elapsed_first_byte = first_byte_at
        .unwrap_or(done)
        .duration_since(begin)
        .as_nanos() as i64;
    outcome.elapsed_last_byte = done.duration_since(begin).as_nanos() as i64;
    outcome.elapsed = outcome.elapsed_last_byte;
    outcome.state = if response.status().is_redirection() {
        RequestState::Redirect
    } else {
        RequestState::Success
    };
    outcome
}

/// One driver fiber: claim a token (or run open-ended), attempt a request,
/// hand the outcome to the control loop, repeat.
async fn drive(
    client: reqwest::Client,
    plan: Arc<RequestPlan>,
    started: Instant,
    jobs: Option<Arc<Mutex<mpsc::Receiver<()>>>>,
    shutdown: watch::Receiver<bool>,
    outcomes: mpsc::Sender<RequestOutcome>,
) {
    loop {
        match &jobs {
            Some(queue) => {
                if queue.lock().await.recv().await.is_none() {
                    break;
                }
            }
            None => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
        let outcome = fetch(&client, &plan, started).await;
        if outcomes.send(outcome).await.is_err() {
            break;
        }
    }
}

pub struct LoadWorker {
    spec: RunnerSpec,
    bus: Arc<dyn ResultBus>,
    respawn: Box<dyn Respawn>,
    client: reqwest::Client,
    plan: Arc<RequestPlan>,
    metric: RollingMetric,
    completed: i64,
}

impl LoadWorker {
    /// Load tests routinely target staging hosts with self-signed
    /// certificates, so the client accepts invalid certs.
    pub fn new(
        spec: RunnerSpec,
        bus: Arc<dyn ResultBus>,
        respawn: Box<dyn Respawn>,
    ) -> Result<Self, WorkerError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(spec.timeout_secs.max(1)))
            .build()?;
        let plan = Arc::new(RequestPlan::from_spec(&spec)?);
        Ok(Self {
            spec,
            bus,
            respawn,
            client,
            plan,
            metric: RollingMetric::new(),
            completed: 0,
        })
    }

    /// Runs the shard to completion, a deadline, or a self-fork handoff.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        let started = Instant::now();
        let target = self.spec.remaining_requests();
        info!(
            runner_id = self.spec.runner_id,
            region = %self.spec.region,
            target = ?target,
            concurrency = self.spec.concurrency,
            "runner starting"
        );

        let (outcome_tx, mut outcome_rx) = mpsc::channel::<RequestOutcome>(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Request-bounded shards get a token queue that closes once the
        // budget has been dealt out; deadline-bounded shards run open-ended.
        let jobs = target.map(|budget| {
            let (token_tx, token_rx) = mpsc::channel::<()>(1024);
            tokio::spawn(async move {
                for _ in 0..budget {
                    if token_tx.send(()).await.is_err() {
                        break;
                    }
                }
            });
            Arc::new(Mutex::new(token_rx))
        });

        for _ in 0..self.spec.concurrency.max(1) {
            tokio::spawn(drive(
                self.client.clone(),
                Arc::clone(&self.plan),
                started,
                jobs.clone(),
                shutdown_rx.clone(),
                outcome_tx.clone(),
            ));
        }
        drop(outcome_tx);

        let interval = Duration::from_secs(self.spec.reporting_interval_secs.max(1));
        let mut ticker = time::interval_at(started + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let cap = time::sleep(Duration::from_secs(self.spec.execution_cap_secs));
        tokio::pin!(cap);
        let timelimit_secs = self.spec.timelimit_secs;
        let timelimit = async move {
            if timelimit_secs > 0 {
                time::sleep(Duration::from_secs(timelimit_secs)).await
            } else {
                std::future::pending::<()>().await
            }
        };
        tokio::pin!(timelimit);

        let mut finished = false;
        let mut cap_expired = false;
        loop {
            tokio::select! {
                outcome = outcome_rx.recv() => match outcome {
                    Some(outcome) => {
                        self.completed += 1;
                        debug!(
                            state = outcome.state.as_str(),
                            status = outcome.status,
                            "request done"
                        );
                        self.metric.record(&outcome);
                        let done = self.spec.previous_completed + self.completed;
                        if self.completed % 1000 == 0 {
                            info!(runner_id = self.spec.runner_id, completed = done, "progress");
                        }
                        if let Some(budget) = target {
                            if self.completed >= budget {
                                info!(
                                    runner_id = self.spec.runner_id,
                                    completed = done,
                                    "target reached"
                                );
                                finished = true;
                                break;
                            }
                        }
                    }
                    // Every fiber has exited and drained its queue.
                    None => {
                        finished = true;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if self.metric.has_results() {
                        self.publish(false).await;
                    }
                }
                _ = &mut timelimit => {
                    info!(runner_id = self.spec.runner_id, "timelimit reached");
                    finished = true;
                    break;
                }
                _ = &mut cap => {
                    cap_expired = true;
                    break;
                }
            }
        }
        let _ = shutdown_tx.send(true);

        if cap_expired && !finished {
            return self.hand_off(started.elapsed()).await;
        }
        self.publish(true).await;
        Ok(())
    }

    /// Execution budget ran out mid-shard: report what we have, then start a
    /// successor carrying the same runner-id and the remaining work.
    async fn hand_off(&mut self, elapsed: Duration) -> Result<(), WorkerError> {
        self.publish(false).await;

        let mut next = self.spec.clone();
        next.previous_completed += self.completed;
        if next.timelimit_secs > 0 {
            next.timelimit_secs = next.timelimit_secs.saturating_sub(elapsed.as_secs());
            if next.timelimit_secs == 0 {
                // The overall deadline expired during this invocation.
                self.publish(true).await;
                return Ok(());
            }
        }

        info!(
            runner_id = next.runner_id,
            previous_completed = next.previous_completed,
            remaining_timelimit = next.timelimit_secs,
            "execution budget exhausted, handing off"
        );
        if let Err(error) = self.respawn.respawn(&next).await {
            // Without a successor the slot would never finish; close it out.
            error!(error = %error, "respawn failed, finishing slot");
            self.publish(true).await;
        }
        Ok(())
    }

    async fn publish(&mut self, finished: bool) {
        let report = self
            .metric
            .drain(self.spec.runner_id, &self.spec.region, finished);
        if let Err(error) = self.bus.publish(&report).await {
            error!(error = %error, "failed to publish report; next window will correct");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::DEFAULT_EXECUTION_CAP_SECS;

    fn spec_with_headers(headers: &[&str]) -> RunnerSpec {
        RunnerSpec {
            runner_id: 0,
            region: "us-east-1".to_string(),
            requests: 1,
            concurrency: 1,
            timelimit_secs: 0,
            previous_completed: 0,
            execution_cap_secs: DEFAULT_EXECUTION_CAP_SECS,
            reporting_interval_secs: 1,
            queue_url: "memory".to_string(),
            queue_region: "us-east-1".to_string(),
            url: "http://example.com/path".to_string(),
            method: "GET".to_string(),
            body: String::new(),
            headers: headers.iter().map(|h| h.to_string()).collect(),
            timeout_secs: 15,
        }
    }

    #[test]
    fn plan_sets_default_headers() {
        let plan = RequestPlan::from_spec(&spec_with_headers(&[])).unwrap();
        assert_eq!(plan.headers.get(ACCEPT_ENCODING).unwrap(), "gzip");
        assert!(plan.headers.get(USER_AGENT).is_some());
        assert_eq!(plan.host, "example.com");
    }

    #[test]
    fn plan_keeps_user_headers() {
        let plan = RequestPlan::from_spec(&spec_with_headers(&[
            "Accept-Encoding: br",
            "User-Agent: tester/1.0",
            "X-Thing: 42",
        ]))
        .unwrap();
        assert_eq!(plan.headers.get(ACCEPT_ENCODING).unwrap(), "br");
        assert_eq!(plan.headers.get(USER_AGENT).unwrap(), "tester/1.0");
        assert_eq!(plan.headers.get("x-thing").unwrap(), "42");
    }

    #[test]
    fn host_header_overrides_url_host() {
        let plan =
            RequestPlan::from_spec(&spec_with_headers(&["Host: other.example.org"])).unwrap();
        assert_eq!(plan.headers.get(HOST).unwrap(), "other.example.org");
        assert_eq!(plan.headers.len(), 3); // host plus the two defaults
    }

    #[test]
    fn malformed_header_is_rejected() {
        assert!(matches!(
            RequestPlan::from_spec(&spec_with_headers(&["no colon here"])),
            Err(WorkerError::Header(_))
        ));
    }

    #[test]
    fn unknown_method_is_rejected() {
        let mut spec = spec_with_headers(&[]);
        spec.method = "GE T".to_string();
        assert!(matches!(
            RequestPlan::from_spec(&spec),
            Err(WorkerError::Method(_))
        ));
    }
}
