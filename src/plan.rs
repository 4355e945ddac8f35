//! Workload planning: one user-supplied workload in, N runner specs out.
//!
//! The planner is a pure function. It picks the fleet size from the
//! concurrency brackets, deals regions out round-robin, shards the request
//! and concurrency budgets with remainders on the last runner, and derives
//! the reporting interval so that report traffic grows sub-linearly with
//! fleet size.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hard cap on total requests per test.
pub const MAX_REQUEST_COUNT: i64 = i32::MAX as i64;

/// Per-invocation execution budget under the managed-function backing.
/// Other backings may override it on the [`RunnerSpec`].
pub const DEFAULT_EXECUTION_CAP_SECS: u64 = 295;

/// Regions the managed backing can place runners in.
pub const SUPPORTED_REGIONS: &[&str] = &[
    "us-east-1",      // N. Virginia
    "us-east-2",      // Ohio
    "us-west-1",      // N. California
    "us-west-2",      // Oregon
    "eu-west-1",      // Ireland
    "eu-central-1",   // Frankfurt
    "ap-northeast-1", // Tokyo
    "ap-northeast-2", // Seoul
    "ap-southeast-1", // Singapore
    "ap-southeast-2", // Sydney
    "sa-east-1",      // Sao Paulo
];

#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
    #[error("Invalid concurrency (use 1 - {0})")]
    InvalidConcurrency(i64),

    #[error("Invalid total requests (use 1 - {MAX_REQUEST_COUNT})")]
    InvalidRequestCount,

    #[error("Invalid maximum execution time in seconds (use 0 - 3600)")]
    InvalidTimelimit,

    #[error("Invalid timeout (1s - 100s)")]
    InvalidTimeout,

    #[error("No regions configured")]
    NoRegions,

    #[error("Unsupported region: {0}. Supported regions are: {1}")]
    UnsupportedRegion(String, String),

    #[error("Header {0} not valid. Make sure your header is of the form \"Header: value\"")]
    MalformedHeader(String),
}

/// The complete user-supplied test description, assembled by the CLI/config
/// layer and immutable afterwards.
#[derive(Debug, Clone)]
pub struct Workload {
    pub url: String,
    pub method: String,
    pub body: String,
    /// Header lines of the form `"Name: value"`.
    pub headers: Vec<String>,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Total requests across the fleet; 0 means unbounded (timelimit-driven).
    pub requests: i64,
    /// Overall deadline in seconds; 0 means request-count-driven.
    pub timelimit_secs: u64,
    pub concurrency: i64,
    pub regions: Vec<String>,
    pub run_docker: bool,
    /// Where to dump the final per-region JSON summary, if anywhere.
    pub output: Option<String>,
    /// Path to the runner payload used by the managed backing.
    pub runner_path: Option<String>,
}

impl Workload {
    /// Checks the invariants the planner and launchers depend on.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.regions.is_empty() {
            return Err(PlanError::NoRegions);
        }
        let concurrency_limit = 25_000 * self.regions.len() as i64;
        if self.concurrency < 1 || self.concurrency > concurrency_limit {
            return Err(PlanError::InvalidConcurrency(concurrency_limit));
        }
        if (self.requests < 1 && self.timelimit_secs == 0) || self.requests > MAX_REQUEST_COUNT {
            return Err(PlanError::InvalidRequestCount);
        }
        if self.timelimit_secs > 3600 {
            return Err(PlanError::InvalidTimelimit);
        }
        if self.timeout_secs < 1 || self.timeout_secs > 100 {
            return Err(PlanError::InvalidTimeout);
        }
        for region in &self.regions {
            if !SUPPORTED_REGIONS.contains(&region.as_str()) {
                return Err(PlanError::UnsupportedRegion(
                    region.clone(),
                    SUPPORTED_REGIONS.join(", "),
                ));
            }
        }
        for header in &self.headers {
            if !header.contains(':') {
                return Err(PlanError::MalformedHeader(header.clone()));
            }
        }
        Ok(())
    }
}

/// Everything one runner process needs: its shard of the workload plus the
/// bus endpoint to report to. Serialized into the invocation envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerSpec {
    /// Stable slot id, 0..N-1. Survives self-forks.
    pub runner_id: usize,
    pub region: String,
    /// Shard request budget; 0 means unbounded.
    pub requests: i64,
    pub concurrency: i64,
    /// Remaining overall deadline in seconds; 0 means request-driven.
    pub timelimit_secs: u64,
    /// Requests completed by earlier processes in this slot.
    pub previous_completed: i64,
    /// Per-invocation execution budget before a self-fork is required.
    pub execution_cap_secs: u64,
    /// Seconds between report publishes.
    pub reporting_interval_secs: u64,
    pub queue_url: String,
    pub queue_region: String,
    pub url: String,
    pub method: String,
    pub body: String,
    pub headers: Vec<String>,
    pub timeout_secs: u64,
}

impl RunnerSpec {
    /// Requests this process still has to issue; `None` when unbounded.
    pub fn remaining_requests(&self) -> Option<i64> {
        (self.requests > 0).then(|| (self.requests - self.previous_completed).max(0))
    }
}

/// Picks the fleet size for a given concurrency and region count.
///
/// Brackets balance per-runner cost against aggregate request rate while
/// respecting per-invocation limits; every region always gets at least one
/// runner, and no runner is ever created without concurrency to spend.
pub fn number_of_runners(concurrency: i64, regions: usize) -> usize {
    let regions_i = regions as i64;
    if regions_i > concurrency {
        return concurrency as usize;
    }
    if concurrency > 70_000 {
        500
    } else if concurrency > 10_000 {
        300
    } else if concurrency > 1_000 {
        100
    } else if concurrency < 10 * regions_i {
        regions
    } else {
        ((concurrency - 1) / 10 + 1) as usize
    }
}

/// Seconds between runner reports: grows with log₂ of the fleet size so the
/// bus never becomes the bottleneck.
pub fn reporting_interval(runners: usize) -> u64 {
    ((runners.max(1) as f64).log2() + 1.0).ceil() as u64
}

/// Splits a validated workload into runner specifications.
pub fn plan(
    workload: &Workload,
    queue_url: &str,
    queue_region: &str,
    execution_cap_secs: u64,
) -> Result<Vec<RunnerSpec>, PlanError> {
    workload.validate()?;

    let n = number_of_runners(workload.concurrency, workload.regions.len());
    let interval = reporting_interval(n);

    let shard_requests = workload.requests / n as i64;
    let request_remainder = workload.requests % n as i64;
    let shard_concurrency = workload.concurrency / n as i64;
    let concurrency_remainder = workload.concurrency % n as i64;

    let specs = (0..n)
        .map(|id| {
            let last = id == n - 1;
            RunnerSpec {
                runner_id: id,
                region: workload.regions[id % workload.regions.len()].clone(),
                requests: shard_requests + if last { request_remainder } else { 0 },
                concurrency: shard_concurrency + if last { concurrency_remainder } else { 0 },
                timelimit_secs: workload.timelimit_secs,
                previous_completed: 0,
                execution_cap_secs,
                reporting_interval_secs: interval,
                queue_url: queue_url.to_string(),
                queue_region: queue_region.to_string(),
                url: workload.url.clone(),
                method: workload.method.clone(),
                body: workload.body.clone(),
                headers: workload.headers.clone(),
                timeout_secs: workload.timeout_secs,
            }
        })
        .collect();
    Ok(specs)
}
