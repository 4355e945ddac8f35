//! Turning runner specifications into running runner processes.
//!
//! The launcher is the only part of the system that knows where runners
//! physically execute. Both backings speak the same invocation envelope: a
//! JSON `{file, args}` pair whose args are the runner binary's command line.
//! The runner itself never learns which backing started it; it only sees its
//! spec and the bus URL.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::plan::{RunnerSpec, Workload, DEFAULT_EXECUTION_CAP_SECS};
use crate::worker::Respawn;

/// Path of the runner binary inside the execution environment.
pub const RUNNER_BINARY: &str = "./stampede-runner";

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("provisioning failed: {0}")]
    Provision(String),

    #[error("failed to invoke runner: {0}")]
    Invoke(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The invocation envelope handed to the execution environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeArgs {
    pub file: String,
    pub args: Vec<String>,
}

impl InvokeArgs {
    pub fn from_spec(spec: &RunnerSpec) -> Self {
        Self {
            file: RUNNER_BINARY.to_string(),
            args: runner_args(spec),
        }
    }
}

/// Renders a spec as the runner binary's command line. The flag surface is
/// externally stable; the URL comes last as the positional argument.
pub fn runner_args(spec: &RunnerSpec) -> Vec<String> {
    let mut args = vec![
        format!("--concurrency={}", spec.concurrency),
        format!("--requests={}", spec.requests),
        format!("--execution-time={}", spec.execution_cap_secs),
        format!("--sqsurl={}", spec.queue_url),
        format!("--queue-region={}", spec.queue_region),
        format!("--client-timeout={}s", spec.timeout_secs),
        format!("--frequency={}", spec.reporting_interval_secs),
        format!("--aws-region={}", spec.region),
        format!("--method={}", spec.method),
        format!("--runner-id={}", spec.runner_id),
        format!("--timelimit={}", spec.timelimit_secs),
        format!("--previous-count={}", spec.previous_completed),
    ];
    if !spec.body.is_empty() {
        args.push(format!("--body={}", spec.body));
    }
    for header in &spec.headers {
        args.push(format!("--header={header}"));
    }
    args.push(spec.url.clone());
    args
}

/// Where runner processes execute.
///
/// `setup` provisions whatever the backing needs (roles, functions, queue,
/// network, broker) and must leave `queue_url` usable; `teardown` is
/// idempotent and best-effort. `launch` is asynchronous fire-and-forget.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn setup(&mut self, workload: &Workload) -> Result<(), LaunchError>;
    async fn launch(&self, spec: &RunnerSpec) -> Result<(), LaunchError>;
    fn queue_url(&self) -> &str;
    fn queue_region(&self) -> &str;
    /// Per-invocation execution budget runners should plan around.
    fn execution_cap_secs(&self) -> u64 {
        DEFAULT_EXECUTION_CAP_SECS
    }
    async fn teardown(&mut self);
}

/// Self-fork transport for runners started as plain processes (the container
/// backing): re-exec the current binary with the successor's arguments.
pub struct ProcessRespawn;

#[async_trait]
impl Respawn for ProcessRespawn {
    async fn respawn(&self, spec: &RunnerSpec) -> Result<(), LaunchError> {
        let exe = std::env::current_exe()?;
        std::process::Command::new(exe)
            .args(runner_args(spec))
            .spawn()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> RunnerSpec {
        RunnerSpec {
            runner_id: 3,
            region: "eu-west-1".to_string(),
            requests: 250,
            concurrency: 5,
            timelimit_secs: 120,
            previous_completed: 0,
            execution_cap_secs: DEFAULT_EXECUTION_CAP_SECS,
            reporting_interval_secs: 3,
            queue_url: "https://sqs.us-east-1.amazonaws.com/1/stampede-x.fifo".to_string(),
            queue_region: "us-east-1".to_string(),
            url: "https://target.example.com/".to_string(),
            method: "POST".to_string(),
            body: "{\"k\":1}".to_string(),
            headers: vec!["X-Load-Test: yes".to_string()],
            timeout_secs: 15,
        }
    }

    #[test]
    fn envelope_carries_the_full_runner_command_line() {
        let envelope = InvokeArgs::from_spec(&spec());
        assert_eq!(envelope.file, RUNNER_BINARY);
        assert!(envelope.args.contains(&"--concurrency=5".to_string()));
        assert!(envelope.args.contains(&"--requests=250".to_string()));
        assert!(envelope.args.contains(&"--runner-id=3".to_string()));
        assert!(envelope.args.contains(&"--client-timeout=15s".to_string()));
        assert!(envelope.args.contains(&"--aws-region=eu-west-1".to_string()));
        assert!(envelope.args.contains(&"--body={\"k\":1}".to_string()));
        assert!(envelope
            .args
            .contains(&"--header=X-Load-Test: yes".to_string()));
        assert_eq!(
            envelope.args.last(),
            Some(&"https://target.example.com/".to_string())
        );
    }

    #[test]
    fn empty_body_is_omitted() {
        let mut s = spec();
        s.body = String::new();
        let args = runner_args(&s);
        assert!(!args.iter().any(|a| a.starts_with("--body")));
    }

    #[test]
    fn envelope_round_trips_as_json() {
        let envelope = InvokeArgs::from_spec(&spec());
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.starts_with("{\"file\":"));
        let parsed: InvokeArgs = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, envelope);
    }
}
