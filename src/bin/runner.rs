//! Runner-process entry point.
//!
//! This binary is what the launchers start, one process per shard (and what
//! a self-fork starts again). Its argument surface is the invocation
//! envelope contract; the process is oblivious to which backing launched it
//! and only sees its spec plus the bus URL.

use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use stampede::bus;
use stampede::lambda_launcher::LambdaRespawn;
use stampede::launcher::ProcessRespawn;
use stampede::plan::{RunnerSpec, DEFAULT_EXECUTION_CAP_SECS};
use stampede::worker::{LoadWorker, Respawn};

#[derive(Debug, Parser)]
#[command(
    name = "stampede-runner",
    version,
    about = "Drives one shard of a stampede load test"
)]
struct RunnerArgs {
    /// Target URL.
    url: String,

    #[arg(long, default_value_t = 1)]
    concurrency: i64,

    /// Shard request budget; 0 means deadline-driven.
    #[arg(long, default_value_t = 0)]
    requests: i64,

    /// Per-invocation execution budget in seconds.
    #[arg(long = "execution-time", default_value_t = DEFAULT_EXECUTION_CAP_SECS)]
    execution_time: u64,

    /// Result bus endpoint (SQS queue URL or amqp:// URL).
    #[arg(long)]
    sqsurl: String,

    #[arg(long = "queue-region", default_value = "us-east-1")]
    queue_region: String,

    /// Per-request timeout, e.g. "15s".
    #[arg(long = "client-timeout", default_value = "15s")]
    client_timeout: String,

    /// Seconds between report publishes.
    #[arg(long, default_value_t = 1)]
    frequency: u64,

    /// Region tag attached to this runner's reports.
    #[arg(long = "aws-region", default_value = "us-east-1")]
    aws_region: String,

    #[arg(long, default_value = "GET")]
    method: String,

    #[arg(long, default_value = "")]
    body: String,

    /// Header line "Name: value"; repeatable.
    #[arg(long = "header")]
    headers: Vec<String>,

    /// Slot id; stable across self-forks.
    #[arg(long = "runner-id", default_value_t = 0)]
    runner_id: usize,

    /// Remaining overall deadline in seconds; 0 means request-driven.
    #[arg(long, default_value_t = 0)]
    timelimit: u64,

    /// Requests completed by earlier processes in this slot.
    #[arg(long = "previous-count", default_value_t = 0)]
    previous_count: i64,
}

fn parse_client_timeout(raw: &str) -> u64 {
    raw.trim().trim_end_matches('s').parse().unwrap_or(15)
}

impl RunnerArgs {
    fn into_spec(self) -> RunnerSpec {
        RunnerSpec {
            runner_id: self.runner_id,
            region: self.aws_region,
            requests: self.requests,
            concurrency: self.concurrency,
            timelimit_secs: self.timelimit,
            previous_completed: self.previous_count,
            execution_cap_secs: self.execution_time,
            reporting_interval_secs: self.frequency,
            queue_url: self.sqsurl,
            queue_region: self.queue_region,
            url: self.url,
            method: self.method,
            body: self.body,
            headers: self.headers,
            timeout_secs: parse_client_timeout(&self.client_timeout),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stampede=info")),
        )
        .init();

    let spec = RunnerArgs::parse().into_spec();

    let bus = match bus::connect(&spec.queue_url, &spec.queue_region).await {
        Ok(bus) => bus,
        Err(error) => {
            error!(error = %error, "could not reach the result bus");
            return ExitCode::FAILURE;
        }
    };
    // Process-hosted runners fork by re-exec; Lambda-hosted ones by
    // self-invoking the function.
    let respawn: Box<dyn Respawn> = if spec.queue_url.starts_with("amqp://") {
        Box::new(ProcessRespawn)
    } else {
        Box::new(LambdaRespawn)
    };

    let worker = match LoadWorker::new(spec, bus, respawn) {
        Ok(worker) => worker,
        Err(error) => {
            error!(error = %error, "invalid runner specification");
            return ExitCode::FAILURE;
        }
    };
    match worker.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(error = %error, "runner failed");
            ExitCode::FAILURE
        }
    }
}
