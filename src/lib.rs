//! Stampede: a distributed HTTP load generator.
//!
//! One workload is split into N runner shards, executed as short-lived AWS
//! Lambda invocations (or local Docker containers), and observed live: each
//! runner publishes windowed [`report::RunnerReport`]s on a shared result
//! bus, and the controller folds them into per-runner, per-region, and
//! overall [`aggregate::AggData`] summaries.

pub mod aggregate;
pub mod amqp;
pub mod bus;
pub mod collector;
pub mod config;
pub mod docker_launcher;
pub mod lambda_launcher;
pub mod launcher;
pub mod metric;
pub mod orchestrator;
pub mod plan;
pub mod report;
pub mod sqs;
pub mod worker;
