//! Controller binary: parse the CLI, run the orchestrator, render live
//! summaries, and dump the final JSON on request.

use std::collections::BTreeMap;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use stampede::aggregate::{AggData, Snapshot};
use stampede::config::{self, Cli};
use stampede::orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stampede=info")),
        )
        .init();

    let cli = Cli::parse();
    if cli.create_ini_template {
        return match config::write_ini_template(&cli.settings) {
            Ok(()) => {
                println!("Wrote settings template to {}", cli.settings);
                ExitCode::SUCCESS
            }
            Err(error) => {
                eprintln!("{error}");
                ExitCode::FAILURE
            }
        };
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{error}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let workload = config::build_workload(&cli)?;
    workload.validate()?;
    let output = workload.output.clone();

    let mut orchestrator = Orchestrator::new(workload);
    let mut snapshots = orchestrator.start().await?;

    let mut last: Option<Snapshot> = None;
    let mut last_render = Instant::now() - RENDER_INTERVAL;
    loop {
        tokio::select! {
            snapshot = snapshots.recv() => match snapshot {
                Some(snapshot) => {
                    if last_render.elapsed() >= RENDER_INTERVAL {
                        render_progress(&snapshot);
                        last_render = Instant::now();
                    }
                    last = Some(snapshot);
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\nInterrupted, tearing down");
                break;
            }
            _ = terminate_signal() => {
                eprintln!("\nTerminated, tearing down");
                break;
            }
        }
    }
    orchestrator.shutdown().await;

    let Some(snapshot) = last else {
        return Err("No results received".into());
    };
    render_final(&snapshot);

    if let Some(path) = output {
        let mut dump: BTreeMap<String, AggData> = snapshot.by_region();
        dump.insert("overall".to_string(), snapshot.overall());
        std::fs::write(&path, serde_json::to_string_pretty(&dump)?)?;
        println!("Wrote results to {path}");
    }
    Ok(())
}

const RENDER_INTERVAL: Duration = Duration::from_millis(200);

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(_) => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await
}

fn ms(nanos: i64) -> f64 {
    nanos as f64 / 1e6
}

fn summary_line(data: &AggData) -> String {
    format!(
        "reqs {:>9}  timeouts {:>6}  conn-errs {:>6}  avg {:>9.2}ms  ttfb {:>9.2}ms  {:>9.1} req/s  {:>9.1} KB/s",
        data.request_count,
        data.timed_out,
        data.connection_errors,
        ms(data.ave_time_for_req),
        ms(data.ave_time_to_first),
        data.req_per_sec,
        data.kbytes_per_sec,
    )
}

fn render_progress(snapshot: &Snapshot) {
    for (region, data) in snapshot.by_region() {
        println!("[{region:<16}] {}", summary_line(&data));
    }
}

fn render_final(snapshot: &Snapshot) {
    println!("\n--- results ---");
    let by_region = snapshot.by_region();
    for (region, data) in &by_region {
        println!("Region: {region}");
        render_data(data);
    }
    if by_region.len() != 1 {
        println!("Overall");
        render_data(&snapshot.overall());
    }
}

fn render_data(data: &AggData) {
    println!("   {}", summary_line(data));
    if let Some(fastest) = data.fastest_or_none() {
        println!(
            "   fastest {:.2}ms  slowest {:.2}ms  bytes read {}",
            ms(fastest),
            ms(data.slowest),
            data.bytes_read
        );
    }
    let mut codes: Vec<(&String, &i64)> = data.statuses.iter().collect();
    codes.sort();
    for (code, count) in codes {
        println!("   HTTP {code}: {count}");
    }
    if !data.fatal_error.is_empty() {
        println!("   FATAL: {}", data.fatal_error);
    }
}
