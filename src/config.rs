//! CLI flags and INI settings file.
//!
//! Precedence is built-in defaults, then the settings file, then CLI flags.
//! The file uses four sections: `[general]` for the scalar flags,
//! `[regions]` as a region → bool map, `[headers]` as a name → value map,
//! and `[task]` for the runner payload path.

use std::collections::HashMap;
use std::path::Path;

use clap::Parser;
use thiserror::Error;

use crate::plan::Workload;

pub const DEFAULT_SETTINGS_FILE: &str = "stampede.ini";

const DEFAULT_REQUESTS: i64 = 1000;
const DEFAULT_CONCURRENCY: i64 = 10;
const DEFAULT_TIMEOUT_SECS: u64 = 15;
const DEFAULT_METHOD: &str = "GET";
const DEFAULT_REGION: &str = "us-east-1";

const INI_TEMPLATE: &str = r#"[general]
; url = http://localhost:8080/
; requests = 1000
; concurrency = 10
; timelimit = 0
; timeout = 15
; method = GET
; body =

[regions]
us-east-1 = true
; eu-west-1 = true

[headers]
; cache-control = no-cache

[task]
; runner = ./data/runner/stampede-runner.zip
"#;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no target URL given (positional argument or [general] url)")]
    MissingUrl,

    #[error("invalid value for {key} in settings file: {value}")]
    InvalidSetting { key: String, value: String },

    #[error("failed to read settings file: {0}")]
    File(#[from] config::ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Command line surface of the controller binary.
#[derive(Debug, Parser)]
#[command(
    name = "stampede",
    version,
    about = "Distributed HTTP load generator"
)]
pub struct Cli {
    /// Target URL (optional when the settings file provides one).
    pub url: Option<String>,

    /// Total number of requests to issue across the fleet (0 = unbounded).
    #[arg(short = 'n', long)]
    pub requests: Option<i64>,

    /// Number of concurrent requests across the fleet.
    #[arg(short = 'c', long)]
    pub concurrency: Option<i64>,

    /// Overall deadline in seconds (0 = request-count-driven).
    #[arg(short = 't', long)]
    pub timelimit: Option<u64>,

    /// Per-request timeout in seconds.
    #[arg(short = 's', long)]
    pub timeout: Option<u64>,

    /// Extra header line "Name: value"; repeatable.
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Region to run from; repeatable, comma-separated lists accepted.
    #[arg(long = "region")]
    pub regions: Vec<String>,

    /// Write the final per-region summary as JSON to this path.
    #[arg(long = "json-output")]
    pub json_output: Option<String>,

    /// HTTP method.
    #[arg(short = 'm', long)]
    pub method: Option<String>,

    /// Request body.
    #[arg(long)]
    pub body: Option<String>,

    /// Write a settings file template and exit.
    #[arg(long)]
    pub create_ini_template: bool,

    /// Run against local Docker containers instead of AWS Lambda.
    #[arg(long)]
    pub run_docker: bool,

    /// Settings file location.
    #[arg(long, default_value = DEFAULT_SETTINGS_FILE)]
    pub settings: String,
}

/// Settings file content, already shaped for merging.
#[derive(Debug, Default)]
struct FileSettings {
    general: HashMap<String, String>,
    regions: Vec<String>,
    headers: Vec<String>,
    runner_path: Option<String>,
}

fn load_settings(path: &str) -> Result<FileSettings, ConfigError> {
    if !Path::new(path).exists() {
        return Ok(FileSettings::default());
    }
    let parsed = config::Config::builder()
        .add_source(config::File::new(path, config::FileFormat::Ini))
        .build()?;

    let mut settings = FileSettings::default();
    if let Ok(general) = parsed.get_table("general") {
        for (key, value) in general {
            settings
                .general
                .insert(key, value.into_string().unwrap_or_default());
        }
    }
    if let Ok(regions) = parsed.get_table("regions") {
        let mut enabled: Vec<String> = regions
            .into_iter()
            .filter(|(_, value)| value.clone().into_bool().unwrap_or(false))
            .map(|(region, _)| region)
            .collect();
        enabled.sort();
        settings.regions = enabled;
    }
    if let Ok(headers) = parsed.get_table("headers") {
        let mut lines: Vec<String> = headers
            .into_iter()
            .map(|(name, value)| {
                format!("{name}: {}", value.into_string().unwrap_or_default())
            })
            .collect();
        lines.sort();
        settings.headers = lines;
    }
    if let Ok(task) = parsed.get_table("task") {
        settings.runner_path = task
            .get("runner")
            .and_then(|value| value.clone().into_string().ok());
    }
    Ok(settings)
}

fn parse_general<T: std::str::FromStr>(
    general: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match general.get(key) {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|_| ConfigError::InvalidSetting {
            key: key.to_string(),
            value: raw.clone(),
        }),
    }
}

/// Splits repeatable region flags, accepting comma lists for backward
/// compatibility (`--region a,b --region c`).
fn split_regions(raw: &[String]) -> Vec<String> {
    raw.iter()
        .flat_map(|entry| entry.split(','))
        .map(str::trim)
        .filter(|region| !region.is_empty())
        .map(String::from)
        .collect()
}

/// Resolves defaults, settings file, and CLI flags into a [`Workload`].
pub fn build_workload(cli: &Cli) -> Result<Workload, ConfigError> {
    let file = load_settings(&cli.settings)?;

    let url = cli
        .url
        .clone()
        .or_else(|| file.general.get("url").cloned())
        .ok_or(ConfigError::MissingUrl)?;

    let requests = match cli.requests {
        Some(requests) => requests,
        None => parse_general(&file.general, "requests")?.unwrap_or(DEFAULT_REQUESTS),
    };
    let concurrency = match cli.concurrency {
        Some(concurrency) => concurrency,
        None => parse_general(&file.general, "concurrency")?.unwrap_or(DEFAULT_CONCURRENCY),
    };
    let timelimit_secs = match cli.timelimit {
        Some(timelimit) => timelimit,
        None => parse_general(&file.general, "timelimit")?.unwrap_or(0),
    };
    let timeout_secs = match cli.timeout {
        Some(timeout) => timeout,
        None => parse_general(&file.general, "timeout")?.unwrap_or(DEFAULT_TIMEOUT_SECS),
    };
    let method = cli
        .method
        .clone()
        .or_else(|| file.general.get("method").cloned())
        .unwrap_or_else(|| DEFAULT_METHOD.to_string());
    let body = cli
        .body
        .clone()
        .or_else(|| file.general.get("body").cloned())
        .unwrap_or_default();

    let mut regions = split_regions(&cli.regions);
    if regions.is_empty() {
        regions = file.regions.clone();
    }
    if regions.is_empty() {
        regions = vec![DEFAULT_REGION.to_string()];
    }

    let mut headers = file.headers.clone();
    headers.extend(cli.headers.iter().cloned());

    Ok(Workload {
        url,
        method,
        body,
        headers,
        timeout_secs,
        requests,
        timelimit_secs,
        concurrency,
        regions,
        run_docker: cli.run_docker,
        output: cli.json_output.clone(),
        runner_path: file.runner_path,
    })
}

/// Writes the commented settings template for `--create-ini-template`.
pub fn write_ini_template(path: &str) -> Result<(), ConfigError> {
    std::fs::write(path, INI_TEMPLATE)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("stampede").chain(args.iter().copied()))
    }

    #[test]
    fn cli_surface_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_apply_when_nothing_else_is_given() {
        let workload = build_workload(&cli(&["http://localhost/"])).unwrap();
        assert_eq!(workload.requests, DEFAULT_REQUESTS);
        assert_eq!(workload.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(workload.timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert_eq!(workload.method, "GET");
        assert_eq!(workload.regions, vec![DEFAULT_REGION.to_string()]);
        assert!(!workload.run_docker);
    }

    #[test]
    fn missing_url_is_an_error() {
        assert!(matches!(
            build_workload(&cli(&[])),
            Err(ConfigError::MissingUrl)
        ));
    }

    #[test]
    fn comma_separated_regions_are_accepted() {
        let workload = build_workload(&cli(&[
            "http://localhost/",
            "--region",
            "us-east-1,eu-west-1",
            "--region",
            "sa-east-1",
        ]))
        .unwrap();
        assert_eq!(workload.regions, vec!["us-east-1", "eu-west-1", "sa-east-1"]);
    }

    #[test]
    fn file_overrides_defaults_and_cli_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stampede.ini");
        std::fs::write(
            &path,
            "[general]\nurl = http://from-file/\nrequests = 77\nconcurrency = 7\n\n\
             [regions]\neu-west-1 = true\nus-east-1 = false\n\n\
             [headers]\nx-source = ini\n\n\
             [task]\nrunner = ./payload.zip\n",
        )
        .unwrap();
        let path = path.to_str().unwrap().to_string();

        let workload =
            build_workload(&cli(&["--settings", &path, "--requests", "99"])).unwrap();
        assert_eq!(workload.url, "http://from-file/");
        assert_eq!(workload.requests, 99); // CLI wins
        assert_eq!(workload.concurrency, 7); // file wins over default
        assert_eq!(workload.regions, vec!["eu-west-1"]); // false entries dropped
        assert_eq!(workload.headers, vec!["x-source: ini"]);
        assert_eq!(workload.runner_path.as_deref(), Some("./payload.zip"));
    }

    #[test]
    fn bad_numeric_setting_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stampede.ini");
        std::fs::write(&path, "[general]\nrequests = lots\n").unwrap();
        let path = path.to_str().unwrap().to_string();

        let result = build_workload(&cli(&["http://localhost/", "--settings", &path]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidSetting { .. })
        ));
    }

    #[test]
    fn template_round_trips_through_the_parser() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("template.ini");
        let path_str = path.to_str().unwrap().to_string();
        write_ini_template(&path_str).unwrap();

        let workload =
            build_workload(&cli(&["http://localhost/", "--settings", &path_str])).unwrap();
        assert_eq!(workload.regions, vec!["us-east-1"]);
        workload.validate().unwrap();
    }
}
