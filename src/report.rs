//! Wire schema shared between runner processes and the controller.
//!
//! A [`RunnerReport`] is the only thing that crosses process boundaries: each
//! runner publishes one per reporting window, and the controller folds them
//! into its per-runner aggregates. Reports are self-contained and additive,
//! so duplicate delivery over an at-least-once bus is harmless.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One reporting window of runner telemetry, JSON-encoded on the bus.
///
/// All durations are nanoseconds. `statuses` maps stringified decimal HTTP
/// status codes to counts. Counters cover only the window since the previous
/// report; cumulative state lives on the controller side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerReport {
    pub runner_id: usize,
    pub region: String,
    pub request_count: i64,
    pub timed_out: i64,
    pub connection_errors: i64,
    pub bytes_read: i64,
    pub ave_time_to_first: i64,
    pub ave_time_for_req: i64,
    /// Fastest successful request in the window; 0 when the window had none.
    pub fastest: i64,
    pub slowest: i64,
    /// Wall-clock span covered by this window.
    pub time_delta: i64,
    pub statuses: HashMap<String, i64>,
    /// Empty unless the runner latched a worker-wide fatal condition.
    pub fatal_error: String,
    /// True when this runner has nothing more to send for its slot.
    pub finished: bool,
}

impl RunnerReport {
    /// Requests in this window that completed with a response.
    pub fn successes(&self) -> i64 {
        self.request_count - self.timed_out - self.connection_errors
    }
}

/// Classification of a single request attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Success,
    Redirect,
    Timeout,
    ConnectionError,
    ReadError,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Success => "Success",
            RequestState::Redirect => "Redirect",
            RequestState::Timeout => "Timeout",
            RequestState::ConnectionError => "ConnectionError",
            RequestState::ReadError => "ReadError",
        }
    }
}

/// Outcome of one HTTP request attempt, produced by a driver fiber and
/// consumed by the runner's control loop. Never leaves the worker process.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    /// Offset of the request start from worker start, in nanoseconds.
    pub start_offset: i64,
    pub host: String,
    pub method: String,
    pub status: u16,
    /// Time until the first body byte was read.
    pub elapsed_first_byte: i64,
    /// Time until the whole body was read.
    pub elapsed_last_byte: i64,
    /// Total time spent on the attempt.
    pub elapsed: i64,
    pub bytes: i64,
    pub timeout: bool,
    pub connection_error: bool,
    pub state: RequestState,
}
