//! Rolling per-runner metric window.
//!
//! Each runner folds its [`RequestOutcome`]s into one of these between
//! reporting ticks. Draining the window produces a [`RunnerReport`] and
//! resets the state, so every report covers exactly one window.

use std::collections::HashMap;

use crate::report::{RequestOutcome, RunnerReport};

/// Latched into a report when failures exceed half of a window's requests.
pub const FATAL_ERROR_RATE: &str = "Over 50% of requests failed, aborting";

/// Aggregates request outcomes between report sends.
///
/// Time sums and fastest/slowest cover successful responses only; timeouts
/// and connection errors are counted separately. `first_request_time` and
/// `last_request_time` bound the window for the `time_delta` calculation.
#[derive(Debug)]
pub struct RollingMetric {
    request_count: i64,
    timed_out: i64,
    connection_errors: i64,
    bytes_read: i64,
    time_to_first_total: i64,
    time_for_req_total: i64,
    fastest: i64,
    slowest: i64,
    statuses: HashMap<String, i64>,
    first_request_time: i64,
    last_request_time: i64,
    fatal_error: String,
}

impl RollingMetric {
    pub fn new() -> Self {
        Self {
            request_count: 0,
            timed_out: 0,
            connection_errors: 0,
            bytes_read: 0,
            time_to_first_total: 0,
            time_for_req_total: 0,
            fastest: i64::MAX,
            slowest: 0,
            statuses: HashMap::new(),
            first_request_time: 0,
            last_request_time: 0,
            fatal_error: String::new(),
        }
    }

    /// Folds one outcome into the current window.
    pub fn record(&mut self, outcome: &RequestOutcome) {
        self.request_count += 1;
        if self.request_count == 1 {
            self.first_request_time = outcome.start_offset;
        }
        self.last_request_time = outcome.start_offset + outcome.elapsed;

        if outcome.timeout {
            self.timed_out += 1;
        } else if outcome.connection_error {
            self.connection_errors += 1;
        } else {
            self.bytes_read += outcome.bytes;
            self.time_to_first_total += outcome.elapsed_first_byte;
            self.time_for_req_total += outcome.elapsed_last_byte;
            if outcome.elapsed_last_byte < self.fastest {
                self.fastest = outcome.elapsed_last_byte;
            }
            if outcome.elapsed_last_byte > self.slowest {
                self.slowest = outcome.elapsed_last_byte;
            }
            *self
                .statuses
                .entry(outcome.status.to_string())
                .or_insert(0) += 1;
        }

        if self.timed_out + self.connection_errors > self.request_count / 2 {
            self.fatal_error = FATAL_ERROR_RATE.to_string();
        }
    }

    /// True when the current window has at least one outcome.
    pub fn has_results(&self) -> bool {
        self.request_count > 0
    }

    /// Produces the report for the current window and resets it.
    pub fn drain(&mut self, runner_id: usize, region: &str, finished: bool) -> RunnerReport {
        let successes = self.request_count - self.timed_out - self.connection_errors;
        let (ave_time_to_first, ave_time_for_req) = if successes > 0 {
            (
                self.time_to_first_total / successes,
                self.time_for_req_total / successes,
            )
        } else {
            (0, 0)
        };

        let report = RunnerReport {
            runner_id,
            region: region.to_string(),
            request_count: self.request_count,
            timed_out: self.timed_out,
            connection_errors: self.connection_errors,
            bytes_read: self.bytes_read,
            ave_time_to_first,
            ave_time_for_req,
            fastest: if self.fastest == i64::MAX {
                0
            } else {
                self.fastest
            },
            slowest: self.slowest,
            time_delta: self.last_request_time - self.first_request_time,
            statuses: std::mem::take(&mut self.statuses),
            fatal_error: std::mem::take(&mut self.fatal_error),
            finished,
        };

        *self = Self::new();
        report
    }
}

impl Default for RollingMetric {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::RequestState;

    fn success(start_offset: i64, first: i64, last: i64, bytes: i64) -> RequestOutcome {
        RequestOutcome {
            start_offset,
            host: "localhost".to_string(),
            method: "GET".to_string(),
            status: 200,
            elapsed_first_byte: first,
            elapsed_last_byte: last,
            elapsed: last,
            bytes,
            timeout: false,
            connection_error: false,
            state: RequestState::Success,
        }
    }

    fn failure(start_offset: i64, timeout: bool) -> RequestOutcome {
        RequestOutcome {
            status: 0,
            timeout,
            connection_error: !timeout,
            state: if timeout {
                RequestState::Timeout
            } else {
                RequestState::ConnectionError
            },
            ..success(start_offset, 0, 0, 0)
        }
    }

    #[test]
    fn fresh_metric_is_empty() {
        let metric = RollingMetric::new();
        assert!(!metric.has_results());
        assert_eq!(metric.fastest, i64::MAX);
        assert_eq!(metric.slowest, 0);
        assert_eq!(metric.first_request_time, 0);
        assert_eq!(metric.last_request_time, 0);
    }

    #[test]
    fn successful_outcomes_feed_time_sums_and_statuses() {
        let mut metric = RollingMetric::new();
        metric.record(&success(400, 100, 300, 1000));
        metric.record(&success(800, 100, 400, 1000));

        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.bytes_read, 2000);
        assert_eq!(metric.time_to_first_total, 200);
        assert_eq!(metric.time_for_req_total, 700);
        assert_eq!(metric.fastest, 300);
        assert_eq!(metric.slowest, 400);
        assert_eq!(metric.first_request_time, 400);
        assert_eq!(metric.last_request_time, 1200);
        assert_eq!(metric.statuses.get("200"), Some(&2));
    }

    #[test]
    fn failed_outcomes_do_not_touch_success_sums() {
        let mut metric = RollingMetric::new();
        metric.record(&success(400, 100, 300, 1000));
        metric.record(&failure(800, true));
        metric.record(&failure(1200, false));

        assert_eq!(metric.request_count, 3);
        assert_eq!(metric.timed_out, 1);
        assert_eq!(metric.connection_errors, 1);
        assert_eq!(metric.bytes_read, 1000);
        assert_eq!(metric.time_for_req_total, 300);
        assert!(metric.statuses.get("0").is_none());
    }

    #[test]
    fn fatal_latches_past_half_failures() {
        let mut metric = RollingMetric::new();
        for i in 0..10 {
            metric.record(&success(i * 100, 10, 20, 1));
        }
        for i in 0..10 {
            metric.record(&failure(1000 + i * 100, true));
        }
        // 10 of 20: exactly half, not over it.
        assert!(metric.fatal_error.is_empty());

        metric.record(&failure(5000, true));
        assert_eq!(metric.fatal_error, FATAL_ERROR_RATE);
    }

    #[test]
    fn drain_computes_window_averages_and_resets() {
        let mut metric = RollingMetric::new();
        for i in 0..10 {
            metric.record(&success(
                10_000_000 + i * 10_000_000,
                100,
                300,
                1000,
            ));
        }

        let report = metric.drain(2, "us-east-1", false);
        assert_eq!(report.runner_id, 2);
        assert_eq!(report.region, "us-east-1");
        assert_eq!(report.request_count, 10);
        assert_eq!(report.ave_time_to_first, 100);
        assert_eq!(report.ave_time_for_req, 300);
        assert_eq!(report.fastest, 300);
        assert_eq!(report.slowest, 300);
        // first start 10ms, last start 100ms + 300ns elapsed
        assert_eq!(report.time_delta, 90_000_300);
        assert!(!report.finished);

        assert!(!metric.has_results());
        assert_eq!(metric.fastest, i64::MAX);
        assert!(metric.statuses.is_empty());
    }

    #[test]
    fn drain_with_no_successes_reports_zero_averages() {
        let mut metric = RollingMetric::new();
        metric.record(&failure(100, false));
        let report = metric.drain(0, "us-east-1", true);
        assert_eq!(report.ave_time_for_req, 0);
        assert_eq!(report.ave_time_to_first, 0);
        assert_eq!(report.fastest, 0);
        assert_eq!(report.connection_errors, 1);
        assert_eq!(report.fatal_error, FATAL_ERROR_RATE);
        assert!(report.finished);
    }
}
