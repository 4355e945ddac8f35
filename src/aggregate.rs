//! Controller-side aggregation of runner reports.
//!
//! One [`AggData`] slot exists per runner-id. Reports merge into their slot
//! with a commutative fold: counters add, extremes take min/max, and the
//! latency averages are weighted by each side's successful-request count.
//! Per-region and overall summaries reduce slots with the same rules, except
//! that the per-second rates sum across runners — throughput adds up, it
//! does not average.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::report::RunnerReport;

/// Sentinel for "no successful request seen yet".
const UNSET_FASTEST: i64 = i64::MAX;

/// Cumulative aggregate for one runner slot (or a reduction of several).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggData {
    pub region: String,
    pub request_count: i64,
    pub timed_out: i64,
    pub connection_errors: i64,
    pub bytes_read: i64,
    pub ave_time_to_first: i64,
    pub ave_time_for_req: i64,
    pub fastest: i64,
    pub slowest: i64,
    pub time_delta: i64,
    pub req_per_sec: f64,
    pub kbytes_per_sec: f64,
    pub statuses: HashMap<String, i64>,
    pub fatal_error: String,
    pub finished: bool,
}

impl AggData {
    /// An empty slot awaiting its first report.
    pub fn empty() -> Self {
        Self {
            region: String::new(),
            request_count: 0,
            timed_out: 0,
            connection_errors: 0,
            bytes_read: 0,
            ave_time_to_first: 0,
            ave_time_for_req: 0,
            fastest: UNSET_FASTEST,
            slowest: 0,
            time_delta: 0,
            req_per_sec: 0.0,
            kbytes_per_sec: 0.0,
            statuses: HashMap::new(),
            fatal_error: String::new(),
            finished: false,
        }
    }

    /// Requests that completed with a response.
    pub fn successes(&self) -> i64 {
        self.request_count - self.timed_out - self.connection_errors
    }

    /// Folds one report into this aggregate.
    pub fn merge(&mut self, report: &RunnerReport) {
        let prev_ok = self.successes();
        let add_ok = report.successes();

        self.request_count += report.request_count;
        self.timed_out += report.timed_out;
        self.connection_errors += report.connection_errors;
        self.bytes_read += report.bytes_read;
        self.time_delta += report.time_delta;

        if prev_ok + add_ok > 0 {
            self.ave_time_to_first = weighted_average(
                self.ave_time_to_first,
                prev_ok,
                report.ave_time_to_first,
                add_ok,
            );
            self.ave_time_for_req = weighted_average(
                self.ave_time_for_req,
                prev_ok,
                report.ave_time_for_req,
                add_ok,
            );
        }
        if self.time_delta > 0 {
            let secs = self.time_delta as f64 / 1e9;
            self.req_per_sec = self.request_count as f64 / secs;
            self.kbytes_per_sec = self.bytes_read as f64 / 1024.0 / secs;
        }

        for (code, count) in &report.statuses {
            *self.statuses.entry(code.clone()).or_insert(0) += count;
        }

        if report.slowest > self.slowest {
            self.slowest = report.slowest;
        }
        if report.fastest > 0 && report.fastest < self.fastest {
            self.fastest = report.fastest;
        }

        if !report.fatal_error.is_empty() {
            self.fatal_error = report.fatal_error.clone();
        }
        self.finished |= report.finished;
        self.region = report.region.clone();
    }

    /// Fastest successful request, or `None` before the first success.
    pub fn fastest_or_none(&self) -> Option<i64> {
        (self.fastest != UNSET_FASTEST).then_some(self.fastest)
    }
}

fn weighted_average(current: i64, current_n: i64, add: i64, add_n: i64) -> i64 {
    (current * current_n + add * add_n) / (current_n + add_n)
}

/// Reduces a set of aggregates into one summary.
///
/// Same fold as [`AggData::merge`] for counters, extremes, and weighted
/// averages, but per-second rates sum across the inputs: ten runners doing
/// 100 req/s each are doing 1000 req/s together. `finished` holds only when
/// every input is finished.
pub fn reduce(slots: &[&AggData]) -> AggData {
    let mut sum = AggData::empty();
    sum.finished = true;
    let mut ok_so_far = 0i64;

    for slot in slots {
        let add_ok = slot.successes();
        if ok_so_far + add_ok > 0 {
            sum.ave_time_to_first = weighted_average(
                sum.ave_time_to_first,
                ok_so_far,
                slot.ave_time_to_first,
                add_ok,
            );
            sum.ave_time_for_req = weighted_average(
                sum.ave_time_for_req,
                ok_so_far,
                slot.ave_time_for_req,
                add_ok,
            );
        }
        ok_so_far += add_ok;

        sum.request_count += slot.request_count;
        sum.timed_out += slot.timed_out;
        sum.connection_errors += slot.connection_errors;
        sum.bytes_read += slot.bytes_read;
        sum.time_delta += slot.time_delta;
        sum.req_per_sec += slot.req_per_sec;
        sum.kbytes_per_sec += slot.kbytes_per_sec;

        if slot.fastest < sum.fastest {
            sum.fastest = slot.fastest;
        }
        if slot.slowest > sum.slowest {
            sum.slowest = slot.slowest;
        }
        for (code, count) in &slot.statuses {
            *sum.statuses.entry(code.clone()).or_insert(0) += count;
        }
        if !slot.fatal_error.is_empty() {
            sum.fatal_error = slot.fatal_error.clone();
        }
        sum.finished &= slot.finished;
        sum.region = slot.region.clone();
    }
    sum
}

/// The full table of runner aggregates at one instant, cloned out to the UI
/// after every merge.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub runners: Vec<AggData>,
}

impl Snapshot {
    /// Sorted distinct region tags that have reported so far.
    pub fn regions(&self) -> Vec<String> {
        let mut regions: Vec<String> = self
            .runners
            .iter()
            .filter(|slot| !slot.region.is_empty())
            .map(|slot| slot.region.clone())
            .collect();
        regions.sort();
        regions.dedup();
        regions
    }

    /// Per-region summaries, keyed by region tag.
    pub fn by_region(&self) -> BTreeMap<String, AggData> {
        let mut map = BTreeMap::new();
        for region in self.regions() {
            let members: Vec<&AggData> = self
                .runners
                .iter()
                .filter(|slot| slot.region == region)
                .collect();
            map.insert(region, reduce(&members));
        }
        map
    }

    /// Summary across every runner that has reported.
    pub fn overall(&self) -> AggData {
        let reported: Vec<&AggData> = self
            .runners
            .iter()
            .filter(|slot| !slot.region.is_empty())
            .collect();
        reduce(&reported)
    }

    pub fn all_finished(&self) -> bool {
        self.runners.iter().all(|slot| slot.finished)
    }

    pub fn total_requests(&self) -> i64 {
        self.runners.iter().map(|slot| slot.request_count).sum()
    }
}
