//! Controller-side report collector.
//!
//! One task drains the result bus into the slot table and emits a
//! [`Snapshot`] after every merge. The snapshot channel has capacity 1, so a
//! slow consumer backpressures the collector and defers bus consumption;
//! the bus is durable enough to absorb the pause.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::aggregate::{AggData, Snapshot};
use crate::bus::ResultBus;

/// How long the collector keeps waiting after its last non-empty receive
/// before declaring the fleet lost.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(20);

/// Spawns the collector task. The returned receiver yields a snapshot after
/// every merged report and closes when the run is over (all slots finished,
/// drain timeout, or consumer gone).
pub fn start(
    bus: Arc<dyn ResultBus>,
    runner_count: usize,
) -> (JoinHandle<()>, mpsc::Receiver<Snapshot>) {
    let (snapshot_tx, snapshot_rx) = mpsc::channel(1);
    let handle = tokio::spawn(drain(bus, runner_count, snapshot_tx));
    (handle, snapshot_rx)
}

async fn drain(bus: Arc<dyn ResultBus>, runner_count: usize, snapshots: mpsc::Sender<Snapshot>) {
    let mut slots: Vec<AggData> = (0..runner_count).map(|_| AggData::empty()).collect();
    let mut last_receive = Instant::now();

    loop {
        let reports = match bus.receive().await {
            Ok(reports) => reports,
            Err(error) => {
                warn!(error = %error, "bus receive failed");
                Vec::new()
            }
        };

        if reports.is_empty() {
            if last_receive.elapsed() >= DRAIN_TIMEOUT {
                info!("no reports for {DRAIN_TIMEOUT:?}, closing collector");
                return;
            }
            continue;
        }
        last_receive = Instant::now();

        for report in reports {
            let Some(slot) = slots.get_mut(report.runner_id) else {
                warn!(runner_id = report.runner_id, "report for unknown slot dropped");
                continue;
            };
            slot.merge(&report);
            let snapshot = Snapshot {
                runners: slots.clone(),
            };
            if snapshots.send(snapshot).await.is_err() {
                // Consumer went away; nothing left to aggregate for.
                return;
            }
        }

        if slots.iter().all(|slot| slot.finished) {
            info!("all runners finished");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::report::RunnerReport;

    fn finished_report(runner_id: usize, count: i64) -> RunnerReport {
        RunnerReport {
            runner_id,
            region: "us-east-1".to_string(),
            request_count: count,
            statuses: [("200".to_string(), count)].into_iter().collect(),
            finished: true,
            ..RunnerReport::default()
        }
    }

    #[tokio::test]
    async fn collector_closes_once_all_slots_finish() {
        let bus = Arc::new(MemoryBus::new());
        bus.publish(&finished_report(0, 10)).await.unwrap();
        bus.publish(&finished_report(1, 5)).await.unwrap();

        let (_handle, mut snapshots) = start(bus, 2);
        let mut last = None;
        while let Some(snapshot) = snapshots.recv().await {
            last = Some(snapshot);
        }

        let last = last.expect("at least one snapshot");
        assert!(last.all_finished());
        assert_eq!(last.total_requests(), 15);
        assert_eq!(last.overall().statuses.get("200"), Some(&15));
    }

    #[tokio::test]
    async fn cumulative_merge_across_windows() {
        let bus = Arc::new(MemoryBus::new());
        let mut window = finished_report(0, 10);
        window.finished = false;
        bus.publish(&window).await.unwrap();
        bus.publish(&finished_report(0, 10)).await.unwrap();

        let (_handle, mut snapshots) = start(bus, 1);
        let mut last = None;
        while let Some(snapshot) = snapshots.recv().await {
            last = Some(snapshot);
        }
        assert_eq!(last.unwrap().runners[0].request_count, 20);
    }

    #[tokio::test]
    async fn unknown_slot_is_dropped_not_fatal() {
        let bus = Arc::new(MemoryBus::new());
        bus.publish(&finished_report(7, 3)).await.unwrap();
        bus.publish(&finished_report(0, 2)).await.unwrap();

        let (_handle, mut snapshots) = start(bus, 1);
        let mut last = None;
        while let Some(snapshot) = snapshots.recv().await {
            last = Some(snapshot);
        }
        assert_eq!(last.unwrap().total_requests(), 2);
    }
}
