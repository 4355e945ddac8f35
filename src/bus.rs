//! Provider-neutral publish/consume channel for runner reports.
//!
//! Two production backings exist: a managed FIFO queue ([`crate::sqs`]) and
//! a local AMQP broker ([`crate::amqp`]). Both carry the same JSON-encoded
//! [`RunnerReport`] and both deliver at-least-once; the aggregation model is
//! additive, so duplicates and lost windows are tolerated. An in-memory bus
//! backs tests and dry runs.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::report::RunnerReport;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to connect to result bus: {0}")]
    Connect(String),

    #[error("failed to publish report: {0}")]
    Publish(String),

    #[error("failed to receive reports: {0}")]
    Receive(String),

    #[error("report encoding failed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Publish/consume channel for [`RunnerReport`]s.
///
/// `receive` polls for up to roughly one second and returns whatever
/// arrived; an empty vec means "nothing right now", not end-of-stream.
#[async_trait]
pub trait ResultBus: Send + Sync {
    async fn publish(&self, report: &RunnerReport) -> Result<(), BusError>;
    async fn receive(&self) -> Result<Vec<RunnerReport>, BusError>;
}

/// Connects the backing matching the queue URL scheme: `amqp://` URLs go to
/// the local broker, anything else to the managed queue.
pub async fn connect(queue_url: &str, queue_region: &str) -> Result<Arc<dyn ResultBus>, BusError> {
    if queue_url.starts_with("amqp://") {
        Ok(Arc::new(crate::amqp::AmqpBus::connect(queue_url).await?))
    } else {
        Ok(Arc::new(
            crate::sqs::SqsBus::connect(queue_url, queue_region).await,
        ))
    }
}

/// Decodes one wire message, dropping (with a warning) anything malformed so
/// a single bad report can never take the controller down.
pub(crate) fn decode_report(body: &[u8]) -> Option<RunnerReport> {
    match serde_json::from_slice(body) {
        Ok(report) => Some(report),
        Err(error) => {
            warn!(%error, "dropping malformed report");
            None
        }
    }
}

/// Bus that never leaves the process. Used by the test suites and by local
/// single-process dry runs.
#[derive(Clone, Default)]
pub struct MemoryBus {
    queue: Arc<tokio::sync::Mutex<VecDeque<RunnerReport>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultBus for MemoryBus {
    async fn publish(&self, report: &RunnerReport) -> Result<(), BusError> {
        self.queue.lock().await.push_back(report.clone());
        Ok(())
    }

    async fn receive(&self) -> Result<Vec<RunnerReport>, BusError> {
        let drained: Vec<RunnerReport> = self.queue.lock().await.drain(..).collect();
        if drained.is_empty() {
            // Mimic the pollers' pacing so callers don't spin.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(drained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_bus_delivers_in_order() {
        let bus = MemoryBus::new();
        for id in 0..3 {
            bus.publish(&RunnerReport {
                runner_id: id,
                ..RunnerReport::default()
            })
            .await
            .unwrap();
        }
        let received = bus.receive().await.unwrap();
        assert_eq!(received.len(), 3);
        assert_eq!(received[0].runner_id, 0);
        assert_eq!(received[2].runner_id, 2);
        assert!(bus.receive().await.unwrap().is_empty());
    }

    #[test]
    fn malformed_reports_are_dropped() {
        assert!(decode_report(b"{not json").is_none());
        assert!(decode_report(br#"{"runner_id": 0}"#).is_none());
        let ok = serde_json::to_vec(&RunnerReport::default()).unwrap();
        assert!(decode_report(&ok).is_some());
    }
}
