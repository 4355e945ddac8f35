//! Managed FIFO queue backing for the result bus.
//!
//! One queue exists per test session, created and deleted by the Lambda
//! launcher. Messages are published with the runner id as the message group,
//! which gives per-runner FIFO ordering; cross-runner ordering is irrelevant
//! because the merge is commutative.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use tracing::warn;
use uuid::Uuid;

use crate::bus::{decode_report, BusError, ResultBus};
use crate::report::RunnerReport;

pub struct SqsBus {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

impl SqsBus {
    /// Builds a client against the queue's home region.
    pub async fn connect(queue_url: &str, queue_region: &str) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(queue_region.to_string()))
            .load()
            .await;
        Self {
            client: aws_sdk_sqs::Client::new(&config),
            queue_url: queue_url.to_string(),
        }
    }
}

#[async_trait]
impl ResultBus for SqsBus {
    async fn publish(&self, report: &RunnerReport) -> Result<(), BusError> {
        let body = serde_json::to_string(report)?;
        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .message_group_id(report.runner_id.to_string())
            .message_deduplication_id(Uuid::new_v4().to_string())
            .send()
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn receive(&self) -> Result<Vec<RunnerReport>, BusError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(1)
            .wait_time_seconds(1)
            .visibility_timeout(1)
            .send()
            .await
            .map_err(|e| BusError::Receive(e.to_string()))?;

        let mut reports = Vec::new();
        for message in output.messages.unwrap_or_default() {
            if let Some(handle) = message.receipt_handle {
                if let Err(error) = self
                    .client
                    .delete_message()
                    .queue_url(&self.queue_url)
                    .receipt_handle(handle)
                    .send()
                    .await
                {
                    warn!(error = %error, "failed to delete consumed message");
                }
            }
            if let Some(report) = message.body.as_deref().and_then(|b| decode_report(b.as_bytes()))
            {
                reports.push(report);
            }
        }
        Ok(reports)
    }
}
