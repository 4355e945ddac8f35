//! Local broker backing for the result bus.
//!
//! Used by the container launcher: one ephemeral queue on a RabbitMQ
//! instance inside the shared bridge network. Consumption is auto-ack; a
//! lost window is corrected by the next cumulative-friendly report.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use tokio::sync::Mutex;

use crate::bus::{decode_report, BusError, ResultBus};
use crate::report::RunnerReport;

const RESULT_QUEUE: &str = "stampede-results";

pub struct AmqpBus {
    channel: Channel,
    consumer: Mutex<Consumer>,
}

impl AmqpBus {
    /// Connects and declares the result queue idempotently.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        channel
            .queue_declare(
                RESULT_QUEUE,
                QueueDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        let consumer = channel
            .basic_consume(
                RESULT_QUEUE,
                "stampede-controller",
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        Ok(Self {
            channel,
            consumer: Mutex::new(consumer),
        })
    }
}

#[async_trait]
impl ResultBus for AmqpBus {
    async fn publish(&self, report: &RunnerReport) -> Result<(), BusError> {
        let body = serde_json::to_vec(report)?;
        let _confirm = self
            .channel
            .basic_publish(
                "",
                RESULT_QUEUE,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default(),
            )
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn receive(&self) -> Result<Vec<RunnerReport>, BusError> {
        let mut consumer = self.consumer.lock().await;
        match tokio::time::timeout(Duration::from_secs(1), consumer.next()).await {
            Ok(Some(Ok(delivery))) => Ok(decode_report(&delivery.data).into_iter().collect()),
            Ok(Some(Err(error))) => Err(BusError::Receive(error.to_string())),
            // Stream closed or poll window elapsed without a message.
            Ok(None) | Err(_) => Ok(Vec::new()),
        }
    }
}
