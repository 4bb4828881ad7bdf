//! Jobs created from integration messages.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::job::{JobMetadata, Priority, QueueJob};
use super::producer::JobProducer;
use crate::config::IntegrationConfig;
use crate::error::Result;

/// Direction of an integration message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

impl fmt::Display for MessageDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message received from, or destined for, an external system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationMessage {
    pub integration_id: String,
    pub message_id: String,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl IntegrationMessage {
    pub fn new(
        integration_id: impl Into<String>,
        message_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            integration_id: integration_id.into(),
            message_id: message_id.into(),
            payload,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Translates integration messages into queue jobs.
#[derive(Clone)]
pub struct IntegrationJobCreator {
    producer: JobProducer,
    config: IntegrationConfig,
}

impl IntegrationJobCreator {
    pub fn new(producer: JobProducer, config: IntegrationConfig) -> Self {
        Self { producer, config }
    }

    pub async fn create_inbound_job(&self, message: IntegrationMessage) -> Result<QueueJob> {
        self.create_job(MessageDirection::Inbound, message).await
    }

    pub async fn create_outbound_job(&self, message: IntegrationMessage) -> Result<QueueJob> {
        self.create_job(MessageDirection::Outbound, message).await
    }

    async fn create_job(
        &self,
        direction: MessageDirection,
        message: IntegrationMessage,
    ) -> Result<QueueJob> {
        let handler = match direction {
            MessageDirection::Inbound => &self.config.inbound_handler,
            MessageDirection::Outbound => &self.config.outbound_handler,
        };

        let mut metadata = JobMetadata::new()
            .with_source(format!("integration:{}", direction))
            .with("integration_id", message.integration_id.as_str())
            .with("message_id", message.message_id.as_str());
        // The message id doubles as correlation id when none is given.
        metadata.correlation_id = Some(
            message
                .correlation_id
                .clone()
                .unwrap_or_else(|| message.message_id.clone()),
        );

        let job = self
            .producer
            .create_job(
                handler,
                message.payload,
                Priority(self.config.priority),
                self.config.max_retries,
                metadata,
            )
            .await?;

        tracing::info!(
            job_id = %job.id,
            integration_id = %message.integration_id,
            message_id = %message.message_id,
            direction = %direction,
            "Integration job created"
        );
        Ok(job)
    }
}
