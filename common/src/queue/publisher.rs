// Notification publisher for NATS JetStream
// Used by event sources outside the scheduler and by end-to-end tests.

use crate::errors::QueueError;
use crate::models::{Notification, NotificationType};
use crate::queue::nats::NatsClient;
use std::time::Duration;
use tracing::{info, instrument};

#[async_trait::async_trait]
pub trait NotificationPublisher: Send + Sync {
    async fn publish(&self, notification: &Notification) -> Result<(), QueueError>;
}

/// Publishes notifications on `<prefix>.<type>` subjects
pub struct NatsNotificationPublisher {
    client: NatsClient,
    subject_prefix: String,
    publish_timeout: Duration,
}

impl NatsNotificationPublisher {
    /// The subject prefix is the configured subject filter without its wildcard
    pub fn new(client: NatsClient) -> Self {
        let subject_prefix = client
            .config()
            .subject
            .trim_end_matches(".>")
            .trim_end_matches(".*")
            .to_string();
        Self {
            client,
            subject_prefix,
            publish_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    fn subject(&self, notification_type: NotificationType) -> String {
        format!(
            "{}.{}",
            self.subject_prefix,
            notification_type.to_string().to_lowercase()
        )
    }
}

#[async_trait::async_trait]
impl NotificationPublisher for NatsNotificationPublisher {
    #[instrument(skip(self, notification), fields(notification_type = %notification.notification_type))]
    async fn publish(&self, notification: &Notification) -> Result<(), QueueError> {
        let payload = serde_json::to_vec(notification).map_err(|e| {
            QueueError::SerializationFailed(format!("Failed to serialize notification: {}", e))
        })?;
        let subject = self.subject(notification.notification_type);

        let ack = self
            .client
            .jetstream()
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| QueueError::PublishFailed(format!("Failed to publish message: {}", e)))?;

        match tokio::time::timeout(self.publish_timeout, ack).await {
            Ok(Ok(_)) => {
                info!(subject = %subject, "Notification published");
                Ok(())
            }
            Ok(Err(e)) => Err(QueueError::PublishFailed(format!(
                "Failed to get publish acknowledgment: {}",
                e
            ))),
            Err(_) => Err(QueueError::Timeout(format!(
                "Publish acknowledgment timeout after {:?}",
                self.publish_timeout
            ))),
        }
    }
}
