// Notification consumers
//
// Delivery is at-least-once: a notification is acknowledged only after the
// handler accepted it, and redelivered otherwise.

use crate::errors::QueueError;
use crate::models::Notification;
use crate::queue::nats::{NatsClient, ACK_WAIT};
use async_nats::jetstream::consumer::PullConsumer;
use async_nats::jetstream::{AckKind, Message};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, error, info, instrument, warn};

/// Consumes notifications from a source and hands them to a handler
#[async_trait::async_trait]
pub trait NotificationConsumer: Send + Sync {
    /// Start consuming notifications.
    /// Returns when shutdown is requested or the source is exhausted.
    async fn start(&self) -> Result<(), QueueError>;

    /// Request graceful shutdown
    fn shutdown(&self);
}

/// Callback invoked for every received notification
pub type NotificationHandler = Arc<
    dyn Fn(Notification) -> futures::future::BoxFuture<'static, Result<(), anyhow::Error>>
        + Send
        + Sync,
>;

#[derive(Default)]
struct Shutdown {
    flag: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    fn request(&self) {
        self.flag.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    fn requested(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// JetStream pull consumer for notifications
pub struct NatsNotificationConsumer {
    consumer: PullConsumer,
    handler: NotificationHandler,
    shutdown: Arc<Shutdown>,
}

impl NatsNotificationConsumer {
    #[instrument(skip(client, handler))]
    pub async fn new(client: &NatsClient, handler: NotificationHandler) -> Result<Self, QueueError> {
        info!("Creating NATS notification consumer");
        let consumer = client.get_or_create_consumer().await?;

        Ok(Self {
            consumer,
            handler,
            shutdown: Arc::new(Shutdown::default()),
        })
    }

    #[instrument(skip(self, message), fields(
        stream_sequence = ?message.info().map(|i| i.stream_sequence).ok(),
    ))]
    async fn process_message(&self, message: Message) -> Result<(), QueueError> {
        let notification: Notification = match serde_json::from_slice(&message.payload) {
            Ok(notification) => notification,
            Err(e) => {
                // A malformed payload will never parse; stop redelivery
                warn!(error = %e, subject = %message.subject, "Dropping malformed notification");
                message
                    .ack_with(AckKind::Term)
                    .await
                    .map_err(|e| QueueError::AckFailed(e.to_string()))?;
                return Err(QueueError::DeserializationFailed(e.to_string()));
            }
        };

        debug!(
            notification_type = %notification.notification_type,
            "Received notification"
        );

        // Handling waits for every schedule, launches included, so keep the
        // message from being redelivered while it is still in progress
        let handling = (self.handler)(notification);
        tokio::pin!(handling);
        let mut progress = tokio::time::interval_at(
            tokio::time::Instant::now() + ACK_WAIT / 2,
            ACK_WAIT / 2,
        );
        let result = loop {
            tokio::select! {
                result = &mut handling => break result,
                _ = progress.tick() => {
                    if let Err(e) = message.ack_with(AckKind::Progress).await {
                        warn!(error = %e, "Failed to extend ack deadline");
                    }
                }
            }
        };

        match result {
            Ok(()) => {
                message.ack().await.map_err(|e| {
                    QueueError::AckFailed(format!("Failed to acknowledge message: {}", e))
                })?;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Notification handling failed");

                // Negative acknowledge - message will be redelivered
                message.ack_with(AckKind::Nak(None)).await.map_err(|e| {
                    QueueError::AckFailed(format!("Failed to negative acknowledge message: {}", e))
                })?;

                Err(QueueError::ConsumeFailed(format!(
                    "Notification handling failed: {}",
                    e
                )))
            }
        }
    }
}

#[async_trait::async_trait]
impl NotificationConsumer for NatsNotificationConsumer {
    #[instrument(skip(self))]
    async fn start(&self) -> Result<(), QueueError> {
        info!("Starting notification consumer");

        let mut messages = self.consumer.messages().await.map_err(|e| {
            QueueError::ConsumeFailed(format!("Failed to create message stream: {}", e))
        })?;

        loop {
            if self.shutdown.requested() {
                info!("Shutdown requested, stopping consumer");
                break;
            }

            tokio::select! {
                message_result = messages.next() => {
                    match message_result {
                        Some(Ok(message)) => {
                            if let Err(e) = self.process_message(message).await {
                                error!(error = %e, "Failed to process message");
                            }
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Error receiving message");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                        None => {
                            warn!("Message stream ended unexpectedly");
                            break;
                        }
                    }
                }
                _ = self.shutdown.notify.notified() => {
                    info!("Shutdown notification received");
                    break;
                }
                // Periodically re-check the shutdown flag
                _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
            }
        }

        info!("Consumer stopped gracefully");
        Ok(())
    }

    fn shutdown(&self) {
        info!("Requesting consumer shutdown");
        self.shutdown.request();
    }
}

/// In-process notification source backed by a tokio channel
pub struct ChannelNotificationConsumer {
    receiver: Mutex<mpsc::Receiver<Notification>>,
    handler: NotificationHandler,
    shutdown: Arc<Shutdown>,
}

impl ChannelNotificationConsumer {
    /// Create a consumer together with the sender that feeds it
    pub fn new(capacity: usize, handler: NotificationHandler) -> (mpsc::Sender<Notification>, Self) {
        let (sender, receiver) = mpsc::channel(capacity);
        let consumer = Self {
            receiver: Mutex::new(receiver),
            handler,
            shutdown: Arc::new(Shutdown::default()),
        };
        (sender, consumer)
    }
}

#[async_trait::async_trait]
impl NotificationConsumer for ChannelNotificationConsumer {
    async fn start(&self) -> Result<(), QueueError> {
        let mut receiver = self.receiver.lock().await;
        loop {
            if self.shutdown.requested() {
                break;
            }
            tokio::select! {
                received = receiver.recv() => {
                    let Some(notification) = received else {
                        debug!("Notification channel closed");
                        break;
                    };
                    if let Err(e) = (self.handler)(notification).await {
                        error!(error = %e, "Notification handling failed");
                    }
                }
                _ = self.shutdown.notify.notified() => break,
            }
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.shutdown.request();
    }
}
