// Queue module for NATS JetStream integration

pub mod consumer;
pub mod nats;
pub mod publisher;

pub use consumer::{
    ChannelNotificationConsumer, NatsNotificationConsumer, NotificationConsumer,
    NotificationHandler,
};
pub use nats::NatsClient;
pub use publisher::{NatsNotificationPublisher, NotificationPublisher};
