// Scheduler binary entry point

use anyhow::Context;
use common::config::{Settings, StoreBackend};
use common::db::DbPool;
use common::errors::SchedulerError;
use common::models::Notification;
use common::queue::{NatsClient, NatsNotificationConsumer, NotificationConsumer, NotificationHandler};
use common::retry::ExponentialBackoff;
use common::runtime::HttpProgramRuntime;
use common::scheduler::{Scheduler, SchedulerConfig, SchedulerService};
use common::store::{InMemoryScheduleStore, PostgresScheduleStore, ScheduleStore};
use common::telemetry;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    telemetry::init_metrics(settings.observability.metrics_port)?;

    info!(
        store_backend = ?settings.store.backend,
        nats_enabled = settings.nats.enabled,
        runtime_url = %settings.runtime.base_url,
        "Starting program trigger scheduler"
    );

    let store: Arc<dyn ScheduleStore> = match settings.store.backend {
        StoreBackend::Memory => {
            warn!("Using in-memory schedule store; state is lost on restart");
            Arc::new(InMemoryScheduleStore::new())
        }
        StoreBackend::Postgres => {
            let pool = DbPool::new(&settings.store.database).await.map_err(|e| {
                error!(error = %e, "Failed to initialize database pool");
                e
            })?;
            let store = PostgresScheduleStore::new(pool);
            if settings.store.run_migrations {
                store.migrate().await?;
                info!("Database migrations applied");
            }
            Arc::new(store)
        }
    };

    let runtime = Arc::new(HttpProgramRuntime::new(
        settings.runtime.base_url.clone(),
        settings.runtime.timeout_seconds,
    )?);
    let retry = Arc::new(ExponentialBackoff::from_config(&settings.retry));

    let service = Arc::new(SchedulerService::new(
        SchedulerConfig::from(&settings.scheduler),
        store,
        runtime,
        retry,
    ));

    let consumer: Option<Arc<NatsNotificationConsumer>> = if settings.nats.enabled {
        let client = NatsClient::new(settings.nats.clone()).await?;
        client.initialize_stream().await?;

        let handler: NotificationHandler = {
            let service = service.clone();
            Arc::new(move |notification: Notification| -> BoxFuture<'static, anyhow::Result<()>> {
                let service = service.clone();
                Box::pin(async move {
                    // Ack only once every interested schedule has applied it
                    match service.dispatch_and_wait(notification).await {
                        Ok(_) => Ok(()),
                        Err(SchedulerError::Notification(e)) => {
                            // Redelivery cannot fix a notification without a trigger key
                            warn!(error = %e, "Dropping notification that cannot be routed");
                            Ok(())
                        }
                        Err(e) if e.is_retryable() => Err(e.into()),
                        Err(e) => {
                            error!(error = %e, "Notification failed permanently, not redelivering");
                            Ok(())
                        }
                    }
                })
            })
        };
        Some(Arc::new(NatsNotificationConsumer::new(&client, handler).await?))
    } else {
        info!("NATS disabled; only time triggers will fire");
        None
    };

    let consumer_task = consumer.clone().map(|consumer| {
        tokio::spawn(async move {
            if let Err(e) = consumer.start().await {
                error!(error = %e, "Notification consumer failed");
            }
        })
    });

    let service_for_shutdown = service.clone();
    let consumer_for_shutdown = consumer.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C signal, initiating graceful shutdown");
        if let Some(consumer) = consumer_for_shutdown {
            consumer.shutdown();
        }
        if let Err(e) = service_for_shutdown.stop().await {
            error!(error = %e, "Error during scheduler shutdown");
        }
    });

    let result = service.start().await;
    if let Some(consumer) = &consumer {
        consumer.shutdown();
    }
    if let Some(task) = consumer_task {
        let _ = task.await;
    }
    telemetry::shutdown_tracer();

    result?;
    info!("Scheduler stopped");
    Ok(())
}
