// Scheduler service: routes notifications to schedules and drives the tick loop

use crate::config::SchedulerSettings;
use crate::errors::{SchedulerError, StoreError};
use crate::models::{Notification, ScheduleId, ScheduleRecord};
use crate::retry::RetryStrategy;
use crate::runtime::ProgramRuntime;
use crate::scheduler::dispatch::{ShardedDispatcher, WorkItem};
use crate::scheduler::events::ScheduleEvent;
use crate::scheduler::processor::{ScheduleOutcome, ScheduleProcessor};
use crate::scheduler::time_events::TimeEventGenerator;
use crate::store::ScheduleStore;
use crate::telemetry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often cron fires are generated and held schedules re-checked
    pub poll_interval: Duration,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub max_cas_attempts: u32,
    /// Launch claims older than this are treated as abandoned
    pub claim_ttl: Duration,
    pub max_fires_per_tick: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            worker_count: 4,
            queue_capacity: 1024,
            max_cas_attempts: 10,
            claim_ttl: Duration::from_secs(300),
            max_fires_per_tick: 1000,
        }
    }
}

impl From<&SchedulerSettings> for SchedulerConfig {
    fn from(settings: &SchedulerSettings) -> Self {
        Self {
            poll_interval: Duration::from_secs(settings.poll_interval_seconds),
            worker_count: settings.worker_count,
            queue_capacity: settings.queue_capacity,
            max_cas_attempts: settings.max_cas_attempts,
            claim_ttl: Duration::from_secs(settings.claim_ttl_seconds),
            max_fires_per_tick: settings.max_fires_per_tick,
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub time_notifications: usize,
    pub dispatched: usize,
    /// Time notifications kept for the next tick after a dispatch failure
    pub deferred: usize,
    pub rechecked: usize,
}

/// Scheduler lifecycle
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Run recovery, then the tick loop until `stop` is called
    async fn start(&self) -> Result<(), SchedulerError>;

    /// Stop the loop and drain queued work
    async fn stop(&self) -> Result<(), SchedulerError>;

    /// Generate due time notifications and re-check held schedules
    async fn tick(&self) -> Result<TickSummary, SchedulerError>;
}

pub struct SchedulerService {
    pub(crate) config: SchedulerConfig,
    pub(crate) store: Arc<dyn ScheduleStore>,
    pub(crate) retry: Arc<dyn RetryStrategy>,
    pub(crate) processor: Arc<ScheduleProcessor>,
    pub(crate) events: broadcast::Sender<ScheduleEvent>,
    dispatcher: ShardedDispatcher,
    time_events: Mutex<TimeEventGenerator>,
    shutdown_tx: broadcast::Sender<()>,
    stopped: AtomicBool,
}

impl SchedulerService {
    /// Create the service and spawn its shard workers.
    /// Must be called inside a Tokio runtime.
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn ScheduleStore>,
        runtime: Arc<dyn ProgramRuntime>,
        retry: Arc<dyn RetryStrategy>,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        let (shutdown_tx, _) = broadcast::channel(1);

        let processor = Arc::new(ScheduleProcessor::new(
            store.clone(),
            runtime,
            retry.clone(),
            events.clone(),
            config.max_cas_attempts,
            config.claim_ttl,
        ));
        let dispatcher =
            ShardedDispatcher::spawn(processor.clone(), config.worker_count, config.queue_capacity);
        let time_events = Mutex::new(TimeEventGenerator::new(config.max_fires_per_tick));

        Self {
            config,
            store,
            retry,
            processor,
            events,
            dispatcher,
            time_events,
            shutdown_tx,
            stopped: AtomicBool::new(false),
        }
    }

    /// Receive schedule lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<ScheduleEvent> {
        self.events.subscribe()
    }

    /// Route a notification to the shard of every interested schedule.
    ///
    /// Returns how many schedules it was queued for. A notification that
    /// cannot be keyed is rejected; one nobody listens for is a no-op.
    #[instrument(skip(self, notification), fields(notification_type = %notification.notification_type))]
    pub async fn dispatch(&self, notification: Notification) -> Result<usize, SchedulerError> {
        if self.stopped.load(Ordering::Relaxed) {
            return Err(SchedulerError::ShuttingDown);
        }

        let key = notification.trigger_key()?;
        telemetry::record_notification_received(&notification.notification_type.to_string());

        let schedules = self.store.list_schedules_by_trigger_key(&key).await?;
        if schedules.is_empty() {
            debug!(trigger_key = %key, "No schedule listens for this notification");
            return Ok(0);
        }

        for schedule in &schedules {
            let queued = self
                .dispatcher
                .submit(WorkItem::Notification {
                    schedule: schedule.clone(),
                    key: key.clone(),
                    notification: notification.clone(),
                    done: None,
                })
                .await;
            if !queued {
                return Err(SchedulerError::ShuttingDown);
            }
        }

        debug!(trigger_key = %key, schedules = schedules.len(), "Notification dispatched");
        Ok(schedules.len())
    }

    /// Route a notification through the shards and wait until every
    /// interested schedule has applied it.
    ///
    /// Every schedule is processed even when one fails; the first failure is
    /// returned so the source can redeliver. Schedules that already recorded
    /// the notification treat the redelivery as a duplicate.
    #[instrument(skip(self, notification), fields(notification_type = %notification.notification_type))]
    pub async fn dispatch_and_wait(&self, notification: Notification) -> Result<usize, SchedulerError> {
        if self.stopped.load(Ordering::Relaxed) {
            return Err(SchedulerError::ShuttingDown);
        }

        let key = notification.trigger_key()?;
        telemetry::record_notification_received(&notification.notification_type.to_string());

        let schedules = self.store.list_schedules_by_trigger_key(&key).await?;
        let mut pending = Vec::with_capacity(schedules.len());
        for schedule in &schedules {
            let (done, result) = oneshot::channel();
            let queued = self
                .dispatcher
                .submit(WorkItem::Notification {
                    schedule: schedule.clone(),
                    key: key.clone(),
                    notification: notification.clone(),
                    done: Some(done),
                })
                .await;
            if !queued {
                return Err(SchedulerError::ShuttingDown);
            }
            pending.push((schedule, result));
        }

        let mut first_error = None;
        for (schedule, result) in pending {
            let error = match result.await {
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => e,
                Err(_) => SchedulerError::ShuttingDown,
            };
            warn!(schedule = %schedule, error = %error, "Schedule failed to apply notification");
            first_error.get_or_insert(error);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(schedules.len()),
        }
    }

    /// Apply a notification to one schedule on the caller's task
    pub async fn process_notification(
        &self,
        id: &ScheduleId,
        notification: &Notification,
    ) -> Result<ScheduleOutcome, SchedulerError> {
        let key = notification.trigger_key()?;
        self.processor.process_notification(id, &key, notification).await
    }

    /// Route a notification and process it inline, bypassing the shards
    pub async fn handle_notification(
        &self,
        notification: &Notification,
    ) -> Result<Vec<(ScheduleId, ScheduleOutcome)>, SchedulerError> {
        let key = notification.trigger_key()?;
        telemetry::record_notification_received(&notification.notification_type.to_string());

        let mut outcomes = Vec::new();
        for schedule in self.store.list_schedules_by_trigger_key(&key).await? {
            let outcome = self
                .processor
                .process_notification(&schedule, &key, notification)
                .await?;
            outcomes.push((schedule, outcome));
        }
        Ok(outcomes)
    }

    /// Wait until all work queued so far has been processed
    pub async fn flush(&self) {
        self.dispatcher.flush().await;
    }

    /// Run one tick as of `now`
    #[instrument(skip(self))]
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickSummary, SchedulerError> {
        let records = self.store.list_schedules(None).await?;
        let notifications = self.time_events.lock().await.generate(&records, now);

        let mut summary = TickSummary {
            time_notifications: notifications.len(),
            ..TickSummary::default()
        };

        // A fire that fails to dispatch is kept for the next tick; the rest of
        // the window still goes out
        let mut deferred = Vec::new();
        let mut shutting_down = false;
        for notification in notifications {
            if shutting_down {
                deferred.push(notification);
                continue;
            }
            match self.dispatch(notification.clone()).await {
                Ok(queued) => summary.dispatched += queued,
                Err(SchedulerError::ShuttingDown) => {
                    shutting_down = true;
                    deferred.push(notification);
                }
                Err(SchedulerError::Notification(e)) => {
                    warn!(error = %e, "Dropping time notification that cannot be routed");
                }
                Err(e) => {
                    warn!(error = %e, "Failed to dispatch time notification, deferring to next tick");
                    deferred.push(notification);
                }
            }
        }
        summary.deferred = deferred.len();
        if !deferred.is_empty() {
            self.time_events.lock().await.defer(deferred);
        }
        if shutting_down {
            return Err(SchedulerError::ShuttingDown);
        }

        for record in records.iter().filter(|r| self.needs_recheck(r, now)) {
            let queued = self
                .dispatcher
                .submit(WorkItem::Recheck {
                    schedule: record.id().clone(),
                })
                .await;
            if !queued {
                return Err(SchedulerError::ShuttingDown);
            }
            summary.rechecked += 1;
        }

        if summary != TickSummary::default() {
            debug!(
                time_notifications = summary.time_notifications,
                dispatched = summary.dispatched,
                deferred = summary.deferred,
                rechecked = summary.rechecked,
                "Tick complete"
            );
        }
        Ok(summary)
    }

    /// Held schedules and schedules whose launch claim was abandoned
    fn needs_recheck(&self, record: &ScheduleRecord, now: DateTime<Utc>) -> bool {
        if !record.is_enabled() {
            return false;
        }
        let ttl = chrono::Duration::from_std(self.config.claim_ttl)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        match &record.state.launch_claim {
            Some(_) => record.state.claim_is_stale(now, ttl),
            None => record.state.is_held(),
        }
    }

    /// Wait for the store to become reachable, then re-check held schedules
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<TickSummary, SchedulerError> {
        let mut attempt = 0u32;
        loop {
            match self.store.health_check().await {
                Ok(()) => break,
                Err(e) => match self.retry.next_delay(attempt) {
                    Some(delay) => {
                        warn!(
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Schedule store not ready, retrying"
                        );
                        sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        return Err(StoreError::HealthCheckFailed(format!(
                            "store unavailable after {} attempts: {}",
                            attempt + 1,
                            e
                        ))
                        .into())
                    }
                },
            }
        }

        info!("Schedule store reachable, re-checking held schedules");
        self.tick_at(Utc::now()).await
    }
}

#[async_trait]
impl Scheduler for SchedulerService {
    #[instrument(skip(self))]
    async fn start(&self) -> Result<(), SchedulerError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if self.stopped.load(Ordering::Relaxed) {
            return Err(SchedulerError::ShuttingDown);
        }

        self.recover().await?;
        info!(
            poll_interval_seconds = self.config.poll_interval.as_secs(),
            "Starting scheduler"
        );

        let mut poll_interval = interval(self.config.poll_interval);
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    if let Err(e) = self.tick().await {
                        match e {
                            SchedulerError::ShuttingDown => break,
                            e => error!(error = %e, "Scheduler tick failed"),
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping scheduler");
                    break;
                }
            }
        }

        info!("Scheduler loop stopped");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self) -> Result<(), SchedulerError> {
        if self.stopped.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        info!("Stopping scheduler");
        let _ = self.shutdown_tx.send(());
        self.dispatcher.shutdown().await;
        info!("Scheduler stopped gracefully");
        Ok(())
    }

    async fn tick(&self) -> Result<TickSummary, SchedulerError> {
        self.tick_at(Utc::now()).await
    }
}
