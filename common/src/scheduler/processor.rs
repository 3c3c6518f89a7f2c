// Per-schedule read-modify-write of trigger satisfaction state
//
// Every write is a compare-and-set against the version that was read. A
// conflict means someone else changed the record (another notification, an
// admin update, a status change) and the whole step is redone on a fresh read.
// A launch is guarded by a claim written before the runtime is called, so a
// conflict can never cause a second launch for the same cycle.

use crate::constraint::{evaluate_constraints, ConstraintContext, ConstraintResult};
use crate::errors::{SchedulerError, StoreError};
use crate::models::{LaunchArguments, Notification, ProgramSchedule, RunId, ScheduleId, ScheduleRecord};
use crate::retry::RetryStrategy;
use crate::runtime::ProgramRuntime;
use crate::scheduler::events::ScheduleEvent;
use crate::state::{ObservedNotifications, TriggerSatisfactionState};
use crate::store::{CasOutcome, ScheduleStore};
use crate::telemetry;
use crate::trigger::TRIGGER_INFO_ARG;
use chrono::Utc;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub const SCHEDULE_NAME_ARG: &str = "schedule.name";
pub const SCHEDULE_NAMESPACE_ARG: &str = "schedule.namespace";

/// What happened to a schedule after a notification or re-check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// Schedule missing, disabled, or not interested in the notification
    Ignored,
    /// The notification was already recorded
    Duplicate,
    PartiallySatisfied,
    /// Trigger satisfied but a constraint asked to wait
    Held { retry_after: Option<Duration> },
    /// Another launch of this schedule is in progress
    Busy,
    Skipped,
    Launched(RunId),
    LaunchFailed,
}

enum Step {
    Write(ScheduleOutcome),
    Claim(Uuid),
}

/// Build the arguments handed to the program runtime
pub fn build_launch_arguments(
    schedule: &ProgramSchedule,
    observed: &ObservedNotifications,
) -> LaunchArguments {
    let mut system_args = BTreeMap::new();
    let mut user_args = schedule.properties.clone();

    schedule
        .trigger
        .update_launch_arguments(schedule, observed, &mut system_args, &mut user_args);

    system_args.insert(SCHEDULE_NAME_ARG.to_string(), schedule.id.name.clone());
    system_args.insert(
        SCHEDULE_NAMESPACE_ARG.to_string(),
        schedule.id.namespace.clone(),
    );
    match serde_json::to_string(&schedule.trigger.trigger_infos(observed)) {
        Ok(info) => {
            system_args.insert(TRIGGER_INFO_ARG.to_string(), info);
        }
        Err(e) => warn!(error = %e, "Failed to serialize trigger info"),
    }

    LaunchArguments {
        system_args,
        user_args,
    }
}

pub struct ScheduleProcessor {
    store: Arc<dyn ScheduleStore>,
    runtime: Arc<dyn ProgramRuntime>,
    retry: Arc<dyn RetryStrategy>,
    events: broadcast::Sender<ScheduleEvent>,
    max_cas_attempts: u32,
    claim_ttl: chrono::Duration,
}

impl ScheduleProcessor {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        runtime: Arc<dyn ProgramRuntime>,
        retry: Arc<dyn RetryStrategy>,
        events: broadcast::Sender<ScheduleEvent>,
        max_cas_attempts: u32,
        claim_ttl: Duration,
    ) -> Self {
        Self {
            store,
            runtime,
            retry,
            events,
            max_cas_attempts: max_cas_attempts.max(1),
            claim_ttl: chrono::Duration::from_std(claim_ttl)
                .unwrap_or_else(|_| chrono::Duration::minutes(5)),
        }
    }

    fn publish(&self, event: ScheduleEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Apply one routed notification to one schedule
    #[instrument(skip(self, notification), fields(schedule = %id, trigger_key = key))]
    pub async fn process_notification(
        &self,
        id: &ScheduleId,
        key: &str,
        notification: &Notification,
    ) -> Result<ScheduleOutcome, SchedulerError> {
        self.with_store_retry(move || self.advance(id, Some((key, notification))))
            .await
    }

    /// Re-evaluate a held schedule without new input
    #[instrument(skip(self), fields(schedule = %id))]
    pub async fn recheck(&self, id: &ScheduleId) -> Result<ScheduleOutcome, SchedulerError> {
        self.with_store_retry(move || self.advance(id, None)).await
    }

    /// Run a store-backed step, retrying transient store failures under the
    /// retry policy. Each attempt starts from a fresh read, so a write that
    /// failed after being applied shows up as a duplicate or a held claim.
    async fn with_store_retry<T, F, Fut>(&self, step: F) -> Result<T, SchedulerError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, SchedulerError>>,
    {
        let mut attempt = 0u32;
        loop {
            match step().await {
                Err(SchedulerError::Store(e)) if e.is_transient() => {
                    match self.retry.next_delay(attempt) {
                        Some(delay) => {
                            warn!(
                                attempt = attempt + 1,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "Schedule store failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        None => return Err(SchedulerError::Store(e)),
                    }
                }
                other => return other,
            }
        }
    }

    async fn advance(
        &self,
        id: &ScheduleId,
        incoming: Option<(&str, &Notification)>,
    ) -> Result<ScheduleOutcome, SchedulerError> {
        for _ in 0..self.max_cas_attempts {
            let Some(record) = self.store.get_schedule(id).await? else {
                debug!("Schedule no longer exists");
                return Ok(ScheduleOutcome::Ignored);
            };
            if !record.is_enabled() {
                return Ok(ScheduleOutcome::Ignored);
            }

            let now = Utc::now();
            let mut state = record.state.clone();

            if let Some((key, notification)) = incoming {
                if !record.schedule.trigger.matches(notification) {
                    return Ok(ScheduleOutcome::Ignored);
                }
                if !state.observe(key, notification.clone()) {
                    debug!("Notification already observed");
                    return Ok(ScheduleOutcome::Duplicate);
                }
            }

            if state.claim_is_stale(now, self.claim_ttl) {
                warn!("Releasing abandoned launch claim");
                state.release_claim();
            }

            let step = self.decide(&record, &mut state).await;

            if let Step::Write(outcome) = &step {
                if state == record.state {
                    return Ok(outcome.clone());
                }
            }

            match self
                .store
                .put_schedule_state(id, record.version, &state)
                .await
            {
                Ok(CasOutcome::Applied { .. }) => {}
                Ok(CasOutcome::Conflict { current_version }) => {
                    telemetry::record_cas_conflict(&id.to_string());
                    debug!(
                        read_version = record.version,
                        current_version, "State write conflicted, retrying"
                    );
                    continue;
                }
                Err(StoreError::NotFound(_)) => {
                    debug!("Schedule deleted during evaluation");
                    return Ok(ScheduleOutcome::Ignored);
                }
                Err(e) => return Err(e.into()),
            }

            return match step {
                Step::Write(ScheduleOutcome::Skipped) => {
                    info!("Constraint skipped this cycle");
                    telemetry::record_skip(&id.to_string());
                    self.publish(ScheduleEvent::Skipped {
                        schedule: id.clone(),
                        at: now,
                    });
                    Ok(ScheduleOutcome::Skipped)
                }
                Step::Write(outcome) => Ok(outcome),
                Step::Claim(token) => self.launch(&record.schedule, &state.observed, token).await,
            };
        }

        Err(SchedulerError::CasExhausted {
            schedule: id.to_string(),
            attempts: self.max_cas_attempts,
        })
    }

    /// Decide the next step for a freshly read record, mutating `state` into
    /// what should be written
    async fn decide(&self, record: &ScheduleRecord, state: &mut TriggerSatisfactionState) -> Step {
        let schedule = &record.schedule;
        if !schedule.trigger.is_satisfied(&state.observed) {
            return Step::Write(ScheduleOutcome::PartiallySatisfied);
        }
        if state.launch_claim.is_some() {
            return Step::Write(ScheduleOutcome::Busy);
        }

        let now = Utc::now();
        let satisfied_at = *state.satisfied_at.get_or_insert(now);
        let ctx = ConstraintContext {
            program: &schedule.program,
            satisfied_at: Some(satisfied_at),
            now,
            runtime: self.runtime.as_ref(),
        };

        match evaluate_constraints(&schedule.constraints, &ctx).await {
            ConstraintResult::Satisfied => Step::Claim(state.claim(now)),
            ConstraintResult::NotSatisfied { retry_after } => {
                debug!(?retry_after, "Trigger satisfied, waiting on constraints");
                Step::Write(ScheduleOutcome::Held { retry_after })
            }
            ConstraintResult::Skip => {
                state.reset_cycle();
                Step::Write(ScheduleOutcome::Skipped)
            }
        }
    }

    /// Launch under a claim we hold, then reset or release
    async fn launch(
        &self,
        schedule: &ProgramSchedule,
        snapshot: &ObservedNotifications,
        token: Uuid,
    ) -> Result<ScheduleOutcome, SchedulerError> {
        let arguments = build_launch_arguments(schedule, snapshot);
        let schedule_name = schedule.id.to_string();

        match self.launch_with_retry(schedule, &arguments).await {
            Ok(run_id) => {
                info!(program = %schedule.program, run_id = %run_id, "Schedule launched program");
                telemetry::record_launch(&schedule_name, &schedule.program.to_string());

                let now = Utc::now();
                let complete = |record: &ScheduleRecord, state: &mut TriggerSatisfactionState| {
                    let mut remaining = state.observed.clone();
                    remaining.subtract(snapshot);
                    state.complete_launch(now, &run_id);
                    // Notifications that arrived during the launch start the next cycle
                    if record.schedule.trigger.is_satisfied(&remaining) {
                        state.satisfied_at = Some(now);
                    }
                    state.observed = remaining;
                };
                // A reset that never lands would leave a stale claim behind and
                // the cycle would launch again once it expires
                let finished = self
                    .with_store_retry(|| self.update_claimed(&schedule.id, token, &complete))
                    .await;
                if let Err(e) = finished {
                    error!(error = %e, "Launched but failed to reset schedule state");
                }

                self.publish(ScheduleEvent::Launched {
                    schedule: schedule.id.clone(),
                    program: schedule.program.clone(),
                    run_id: run_id.clone(),
                    at: now,
                });
                Ok(ScheduleOutcome::Launched(run_id))
            }
            Err(SchedulerError::LaunchFailed {
                attempts, source, ..
            }) => {
                error!(attempts, error = %source, "Launch failed, keeping trigger state");
                telemetry::record_launch_failure(&schedule_name, &source.to_string());

                if let Err(e) = self
                    .with_store_retry(|| {
                        self.update_claimed(&schedule.id, token, |_, state| state.release_claim())
                    })
                    .await
                {
                    error!(error = %e, "Failed to release launch claim");
                }

                self.publish(ScheduleEvent::LaunchFailed {
                    schedule: schedule.id.clone(),
                    attempts,
                    error: source.to_string(),
                    at: Utc::now(),
                });
                Ok(ScheduleOutcome::LaunchFailed)
            }
            Err(e) => Err(e),
        }
    }

    async fn launch_with_retry(
        &self,
        schedule: &ProgramSchedule,
        arguments: &LaunchArguments,
    ) -> Result<RunId, SchedulerError> {
        let mut attempt = 0u32;
        loop {
            let started = Instant::now();
            let result = self.runtime.launch(&schedule.program, arguments).await;
            telemetry::record_launch_duration(
                &schedule.id.to_string(),
                started.elapsed().as_secs_f64(),
            );

            match result {
                Ok(run_id) => return Ok(run_id),
                Err(e) => match self.retry.next_delay(attempt) {
                    Some(delay) => {
                        warn!(
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Launch failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        return Err(SchedulerError::LaunchFailed {
                            schedule: schedule.id.to_string(),
                            attempts: attempt + 1,
                            source: e,
                        })
                    }
                },
            }
        }
    }

    /// Apply `update` to the schedule's state while it is still claimed by
    /// `token`. Does nothing once the claim is gone (reset, update, delete).
    async fn update_claimed<F>(
        &self,
        id: &ScheduleId,
        token: Uuid,
        update: F,
    ) -> Result<(), SchedulerError>
    where
        F: Fn(&ScheduleRecord, &mut TriggerSatisfactionState),
    {
        for _ in 0..self.max_cas_attempts {
            let Some(record) = self.store.get_schedule(id).await? else {
                return Ok(());
            };
            if !record.state.is_claimed_by(token) {
                debug!("Launch claim no longer held, leaving state untouched");
                return Ok(());
            }

            let mut state = record.state.clone();
            update(&record, &mut state);

            match self
                .store
                .put_schedule_state(id, record.version, &state)
                .await
            {
                Ok(CasOutcome::Applied { .. }) => return Ok(()),
                Ok(CasOutcome::Conflict { .. }) => {
                    telemetry::record_cas_conflict(&id.to_string());
                    continue;
                }
                Err(StoreError::NotFound(_)) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }

        Err(SchedulerError::CasExhausted {
            schedule: id.to_string(),
            attempts: self.max_cas_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DatasetId, ProgramId, ProgramRunStatus};
    use crate::trigger::Trigger;

    #[test]
    fn test_launch_arguments_include_schedule_and_trigger_info() {
        let dataset = DatasetId::new("ns", "events");
        let schedule = ProgramSchedule::new(
            ScheduleId::new("ns", "load"),
            ProgramId::new("ns", "app", "loader"),
            Trigger::and(vec![
                Trigger::partition(dataset.clone(), 1),
                Trigger::program_status(ProgramId::new("ns", "app", "upstream"), vec![]),
            ]),
        )
        .with_property("output", "/data/out");

        let mut observed = ObservedNotifications::new();
        let partition = Notification::partition(&dataset, "2024/01/01");
        observed.record(&partition.trigger_key().unwrap(), partition);
        let status = Notification::program_status(
            &ProgramId::new("ns", "app", "upstream"),
            ProgramRunStatus::Completed,
            "run-7",
        );
        observed.record(&status.trigger_key().unwrap(), status);

        let args = build_launch_arguments(&schedule, &observed);

        assert_eq!(args.user_args.get("output"), Some(&"/data/out".to_string()));
        assert_eq!(args.system_args.get(SCHEDULE_NAME_ARG), Some(&"load".to_string()));
        assert_eq!(
            args.system_args.get(SCHEDULE_NAMESPACE_ARG),
            Some(&"ns".to_string())
        );
        assert_eq!(
            args.system_args
                .get("triggering.program.ns.app.upstream.run_id"),
            Some(&"run-7".to_string())
        );
        assert_eq!(
            args.system_args.get("triggering.partition.ns.events.paths"),
            Some(&"2024/01/01".to_string())
        );

        let info: serde_json::Value =
            serde_json::from_str(args.system_args.get(TRIGGER_INFO_ARG).unwrap()).unwrap();
        assert_eq!(info.as_array().unwrap().len(), 2);
        assert_eq!(info[0]["satisfied"], true);
    }
}
