// Schedule administration
//
// Every operation goes through the store and bumps the record version, so a
// notification being evaluated concurrently fails its write and re-reads.

use crate::errors::{SchedulerError, StoreError};
use crate::models::{ProgramId, ProgramSchedule, ScheduleId, ScheduleRecord, ScheduleStatus};
use crate::scheduler::engine::SchedulerService;
use crate::scheduler::events::ScheduleEvent;
use crate::store::CasOutcome;
use crate::telemetry;
use chrono::Utc;
use std::collections::BTreeSet;
use tracing::{info, instrument, warn};

/// Schedules touched by a program deletion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramDeletionSummary {
    /// Schedules that launched the deleted program
    pub deleted: Vec<ScheduleId>,
    /// Schedules whose trigger lost a branch but can still fire
    pub simplified: Vec<ScheduleId>,
    /// Schedules that can never fire again
    pub disabled: Vec<ScheduleId>,
}

impl SchedulerService {
    #[instrument(skip(self, schedule), fields(schedule = %schedule.id))]
    pub async fn create_schedule(
        &self,
        schedule: ProgramSchedule,
    ) -> Result<ScheduleRecord, SchedulerError> {
        schedule.validate()?;
        let record = self.store.add_schedule(schedule).await?;
        info!(trigger_keys = record.trigger_keys.len(), "Schedule created");
        Ok(record)
    }

    /// Replace a schedule definition; observed notifications are discarded
    #[instrument(skip(self, schedule), fields(schedule = %schedule.id))]
    pub async fn update_schedule(
        &self,
        schedule: ProgramSchedule,
    ) -> Result<ScheduleRecord, SchedulerError> {
        schedule.validate()?;
        let record = self.store.update_schedule(schedule).await?;
        info!(version = record.version, "Schedule updated");
        Ok(record)
    }

    #[instrument(skip(self))]
    pub async fn delete_schedule(&self, id: &ScheduleId) -> Result<(), SchedulerError> {
        self.store.delete_schedule(id).await?;
        info!("Schedule deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn enable_schedule(&self, id: &ScheduleId) -> Result<ScheduleRecord, SchedulerError> {
        let record = self
            .store
            .set_status(id, ScheduleStatus::Enabled, None)
            .await?;
        info!("Schedule enabled");
        Ok(record)
    }

    #[instrument(skip(self))]
    pub async fn disable_schedule(
        &self,
        id: &ScheduleId,
        reason: Option<String>,
    ) -> Result<ScheduleRecord, SchedulerError> {
        let record = self
            .store
            .set_status(id, ScheduleStatus::Disabled, reason.clone())
            .await?;
        info!(reason = ?reason, "Schedule disabled");
        let _ = self.events.send(ScheduleEvent::Disabled {
            schedule: id.clone(),
            reason,
            at: Utc::now(),
        });
        Ok(record)
    }

    /// Discard observed notifications and any pending launch claim
    #[instrument(skip(self))]
    pub async fn reset_schedule(&self, id: &ScheduleId) -> Result<ScheduleRecord, SchedulerError> {
        for _ in 0..self.config.max_cas_attempts {
            let mut record = self
                .store
                .get_schedule(id)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("schedule {}", id)))?;

            record.state.reset_cycle();
            match self
                .store
                .put_schedule_state(id, record.version, &record.state)
                .await?
            {
                CasOutcome::Applied { version } => {
                    info!(version, "Schedule state reset");
                    record.version = version;
                    return Ok(record);
                }
                CasOutcome::Conflict { .. } => {
                    telemetry::record_cas_conflict(&id.to_string());
                    continue;
                }
            }
        }

        Err(SchedulerError::CasExhausted {
            schedule: id.to_string(),
            attempts: self.config.max_cas_attempts,
        })
    }

    pub async fn get_schedule(
        &self,
        id: &ScheduleId,
    ) -> Result<Option<ScheduleRecord>, SchedulerError> {
        Ok(self.store.get_schedule(id).await?)
    }

    pub async fn list_schedules(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<ScheduleRecord>, SchedulerError> {
        Ok(self.store.list_schedules(namespace).await?)
    }

    /// React to the removal of a program.
    ///
    /// Schedules launching the program are deleted. Schedules whose trigger
    /// waits on the program's status are rewritten without that branch, or
    /// disabled when what remains can never be satisfied.
    #[instrument(skip(self), fields(program = %program))]
    pub async fn handle_program_deleted(
        &self,
        program: &ProgramId,
    ) -> Result<ProgramDeletionSummary, SchedulerError> {
        let mut summary = ProgramDeletionSummary::default();

        let mut deleted = BTreeSet::new();
        for record in self.store.list_schedules_by_program(program).await? {
            match self.store.delete_schedule(record.id()).await {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            deleted.insert(record.id().clone());
        }
        summary.deleted = deleted.iter().cloned().collect();

        for record in self.store.list_schedules(None).await? {
            if deleted.contains(record.id()) || !record.schedule.trigger.references_program(program)
            {
                continue;
            }

            match record.schedule.trigger.with_deleted_program(program) {
                Some(trigger) => {
                    let mut schedule = record.schedule.clone();
                    schedule.trigger = trigger;
                    self.store.update_schedule(schedule).await?;
                    info!(schedule = %record.id(), "Trigger simplified after program deletion");
                    summary.simplified.push(record.id().clone());
                }
                None => {
                    let reason = format!("unsatisfiable: program {} deleted", program);
                    warn!(schedule = %record.id(), "Trigger can no longer be satisfied");
                    self.disable_schedule(record.id(), Some(reason)).await?;
                    summary.disabled.push(record.id().clone());
                }
            }
        }

        info!(
            deleted = summary.deleted.len(),
            simplified = summary.simplified.len(),
            disabled = summary.disabled.len(),
            "Program deletion handled"
        );
        Ok(summary)
    }
}
