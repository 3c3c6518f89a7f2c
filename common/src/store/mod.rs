// Schedule store
//
// The store is the single source of truth for schedules and their trigger
// satisfaction state. Every record carries a version that increases on each
// mutation; state writes are compare-and-set against that version.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryScheduleStore;
pub use postgres::PostgresScheduleStore;

use crate::errors::StoreError;
use crate::models::{ProgramId, ProgramSchedule, ScheduleId, ScheduleRecord, ScheduleStatus};
use crate::state::TriggerSatisfactionState;
use async_trait::async_trait;

/// Result of a compare-and-set state write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write went through; the record now has `version`
    Applied { version: i64 },
    /// The record changed since it was read
    Conflict { current_version: i64 },
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Persist a new schedule with empty state. Fails if the id is taken.
    async fn add_schedule(&self, schedule: ProgramSchedule) -> Result<ScheduleRecord, StoreError>;

    /// Replace a schedule's definition. Status is kept, state is reset.
    async fn update_schedule(&self, schedule: ProgramSchedule)
        -> Result<ScheduleRecord, StoreError>;

    async fn delete_schedule(&self, id: &ScheduleId) -> Result<(), StoreError>;

    async fn get_schedule(&self, id: &ScheduleId) -> Result<Option<ScheduleRecord>, StoreError>;

    /// All schedules, optionally restricted to one namespace
    async fn list_schedules(&self, namespace: Option<&str>)
        -> Result<Vec<ScheduleRecord>, StoreError>;

    /// Ids of schedules having a unit trigger with this key
    async fn list_schedules_by_trigger_key(&self, key: &str)
        -> Result<Vec<ScheduleId>, StoreError>;

    /// Schedules that launch `program`
    async fn list_schedules_by_program(
        &self,
        program: &ProgramId,
    ) -> Result<Vec<ScheduleRecord>, StoreError>;

    /// Change status and reset state
    async fn set_status(
        &self,
        id: &ScheduleId,
        status: ScheduleStatus,
        reason: Option<String>,
    ) -> Result<ScheduleRecord, StoreError>;

    /// Write state only if the record is still at `expected_version`.
    ///
    /// Returns `StoreError::NotFound` when the schedule no longer exists; the
    /// record is never recreated.
    async fn put_schedule_state(
        &self,
        id: &ScheduleId,
        expected_version: i64,
        state: &TriggerSatisfactionState,
    ) -> Result<CasOutcome, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}
