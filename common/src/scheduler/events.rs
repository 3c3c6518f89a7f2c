// Schedule lifecycle events published by the scheduler

use crate::models::{ProgramId, RunId, ScheduleId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScheduleEvent {
    Launched {
        schedule: ScheduleId,
        program: ProgramId,
        run_id: RunId,
        at: DateTime<Utc>,
    },
    /// A constraint skipped the cycle; state was reset without launching
    Skipped {
        schedule: ScheduleId,
        at: DateTime<Utc>,
    },
    /// Launch retries were exhausted; trigger state is kept
    LaunchFailed {
        schedule: ScheduleId,
        attempts: u32,
        error: String,
        at: DateTime<Utc>,
    },
    Disabled {
        schedule: ScheduleId,
        reason: Option<String>,
        at: DateTime<Utc>,
    },
}

impl ScheduleEvent {
    pub fn schedule(&self) -> &ScheduleId {
        match self {
            ScheduleEvent::Launched { schedule, .. }
            | ScheduleEvent::Skipped { schedule, .. }
            | ScheduleEvent::LaunchFailed { schedule, .. }
            | ScheduleEvent::Disabled { schedule, .. } => schedule,
        }
    }
}
