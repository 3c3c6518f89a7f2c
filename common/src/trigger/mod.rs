// Trigger variants and their satisfaction semantics
//
// A trigger is a tree: unit triggers (time, program status, partition, stream
// size) are the leaves and carry a trigger key used to route notifications;
// AND / OR composites combine children and are evaluated bottom-up against the
// notifications observed since the schedule's last reset.

pub mod composite;
pub mod partition;
pub mod program_status;
pub mod stream_size;
pub mod time;

pub use composite::CompositeTrigger;
pub use partition::PartitionTrigger;
pub use program_status::ProgramStatusTrigger;
pub use stream_size::StreamSizeTrigger;
pub use time::TimeTrigger;

use crate::errors::ValidationError;
use crate::models::{DatasetId, Notification, ProgramId, ProgramRunStatus, ProgramSchedule, StreamId};
use crate::state::ObservedNotifications;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// System argument carrying the JSON summary of the unit triggers
pub const TRIGGER_INFO_ARG: &str = "triggering.schedule.info";

pub fn time_key(timezone: &str, cron_expression: &str) -> String {
    format!("time:{}:{}", timezone, cron_expression.trim())
}

pub fn program_status_key(namespace: &str, application: &str, program: &str) -> String {
    format!("program_status:{}:{}:{}", namespace, application, program)
}

pub fn partition_key(namespace: &str, dataset: &str) -> String {
    format!("partition:{}:{}", namespace, dataset)
}

pub fn stream_size_key(namespace: &str, stream: &str) -> String {
    format!("stream_size:{}:{}", namespace, stream)
}

/// Behaviour shared by every leaf trigger.
///
/// `matched` is always the subset of notifications observed under the
/// trigger's own key that this trigger's predicate accepts, in arrival order.
pub trait UnitTrigger {
    fn trigger_key(&self) -> String;

    fn trigger_type(&self) -> &'static str;

    fn matches(&self, notification: &Notification) -> bool;

    fn is_satisfied_by(&self, matched: &[&Notification]) -> bool;

    fn update_launch_arguments(
        &self,
        matched: &[&Notification],
        system_args: &mut BTreeMap<String, String>,
        user_args: &mut BTreeMap<String, String>,
    );

    fn validate(&self) -> Result<(), ValidationError>;
}

/// Summary of one unit trigger, handed to launched programs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerInfo {
    pub trigger_type: String,
    pub trigger_key: String,
    pub matched_notifications: usize,
    pub satisfied: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Time(TimeTrigger),
    ProgramStatus(ProgramStatusTrigger),
    Partition(PartitionTrigger),
    StreamSize(StreamSizeTrigger),
    And(CompositeTrigger),
    Or(CompositeTrigger),
}

impl Trigger {
    pub fn time(cron_expression: impl Into<String>) -> Self {
        Trigger::Time(TimeTrigger::new(cron_expression))
    }

    pub fn program_status(program: ProgramId, statuses: Vec<ProgramRunStatus>) -> Self {
        Trigger::ProgramStatus(ProgramStatusTrigger::new(program, statuses))
    }

    pub fn partition(dataset: DatasetId, num_partitions: u32) -> Self {
        Trigger::Partition(PartitionTrigger::new(dataset, num_partitions))
    }

    pub fn stream_size(stream: StreamId, trigger_mb: u32) -> Self {
        Trigger::StreamSize(StreamSizeTrigger::new(stream, trigger_mb))
    }

    pub fn and(triggers: Vec<Trigger>) -> Self {
        Trigger::And(CompositeTrigger::new(triggers))
    }

    pub fn or(triggers: Vec<Trigger>) -> Self {
        Trigger::Or(CompositeTrigger::new(triggers))
    }

    /// The leaf behaviour of a unit trigger, `None` for composites
    pub fn as_unit(&self) -> Option<&dyn UnitTrigger> {
        match self {
            Trigger::Time(t) => Some(t),
            Trigger::ProgramStatus(t) => Some(t),
            Trigger::Partition(t) => Some(t),
            Trigger::StreamSize(t) => Some(t),
            Trigger::And(_) | Trigger::Or(_) => None,
        }
    }

    /// All leaves of the tree in depth-first order, duplicates included
    pub fn unit_triggers(&self) -> Vec<&Trigger> {
        let mut units = Vec::new();
        self.collect_units(&mut units);
        units
    }

    fn collect_units<'a>(&'a self, out: &mut Vec<&'a Trigger>) {
        match self {
            Trigger::And(c) | Trigger::Or(c) => {
                for child in &c.triggers {
                    child.collect_units(out);
                }
            }
            _ => out.push(self),
        }
    }

    /// Deduplicated keys of every unit trigger in the tree
    pub fn trigger_keys(&self) -> BTreeSet<String> {
        self.unit_triggers()
            .into_iter()
            .filter_map(Trigger::as_unit)
            .map(|unit| unit.trigger_key())
            .collect()
    }

    pub fn time_triggers(&self) -> Vec<&TimeTrigger> {
        self.unit_triggers()
            .into_iter()
            .filter_map(|t| match t {
                Trigger::Time(time) => Some(time),
                _ => None,
            })
            .collect()
    }

    /// Whether any unit trigger in the tree accepts the notification
    pub fn matches(&self, notification: &Notification) -> bool {
        match self {
            Trigger::And(c) | Trigger::Or(c) => c.triggers.iter().any(|t| t.matches(notification)),
            _ => self.as_unit().is_some_and(|unit| unit.matches(notification)),
        }
    }

    pub fn is_satisfied(&self, observed: &ObservedNotifications) -> bool {
        match self {
            Trigger::And(c) => c.all_satisfied(observed),
            Trigger::Or(c) => c.any_satisfied(observed),
            _ => match self.as_unit() {
                Some(unit) => unit.is_satisfied_by(&matched(unit, observed)),
                None => false,
            },
        }
    }

    /// Merge trigger-derived values into the launch arguments
    pub fn update_launch_arguments(
        &self,
        schedule: &ProgramSchedule,
        observed: &ObservedNotifications,
        system_args: &mut BTreeMap<String, String>,
        user_args: &mut BTreeMap<String, String>,
    ) {
        match self {
            Trigger::And(c) | Trigger::Or(c) => {
                for child in &c.triggers {
                    child.update_launch_arguments(schedule, observed, system_args, user_args);
                }
            }
            _ => {
                if let Some(unit) = self.as_unit() {
                    unit.update_launch_arguments(&matched(unit, observed), system_args, user_args);
                }
            }
        }
    }

    pub fn trigger_infos(&self, observed: &ObservedNotifications) -> Vec<TriggerInfo> {
        self.unit_triggers()
            .into_iter()
            .filter_map(Trigger::as_unit)
            .map(|unit| {
                let matched = matched(unit, observed);
                TriggerInfo {
                    trigger_type: unit.trigger_type().to_string(),
                    trigger_key: unit.trigger_key(),
                    matched_notifications: matched.len(),
                    satisfied: unit.is_satisfied_by(&matched),
                }
            })
            .collect()
    }

    pub fn references_program(&self, program: &ProgramId) -> bool {
        self.unit_triggers().into_iter().any(|t| match t {
            Trigger::ProgramStatus(p) => &p.program == program,
            _ => false,
        })
    }

    /// Simplify the tree given that `program` was deleted and will never emit
    /// another status notification.
    ///
    /// Returns `None` when the remaining trigger can never be satisfied.
    pub fn with_deleted_program(&self, program: &ProgramId) -> Option<Trigger> {
        match self {
            Trigger::ProgramStatus(p) if &p.program == program => None,
            Trigger::And(c) => c.and_with_deleted_program(program),
            Trigger::Or(c) => c.or_with_deleted_program(program),
            other => Some(other.clone()),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Trigger::And(c) | Trigger::Or(c) => c.validate(),
            _ => match self.as_unit() {
                Some(unit) => unit.validate(),
                None => Err(ValidationError::EmptyTrigger),
            },
        }
    }
}

fn matched<'a>(unit: &dyn UnitTrigger, observed: &'a ObservedNotifications) -> Vec<&'a Notification> {
    observed
        .get(&unit.trigger_key())
        .iter()
        .filter(|n| unit.matches(n))
        .collect()
}
