use crate::constraint::Constraint;
use crate::errors::{NotificationError, ValidationError};
use crate::state::TriggerSatisfactionState;
use crate::trigger::{self, Trigger};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

lazy_static::lazy_static! {
    static ref IDENTIFIER: Regex =
        Regex::new(r"^[A-Za-z0-9_\-.]+$").expect("identifier pattern is valid");
}

/// Check that an identifier component can be embedded in a trigger key
pub fn validate_identifier(field: &str, value: &str) -> Result<(), ValidationError> {
    if IDENTIFIER.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::InvalidIdentifier {
            field: field.to_string(),
            value: value.to_string(),
        })
    }
}

// ============================================================================
// Identifiers
// ============================================================================

/// Identifies a launchable program
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProgramId {
    pub namespace: String,
    pub application: String,
    pub program: String,
}

impl ProgramId {
    pub fn new(
        namespace: impl Into<String>,
        application: impl Into<String>,
        program: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            application: application.into(),
            program: program.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_identifier("program.namespace", &self.namespace)?;
        validate_identifier("program.application", &self.application)?;
        validate_identifier("program.program", &self.program)
    }
}

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.namespace, self.application, self.program)
    }
}

/// Identifies a partitioned dataset
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DatasetId {
    pub namespace: String,
    pub dataset: String,
}

impl DatasetId {
    pub fn new(namespace: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            dataset: dataset.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_identifier("dataset.namespace", &self.namespace)?;
        validate_identifier("dataset.dataset", &self.dataset)
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.dataset)
    }
}

/// Identifies a stream whose growth can trigger a schedule
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId {
    pub namespace: String,
    pub stream: String,
}

impl StreamId {
    pub fn new(namespace: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            stream: stream.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_identifier("stream.namespace", &self.namespace)?;
        validate_identifier("stream.stream", &self.stream)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.stream)
    }
}

/// Identifies a schedule within a namespace
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScheduleId {
    pub namespace: String,
    pub name: String,
}

impl ScheduleId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_identifier("schedule.namespace", &self.namespace)?;
        validate_identifier("schedule.name", &self.name)
    }
}

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// Run identifier returned by the program runtime
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        RunId(value.to_string())
    }
}

// ============================================================================
// Notifications
// ============================================================================

/// Terminal program run status carried by program status notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgramRunStatus {
    Completed,
    Failed,
    Killed,
}

impl ProgramRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgramRunStatus::Completed => "COMPLETED",
            ProgramRunStatus::Failed => "FAILED",
            ProgramRunStatus::Killed => "KILLED",
        }
    }
}

impl FromStr for ProgramRunStatus {
    type Err = NotificationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "COMPLETED" => Ok(ProgramRunStatus::Completed),
            "FAILED" => Ok(ProgramRunStatus::Failed),
            "KILLED" => Ok(ProgramRunStatus::Killed),
            _ => Err(NotificationError::InvalidProperty {
                property: "status".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    Time,
    ProgramStatus,
    Partition,
    StreamSize,
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NotificationType::Time => "TIME",
            NotificationType::ProgramStatus => "PROGRAM_STATUS",
            NotificationType::Partition => "PARTITION",
            NotificationType::StreamSize => "STREAM_SIZE",
        };
        f.write_str(name)
    }
}

/// Notification property names
pub mod props {
    pub const CRON_EXPRESSION: &str = "cron_expression";
    pub const TIMEZONE: &str = "timezone";
    pub const FIRE_TIME: &str = "fire_time";
    pub const NAMESPACE: &str = "namespace";
    pub const APPLICATION: &str = "application";
    pub const PROGRAM: &str = "program";
    pub const STATUS: &str = "status";
    pub const RUN_ID: &str = "run_id";
    pub const DATASET: &str = "dataset";
    pub const PARTITION: &str = "partition";
    pub const NUM_PARTITIONS: &str = "num_partitions";
    pub const STREAM: &str = "stream";
    pub const SIZE_BYTES: &str = "size_bytes";
    pub const TIMESTAMP: &str = "timestamp";
}

/// An immutable event delivered to the scheduler.
///
/// Notifications have no identity beyond their content: two notifications with
/// the same type and properties are the same notification, which is what makes
/// duplicate delivery a no-op.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Notification {
    pub notification_type: NotificationType,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Notification {
    pub fn new(notification_type: NotificationType) -> Self {
        Self {
            notification_type,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// A cron fire of `cron_expression` evaluated in `timezone`
    pub fn time(cron_expression: &str, timezone: Tz, fire_time: DateTime<Utc>) -> Self {
        Self::new(NotificationType::Time)
            .with_property(props::CRON_EXPRESSION, cron_expression)
            .with_property(props::TIMEZONE, timezone.name())
            .with_property(props::FIRE_TIME, fire_time.timestamp_millis().to_string())
    }

    pub fn program_status(program: &ProgramId, status: ProgramRunStatus, run_id: &str) -> Self {
        Self::new(NotificationType::ProgramStatus)
            .with_property(props::NAMESPACE, &program.namespace)
            .with_property(props::APPLICATION, &program.application)
            .with_property(props::PROGRAM, &program.program)
            .with_property(props::STATUS, status.as_str())
            .with_property(props::RUN_ID, run_id)
    }

    pub fn partition(dataset: &DatasetId, partition: &str) -> Self {
        Self::new(NotificationType::Partition)
            .with_property(props::NAMESPACE, &dataset.namespace)
            .with_property(props::DATASET, &dataset.dataset)
            .with_property(props::PARTITION, partition)
    }

    pub fn stream_size(stream: &StreamId, size_bytes: u64, timestamp: DateTime<Utc>) -> Self {
        Self::new(NotificationType::StreamSize)
            .with_property(props::NAMESPACE, &stream.namespace)
            .with_property(props::STREAM, &stream.stream)
            .with_property(props::SIZE_BYTES, size_bytes.to_string())
            .with_property(props::TIMESTAMP, timestamp.timestamp_millis().to_string())
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    /// Get a property that the notification type requires
    pub fn required_property(&self, name: &str) -> Result<&str, NotificationError> {
        self.property(name)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| NotificationError::MissingProperty {
                notification_type: self.notification_type.to_string(),
                property: name.to_string(),
            })
    }

    /// Parse an optional numeric property, falling back to `default` when absent
    pub fn numeric_property(&self, name: &str, default: u64) -> Result<u64, NotificationError> {
        match self.property(name) {
            None => Ok(default),
            Some(value) => value
                .parse::<u64>()
                .map_err(|_| NotificationError::InvalidProperty {
                    property: name.to_string(),
                    value: value.to_string(),
                }),
        }
    }

    /// Derive the trigger key this notification routes to
    pub fn trigger_key(&self) -> Result<String, NotificationError> {
        match self.notification_type {
            NotificationType::Time => {
                let cron = self.required_property(props::CRON_EXPRESSION)?;
                let timezone = self.property(props::TIMEZONE).unwrap_or("UTC");
                Ok(trigger::time_key(timezone, cron))
            }
            NotificationType::ProgramStatus => Ok(trigger::program_status_key(
                self.required_property(props::NAMESPACE)?,
                self.required_property(props::APPLICATION)?,
                self.required_property(props::PROGRAM)?,
            )),
            NotificationType::Partition => Ok(trigger::partition_key(
                self.required_property(props::NAMESPACE)?,
                self.required_property(props::DATASET)?,
            )),
            NotificationType::StreamSize => Ok(trigger::stream_size_key(
                self.required_property(props::NAMESPACE)?,
                self.required_property(props::STREAM)?,
            )),
        }
    }
}

// ============================================================================
// Schedules
// ============================================================================

/// Binds a trigger and its constraints to a target program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramSchedule {
    pub id: ScheduleId,
    #[serde(default)]
    pub description: String,
    pub program: ProgramId,
    pub trigger: Trigger,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    /// Launch-time user arguments
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ProgramSchedule {
    pub fn new(id: ScheduleId, program: ProgramId, trigger: Trigger) -> Self {
        Self {
            id,
            description: String::new(),
            program,
            trigger,
            constraints: Vec::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Reject schedules that could never fire or cannot be routed
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.id.validate()?;
        self.program.validate()?;
        self.trigger.validate()?;
        for constraint in &self.constraints {
            constraint.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Enabled,
    Disabled,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Enabled => "enabled",
            ScheduleStatus::Disabled => "disabled",
        }
    }
}

impl FromStr for ScheduleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enabled" => Ok(ScheduleStatus::Enabled),
            "disabled" => Ok(ScheduleStatus::Disabled),
            other => Err(format!("unknown schedule status: {}", other)),
        }
    }
}

/// Observable lifecycle phase of a schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulePhase {
    Armed,
    PartiallySatisfied,
    TriggerSatisfied,
    Launching,
    Disabled,
}

/// A persisted schedule together with its satisfaction state.
///
/// `version` increases with every mutation of the record, whether it touches
/// the definition, the status or the state, and is the compare-and-set token
/// for state writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub schedule: ProgramSchedule,
    pub status: ScheduleStatus,
    pub disabled_reason: Option<String>,
    pub trigger_keys: BTreeSet<String>,
    pub state: TriggerSatisfactionState,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduleRecord {
    /// Build the initial record for a newly persisted schedule
    pub fn new(schedule: ProgramSchedule, now: DateTime<Utc>) -> Self {
        let trigger_keys = schedule.trigger.trigger_keys();
        Self {
            schedule,
            status: ScheduleStatus::Enabled,
            disabled_reason: None,
            trigger_keys,
            state: TriggerSatisfactionState::default(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> &ScheduleId {
        &self.schedule.id
    }

    pub fn is_enabled(&self) -> bool {
        self.status == ScheduleStatus::Enabled
    }

    pub fn phase(&self) -> SchedulePhase {
        if !self.is_enabled() {
            SchedulePhase::Disabled
        } else if self.state.launch_claim.is_some() {
            SchedulePhase::Launching
        } else if self.schedule.trigger.is_satisfied(&self.state.observed) {
            SchedulePhase::TriggerSatisfied
        } else if self.state.observed.is_empty() {
            SchedulePhase::Armed
        } else {
            SchedulePhase::PartiallySatisfied
        }
    }
}

/// Arguments handed to the program runtime on launch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchArguments {
    pub system_args: BTreeMap<String, String>,
    pub user_args: BTreeMap<String, String>,
}
