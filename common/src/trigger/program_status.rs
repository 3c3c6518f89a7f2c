use super::{program_status_key, UnitTrigger};
use crate::errors::ValidationError;
use crate::models::{props, Notification, NotificationType, ProgramId, ProgramRunStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

fn default_statuses() -> Vec<ProgramRunStatus> {
    vec![ProgramRunStatus::Completed]
}

/// Fires when an upstream program reaches one of the given terminal statuses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramStatusTrigger {
    pub program: ProgramId,
    #[serde(default = "default_statuses")]
    pub statuses: Vec<ProgramRunStatus>,
}

impl ProgramStatusTrigger {
    /// An empty status list means "completed"
    pub fn new(program: ProgramId, statuses: Vec<ProgramRunStatus>) -> Self {
        let statuses = if statuses.is_empty() {
            default_statuses()
        } else {
            statuses
        };
        Self { program, statuses }
    }

    fn argument_prefix(&self) -> String {
        format!(
            "triggering.program.{}.{}.{}",
            self.program.namespace, self.program.application, self.program.program
        )
    }
}

impl UnitTrigger for ProgramStatusTrigger {
    fn trigger_key(&self) -> String {
        program_status_key(
            &self.program.namespace,
            &self.program.application,
            &self.program.program,
        )
    }

    fn trigger_type(&self) -> &'static str {
        "program_status"
    }

    fn matches(&self, notification: &Notification) -> bool {
        if notification.notification_type != NotificationType::ProgramStatus {
            return false;
        }
        let same_program = notification.property(props::NAMESPACE)
            == Some(self.program.namespace.as_str())
            && notification.property(props::APPLICATION) == Some(self.program.application.as_str())
            && notification.property(props::PROGRAM) == Some(self.program.program.as_str());

        same_program
            && notification
                .property(props::STATUS)
                .and_then(|s| ProgramRunStatus::from_str(s).ok())
                .is_some_and(|status| self.statuses.contains(&status))
    }

    fn is_satisfied_by(&self, matched: &[&Notification]) -> bool {
        !matched.is_empty()
    }

    fn update_launch_arguments(
        &self,
        matched: &[&Notification],
        system_args: &mut BTreeMap<String, String>,
        _user_args: &mut BTreeMap<String, String>,
    ) {
        let Some(latest) = matched.last() else {
            return;
        };
        let prefix = self.argument_prefix();
        if let Some(run_id) = latest.property(props::RUN_ID) {
            system_args.insert(format!("{}.run_id", prefix), run_id.to_string());
        }
        if let Some(status) = latest.property(props::STATUS) {
            system_args.insert(format!("{}.status", prefix), status.to_ascii_uppercase());
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        self.program.validate()?;
        if self.statuses.is_empty() {
            return Err(ValidationError::InvalidFieldValue {
                field: "statuses".to_string(),
                reason: "at least one status is required".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream() -> ProgramId {
        ProgramId::new("default", "etl", "loader")
    }

    #[test]
    fn test_empty_statuses_default_to_completed() {
        let trigger = ProgramStatusTrigger::new(upstream(), vec![]);
        assert_eq!(trigger.statuses, vec![ProgramRunStatus::Completed]);
    }

    #[test]
    fn test_statuses_default_when_deserializing() {
        let trigger: ProgramStatusTrigger = serde_json::from_value(serde_json::json!({
            "program": {"namespace": "default", "application": "etl", "program": "loader"}
        }))
        .unwrap();
        assert_eq!(trigger.statuses, vec![ProgramRunStatus::Completed]);
    }

    #[test]
    fn test_matches_only_listed_statuses() {
        let trigger = ProgramStatusTrigger::new(upstream(), vec![ProgramRunStatus::Failed]);
        assert!(trigger.matches(&Notification::program_status(
            &upstream(),
            ProgramRunStatus::Failed,
            "r1"
        )));
        assert!(!trigger.matches(&Notification::program_status(
            &upstream(),
            ProgramRunStatus::Completed,
            "r2"
        )));
    }

    #[test]
    fn test_does_not_match_other_program() {
        let trigger = ProgramStatusTrigger::new(upstream(), vec![]);
        let other = ProgramId::new("default", "etl", "other");
        assert!(!trigger.matches(&Notification::program_status(
            &other,
            ProgramRunStatus::Completed,
            "r1"
        )));
    }

    #[test]
    fn test_launch_arguments_use_latest_run() {
        let trigger = ProgramStatusTrigger::new(upstream(), vec![]);
        let first = Notification::program_status(&upstream(), ProgramRunStatus::Completed, "r1");
        let second = Notification::program_status(&upstream(), ProgramRunStatus::Completed, "r2");

        let mut system = BTreeMap::new();
        let mut user = BTreeMap::new();
        trigger.update_launch_arguments(&[&first, &second], &mut system, &mut user);

        assert_eq!(
            system.get("triggering.program.default.etl.loader.run_id"),
            Some(&"r2".to_string())
        );
        assert_eq!(
            system.get("triggering.program.default.etl.loader.status"),
            Some(&"COMPLETED".to_string())
        );
    }

    #[test]
    fn test_invalid_program_id_rejected() {
        let trigger = ProgramStatusTrigger::new(ProgramId::new("ns", "a:b", "p"), vec![]);
        assert!(matches!(
            trigger.validate(),
            Err(ValidationError::InvalidIdentifier { .. })
        ));
    }
}
