use super::Trigger;
use crate::errors::ValidationError;
use crate::models::ProgramId;
use crate::state::ObservedNotifications;
use serde::{Deserialize, Serialize};

/// Ordered children of an AND / OR trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeTrigger {
    pub triggers: Vec<Trigger>,
}

impl CompositeTrigger {
    pub fn new(triggers: Vec<Trigger>) -> Self {
        Self { triggers }
    }

    // An empty composite is never satisfied, for AND as well as OR.
    pub(super) fn all_satisfied(&self, observed: &ObservedNotifications) -> bool {
        !self.triggers.is_empty() && self.triggers.iter().all(|t| t.is_satisfied(observed))
    }

    pub(super) fn any_satisfied(&self, observed: &ObservedNotifications) -> bool {
        self.triggers.iter().any(|t| t.is_satisfied(observed))
    }

    pub(super) fn and_with_deleted_program(&self, program: &ProgramId) -> Option<Trigger> {
        let children = self
            .triggers
            .iter()
            .map(|t| t.with_deleted_program(program))
            .collect::<Option<Vec<_>>>()?;
        if children.is_empty() {
            return None;
        }
        Some(Trigger::And(CompositeTrigger::new(children)))
    }

    pub(super) fn or_with_deleted_program(&self, program: &ProgramId) -> Option<Trigger> {
        let mut children: Vec<Trigger> = self
            .triggers
            .iter()
            .filter_map(|t| t.with_deleted_program(program))
            .collect();
        match children.len() {
            0 => None,
            1 => children.pop(),
            _ => Some(Trigger::Or(CompositeTrigger::new(children))),
        }
    }

    pub(super) fn validate(&self) -> Result<(), ValidationError> {
        if self.triggers.is_empty() {
            return Err(ValidationError::EmptyTrigger);
        }
        for trigger in &self.triggers {
            trigger.validate()?;
        }
        Ok(())
    }
}
