use super::{partition_key, UnitTrigger};
use crate::errors::ValidationError;
use crate::models::{props, DatasetId, Notification, NotificationType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fires once enough new partitions of a dataset have been published.
///
/// A single notification may announce several partitions through the
/// `num_partitions` property; when absent it counts as one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionTrigger {
    pub dataset: DatasetId,
    pub num_partitions: u32,
}

impl PartitionTrigger {
    pub fn new(dataset: DatasetId, num_partitions: u32) -> Self {
        Self {
            dataset,
            num_partitions,
        }
    }

    /// Partitions announced by the matched notifications
    pub fn partition_count(&self, matched: &[&Notification]) -> u64 {
        matched
            .iter()
            .map(|n| n.numeric_property(props::NUM_PARTITIONS, 1).unwrap_or(1))
            .sum()
    }

    fn argument_prefix(&self) -> String {
        format!(
            "triggering.partition.{}.{}",
            self.dataset.namespace, self.dataset.dataset
        )
    }
}

impl UnitTrigger for PartitionTrigger {
    fn trigger_key(&self) -> String {
        partition_key(&self.dataset.namespace, &self.dataset.dataset)
    }

    fn trigger_type(&self) -> &'static str {
        "partition"
    }

    fn matches(&self, notification: &Notification) -> bool {
        notification.notification_type == NotificationType::Partition
            && notification.property(props::NAMESPACE) == Some(self.dataset.namespace.as_str())
            && notification.property(props::DATASET) == Some(self.dataset.dataset.as_str())
            && notification.numeric_property(props::NUM_PARTITIONS, 1).is_ok()
    }

    fn is_satisfied_by(&self, matched: &[&Notification]) -> bool {
        self.partition_count(matched) >= u64::from(self.num_partitions)
    }

    fn update_launch_arguments(
        &self,
        matched: &[&Notification],
        system_args: &mut BTreeMap<String, String>,
        _user_args: &mut BTreeMap<String, String>,
    ) {
        if matched.is_empty() {
            return;
        }
        let paths: Vec<&str> = matched
            .iter()
            .filter_map(|n| n.property(props::PARTITION))
            .collect();
        let prefix = self.argument_prefix();
        system_args.insert(format!("{}.paths", prefix), paths.join(","));
        system_args.insert(
            format!("{}.count", prefix),
            self.partition_count(matched).to_string(),
        );
    }

    fn validate(&self) -> Result<(), ValidationError> {
        self.dataset.validate()?;
        if self.num_partitions < 1 {
            return Err(ValidationError::InvalidFieldValue {
                field: "num_partitions".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
