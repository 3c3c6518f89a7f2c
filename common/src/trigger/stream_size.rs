use super::{stream_size_key, UnitTrigger};
use crate::errors::ValidationError;
use crate::models::{props, Notification, NotificationType, StreamId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Fires once at least `trigger_mb` megabytes were appended to a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSizeTrigger {
    pub stream: StreamId,
    pub trigger_mb: u32,
}

impl StreamSizeTrigger {
    pub fn new(stream: StreamId, trigger_mb: u32) -> Self {
        Self { stream, trigger_mb }
    }

    pub fn threshold_bytes(&self) -> u64 {
        u64::from(self.trigger_mb) * BYTES_PER_MB
    }

    pub fn appended_bytes(&self, matched: &[&Notification]) -> u64 {
        matched
            .iter()
            .filter_map(|n| n.numeric_property(props::SIZE_BYTES, 0).ok())
            .fold(0u64, u64::saturating_add)
    }
}

impl UnitTrigger for StreamSizeTrigger {
    fn trigger_key(&self) -> String {
        stream_size_key(&self.stream.namespace, &self.stream.stream)
    }

    fn trigger_type(&self) -> &'static str {
        "stream_size"
    }

    fn matches(&self, notification: &Notification) -> bool {
        notification.notification_type == NotificationType::StreamSize
            && notification.property(props::NAMESPACE) == Some(self.stream.namespace.as_str())
            && notification.property(props::STREAM) == Some(self.stream.stream.as_str())
            && notification
                .required_property(props::SIZE_BYTES)
                .is_ok_and(|v| v.parse::<u64>().is_ok())
    }

    fn is_satisfied_by(&self, matched: &[&Notification]) -> bool {
        self.appended_bytes(matched) >= self.threshold_bytes()
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
        system_args.insert(
            format!(
                "triggering.stream.{}.{}.bytes",
                self.stream.namespace, self.stream.stream
            ),
            self.appended_bytes(matched).to_string(),
        );
    }

    fn validate(&self) -> Result<(), ValidationError> {
        self.stream.validate()?;
        if self.trigger_mb < 1 {
            return Err(ValidationError::InvalidFieldValue {
                field: "trigger_mb".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn clicks() -> StreamId {
        StreamId::new("ns", "clicks")
    }

    fn appended(bytes: u64, second: u32) -> Notification {
        Notification::stream_size(
            &clicks(),
            bytes,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, second).unwrap(),
        )
    }

    #[test]
    fn test_satisfied_when_threshold_reached() {
        let trigger = StreamSizeTrigger::new(clicks(), 2);
        let a = appended(BYTES_PER_MB, 1);
        let b = appended(BYTES_PER_MB - 1, 2);
        let c = appended(1, 3);

        assert!(!trigger.is_satisfied_by(&[&a, &b]));
        assert!(trigger.is_satisfied_by(&[&a, &b, &c]));
    }

    #[test]
    fn test_missing_size_does_not_match() {
        let trigger = StreamSizeTrigger::new(clicks(), 1);
        let notification = Notification::new(NotificationType::StreamSize)
            .with_property(props::NAMESPACE, "ns")
            .with_property(props::STREAM, "clicks");
        assert!(!trigger.matches(&notification));
    }

    #[test]
    fn test_launch_arguments_report_bytes() {
        let trigger = StreamSizeTrigger::new(clicks(), 1);
        let a = appended(10, 1);
        let b = appended(20, 2);
        let mut system = BTreeMap::new();
        let mut user = BTreeMap::new();
        trigger.update_launch_arguments(&[&a, &b], &mut system, &mut user);
        assert_eq!(
            system.get("triggering.stream.ns.clicks.bytes"),
            Some(&"30".to_string())
        );
    }

    #[test]
    fn test_zero_megabytes_rejected() {
        assert!(StreamSizeTrigger::new(clicks(), 0).validate().is_err());
    }
}
