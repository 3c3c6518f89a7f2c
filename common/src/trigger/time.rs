// Cron based time trigger
//
// Accepts both 5-field (minute precision) and Quartz-style 6/7-field
// expressions. Fire times are computed in the trigger's timezone.

use super::{time_key, UnitTrigger};
use crate::errors::ValidationError;
use crate::models::{props, Notification, NotificationType};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// System argument set to the logical fire time of the triggering cron tick
pub const LOGICAL_START_TIME_ARG: &str = "logical.start.time";

pub fn default_timezone() -> Tz {
    chrono_tz::UTC
}

/// Parse and validate a cron expression, normalizing 5-field expressions
pub fn parse_cron_expression(expression: &str) -> Result<CronSchedule, ValidationError> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };

    CronSchedule::from_str(&normalized).map_err(|e| ValidationError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeTrigger {
    pub cron_expression: String,
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
}

impl TimeTrigger {
    pub fn new(cron_expression: impl Into<String>) -> Self {
        Self {
            cron_expression: cron_expression.into(),
            timezone: default_timezone(),
        }
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    /// Fire times in the window `(after, until]`, at most `limit` of them
    pub fn fire_times_between(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DateTime<Utc>>, ValidationError> {
        let schedule = parse_cron_expression(&self.cron_expression)?;
        let after_in_tz = after.with_timezone(&self.timezone);

        Ok(schedule
            .after(&after_in_tz)
            .map(|t| t.with_timezone(&Utc))
            .take_while(|t| *t <= until)
            .take(limit)
            .collect())
    }

    /// Next fire time strictly after `after`
    pub fn next_fire_time(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ValidationError> {
        let schedule = parse_cron_expression(&self.cron_expression)?;
        let after_in_tz = after.with_timezone(&self.timezone);
        Ok(schedule
            .after(&after_in_tz)
            .next()
            .map(|t| t.with_timezone(&Utc)))
    }

    /// Notification emitted for one fire of this trigger
    pub fn notification(&self, fire_time: DateTime<Utc>) -> Notification {
        Notification::time(self.cron_expression.trim(), self.timezone, fire_time)
    }
}

impl UnitTrigger for TimeTrigger {
    fn trigger_key(&self) -> String {
        time_key(self.timezone.name(), &self.cron_expression)
    }

    fn trigger_type(&self) -> &'static str {
        "time"
    }

    fn matches(&self, notification: &Notification) -> bool {
        notification.notification_type == NotificationType::Time
            && notification
                .property(props::CRON_EXPRESSION)
                .is_some_and(|cron| cron.trim() == self.cron_expression.trim())
            && notification.property(props::TIMEZONE).unwrap_or("UTC") == self.timezone.name()
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
        let latest = matched
            .iter()
            .filter_map(|n| n.property(props::FIRE_TIME))
            .filter_map(|t| t.parse::<i64>().ok())
            .max();
        if let Some(fire_time) = latest {
            system_args.insert(LOGICAL_START_TIME_ARG.to_string(), fire_time.to_string());
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.cron_expression.trim().is_empty() {
            return Err(ValidationError::MissingField("cron_expression".to_string()));
        }
        parse_cron_expression(&self.cron_expression).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_five_field_expression() {
        assert!(parse_cron_expression("0 0 * * *").is_ok());
    }

    #[test]
    fn test_parse_quartz_expression() {
        assert!(parse_cron_expression("0 0 12 * * * *").is_ok());
    }

    #[test]
    fn test_parse_invalid_cron_expression() {
        assert!(parse_cron_expression("invalid").is_err());
    }

    #[test]
    fn test_key_includes_timezone() {
        let trigger = TimeTrigger::new("0 0 * * *").with_timezone(chrono_tz::Asia::Ho_Chi_Minh);
        assert_eq!(trigger.trigger_key(), "time:Asia/Ho_Chi_Minh:0 0 * * *");
    }

    #[test]
    fn test_daily_fire_times_in_window() {
        let trigger = TimeTrigger::new("0 0 * * *");
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 4, 0, 0, 0).unwrap();

        let fires = trigger.fire_times_between(start, end, 100).unwrap();
        assert_eq!(
            fires,
            vec![
                Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 1, 4, 0, 0, 0).unwrap(),
            ]
        );
    }

    #[test]
    fn test_fire_times_respect_limit() {
        let trigger = TimeTrigger::new("* * * * *");
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        assert_eq!(trigger.fire_times_between(start, end, 10).unwrap().len(), 10);
    }

    #[test]
    fn test_fire_time_in_timezone() {
        // Midnight in Ho Chi Minh City is 17:00 UTC the previous day
        let trigger = TimeTrigger::new("0 0 * * *").with_timezone(chrono_tz::Asia::Ho_Chi_Minh);
        let after = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let next = trigger.next_fire_time(after).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 17, 0, 0).unwrap());
    }

    #[test]
    fn test_matches_only_its_own_cron() {
        let trigger = TimeTrigger::new("0 0 * * *");
        let fire = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        assert!(trigger.matches(&trigger.notification(fire)));
        assert!(!trigger.matches(&TimeTrigger::new("0 1 * * *").notification(fire)));
    }

    #[test]
    fn test_logical_start_time_uses_latest_fire() {
        let trigger = TimeTrigger::new("0 0 * * *");
        let first = trigger.notification(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap());
        let second = trigger.notification(Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap());
        let mut system = BTreeMap::new();
        let mut user = BTreeMap::new();
        trigger.update_launch_arguments(&[&first, &second], &mut system, &mut user);
        assert_eq!(
            system.get(LOGICAL_START_TIME_ARG).unwrap(),
            &Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0)
                .unwrap()
                .timestamp_millis()
                .to_string()
        );
        assert!(user.is_empty());
    }
}
