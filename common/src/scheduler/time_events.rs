// Cron fire detection for time triggers
//
// Each tick emits one notification per cron fire that fell in the window since
// the previous tick. Triggers shared by several schedules are evaluated once.
// Fires missed while the scheduler was not running are not replayed. Fires
// that could not be dispatched are handed back and emitted again first on the
// next tick.

use crate::models::{Notification, ScheduleRecord};
use crate::trigger::UnitTrigger;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub struct TimeEventGenerator {
    last_tick: Option<DateTime<Utc>>,
    max_fires: usize,
    deferred: Vec<Notification>,
}

impl TimeEventGenerator {
    pub fn new(max_fires: usize) -> Self {
        Self {
            last_tick: None,
            max_fires: max_fires.max(1),
            deferred: Vec::new(),
        }
    }

    /// Start the window at `at` instead of at the first tick
    pub fn starting_at(max_fires: usize, at: DateTime<Utc>) -> Self {
        Self {
            last_tick: Some(at),
            max_fires: max_fires.max(1),
            deferred: Vec::new(),
        }
    }

    pub fn last_tick(&self) -> Option<DateTime<Utc>> {
        self.last_tick
    }

    /// Fires handed back and not yet emitted again
    pub fn deferred(&self) -> usize {
        self.deferred.len()
    }

    /// Hand back fires that could not be dispatched
    pub fn defer(&mut self, notifications: impl IntoIterator<Item = Notification>) {
        self.deferred.extend(notifications);
    }

    /// Deferred fires, then notifications for every cron fire in
    /// `(last_tick, now]` across the enabled schedules. The first call only
    /// opens the window.
    pub fn generate(&mut self, records: &[ScheduleRecord], now: DateTime<Utc>) -> Vec<Notification> {
        let mut notifications = std::mem::take(&mut self.deferred);
        let Some(after) = self.last_tick else {
            self.last_tick = Some(now);
            return notifications;
        };
        if now <= after {
            return notifications;
        }
        self.last_tick = Some(now);

        let mut triggers = BTreeMap::new();
        for record in records.iter().filter(|r| r.is_enabled()) {
            for trigger in record.schedule.trigger.time_triggers() {
                triggers.entry(trigger.trigger_key()).or_insert(trigger);
            }
        }

        for (key, trigger) in triggers {
            match trigger.fire_times_between(after, now, self.max_fires) {
                Ok(fires) => {
                    if fires.len() == self.max_fires {
                        warn!(trigger_key = %key, max_fires = self.max_fires, "Cron fires capped for this tick");
                    }
                    debug!(trigger_key = %key, fires = fires.len(), "Cron fires due");
                    notifications.extend(fires.into_iter().map(|t| trigger.notification(t)));
                }
                Err(e) => warn!(trigger_key = %key, error = %e, "Skipping unparseable cron trigger"),
            }
        }
        notifications
    }
}
