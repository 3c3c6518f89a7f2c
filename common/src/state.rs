// Trigger satisfaction state persisted per schedule

use crate::models::{Notification, RunId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Notifications observed since the last reset, grouped by trigger key.
///
/// Fired state is tracked per unique key rather than per occurrence of a unit
/// trigger in the tree, so one notification counts for every branch of a
/// composite trigger that contains that key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObservedNotifications(BTreeMap<String, Vec<Notification>>);

impl ObservedNotifications {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications recorded under `key`, in arrival order
    pub fn get(&self, key: &str) -> &[Notification] {
        self.0.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Record a notification. Returns false when it was already present.
    pub fn record(&mut self, key: &str, notification: Notification) -> bool {
        let entry = self.0.entry(key.to_string()).or_default();
        if entry.contains(&notification) {
            return false;
        }
        entry.push(notification);
        true
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.get(key).is_some_and(|n| !n.is_empty())
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    /// Total number of notifications across all keys
    pub fn len(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    /// Drop every notification that is also present in `other`
    pub fn subtract(&mut self, other: &ObservedNotifications) {
        for (key, seen) in &other.0 {
            if let Some(entry) = self.0.get_mut(key) {
                entry.retain(|n| !seen.contains(n));
            }
        }
        self.0.retain(|_, entry| !entry.is_empty());
    }
}

/// Marks a schedule as being launched by one scheduler instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchClaim {
    pub token: Uuid,
    pub claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSatisfactionState {
    #[serde(default)]
    pub observed: ObservedNotifications,
    /// When the trigger was first seen satisfied in the current cycle
    #[serde(default)]
    pub satisfied_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub launch_claim: Option<LaunchClaim>,
    #[serde(default)]
    pub last_fired_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run_id: Option<RunId>,
    #[serde(default)]
    pub fire_count: u64,
}

impl TriggerSatisfactionState {
    pub fn observe(&mut self, key: &str, notification: Notification) -> bool {
        self.observed.record(key, notification)
    }

    /// True when the trigger was satisfied but launch is still pending
    pub fn is_held(&self) -> bool {
        self.satisfied_at.is_some()
    }

    pub fn claim_is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.launch_claim
            .as_ref()
            .is_some_and(|claim| now - claim.claimed_at >= ttl)
    }

    /// A claim held by another instance that has not yet expired
    pub fn has_active_claim(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.launch_claim.is_some() && !self.claim_is_stale(now, ttl)
    }

    pub fn claim(&mut self, now: DateTime<Utc>) -> Uuid {
        let token = Uuid::new_v4();
        self.launch_claim = Some(LaunchClaim {
            token,
            claimed_at: now,
        });
        token
    }

    pub fn is_claimed_by(&self, token: Uuid) -> bool {
        self.launch_claim.as_ref().is_some_and(|c| c.token == token)
    }

    pub fn release_claim(&mut self) {
        self.launch_claim = None;
    }

    /// Start a new cycle. Bookkeeping about previous fires is kept.
    pub fn reset_cycle(&mut self) {
        self.observed = ObservedNotifications::new();
        self.satisfied_at = None;
        self.launch_claim = None;
    }

    /// Record a successful launch and re-arm
    pub fn complete_launch(&mut self, now: DateTime<Utc>, run_id: &RunId) {
        self.reset_cycle();
        self.last_fired_at = Some(now);
        self.last_run_id = Some(run_id.clone());
        self.fire_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DatasetId, Notification};

    fn partition(path: &str) -> Notification {
        Notification::partition(&DatasetId::new("ns", "events"), path)
    }

    #[test]
    fn test_duplicate_notification_is_not_recorded_twice() {
        let mut state = TriggerSatisfactionState::default();
        assert!(state.observe("partition:ns:events", partition("p1")));
        assert!(!state.observe("partition:ns:events", partition("p1")));
        assert_eq!(state.observed.len(), 1);
    }

    #[test]
    fn test_complete_launch_resets_cycle_and_keeps_bookkeeping() {
        let mut state = TriggerSatisfactionState::default();
        state.observe("partition:ns:events", partition("p1"));
        state.satisfied_at = Some(Utc::now());
        state.claim(Utc::now());

        state.complete_launch(Utc::now(), &RunId::from("run-1"));

        assert!(state.observed.is_empty());
        assert!(state.satisfied_at.is_none());
        assert!(state.launch_claim.is_none());
        assert_eq!(state.fire_count, 1);
        assert_eq!(state.last_run_id, Some(RunId::from("run-1")));
    }

    #[test]
    fn test_claim_staleness() {
        let mut state = TriggerSatisfactionState::default();
        let claimed_at = Utc::now() - Duration::minutes(10);
        state.launch_claim = Some(LaunchClaim {
            token: Uuid::new_v4(),
            claimed_at,
        });
        assert!(state.claim_is_stale(Utc::now(), Duration::minutes(5)));
        assert!(!state.has_active_claim(Utc::now(), Duration::minutes(5)));
        assert!(state.has_active_claim(Utc::now(), Duration::minutes(30)));
    }

    #[test]
    fn test_subtract_keeps_only_new_notifications() {
        let mut snapshot = ObservedNotifications::new();
        snapshot.record("k", partition("p1"));

        let mut current = snapshot.clone();
        current.record("k", partition("p2"));
        current.subtract(&snapshot);

        assert_eq!(current.get("k"), &[partition("p2")]);
    }

    #[test]
    fn test_state_round_trips_through_json() {
        let mut state = TriggerSatisfactionState::default();
        state.observe("partition:ns:events", partition("p1"));
        let json = serde_json::to_value(&state).unwrap();
        let back: TriggerSatisfactionState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
