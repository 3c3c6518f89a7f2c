// Property-based tests for trigger evaluation

use chrono::{TimeZone, Utc};
use common::models::{
    DatasetId, Notification, ProgramId, ProgramRunStatus, StreamId,
};
use common::state::{ObservedNotifications, TriggerSatisfactionState};
use common::trigger::Trigger;
use proptest::prelude::*;

fn dataset(name: &str) -> DatasetId {
    DatasetId::new("ns", name)
}

fn program(name: &str) -> ProgramId {
    ProgramId::new("ns", "app", name)
}

fn observe_all(trigger: &Trigger, notifications: &[Notification]) -> ObservedNotifications {
    let mut observed = ObservedNotifications::new();
    for notification in notifications {
        if trigger.matches(notification) {
            observed.record(&notification.trigger_key().unwrap(), notification.clone());
        }
    }
    observed
}

/// Leaf triggers together with one notification that satisfies each
fn leaf_with_notification() -> impl Strategy<Value = (Trigger, Notification)> {
    prop_oneof![
        "[a-z]{1,6}".prop_map(|name| (
            Trigger::partition(dataset(&name), 1),
            Notification::partition(&dataset(&name), "p0"),
        )),
        "[a-z]{1,6}".prop_map(|name| (
            Trigger::program_status(program(&name), vec![]),
            Notification::program_status(&program(&name), ProgramRunStatus::Completed, "r0"),
        )),
        ("[a-z]{1,6}", 1u32..4).prop_map(|(name, mb)| (
            Trigger::stream_size(StreamId::new("ns", &name), mb),
            Notification::stream_size(
                &StreamId::new("ns", &name),
                u64::from(mb) * 1024 * 1024,
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            ),
        )),
        (0u32..24).prop_map(|hour| {
            let cron = format!("0 {} * * *", hour);
            (
                Trigger::time(cron.clone()),
                Notification::time(
                    &cron,
                    chrono_tz::UTC,
                    Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap(),
                ),
            )
        }),
    ]
}

/// **Property: AND satisfaction is order independent**
///
/// *For any* set of leaf triggers combined with AND, the trigger is satisfied
/// after all their notifications arrive, regardless of arrival order, and not
/// before the last one.
#[test]
fn property_and_order_independent() {
    proptest!(|(
        leaves in prop::collection::vec(leaf_with_notification(), 1..5),
        seed in any::<u64>(),
    )| {
        let (triggers, notifications): (Vec<_>, Vec<_>) = leaves.into_iter().unzip();
        let trigger = Trigger::and(triggers);

        let mut shuffled = notifications.clone();
        let len = shuffled.len();
        shuffled.rotate_left((seed as usize) % len);

        prop_assert!(trigger.is_satisfied(&observe_all(&trigger, &shuffled)));

        // Dropping the notification of a key nobody else shares leaves it unsatisfied
        let last = shuffled.pop().unwrap();
        let last_key = last.trigger_key().unwrap();
        let shared = shuffled.iter().any(|n| n.trigger_key().unwrap() == last_key);
        if !shared {
            prop_assert!(!trigger.is_satisfied(&observe_all(&trigger, &shuffled)));
        }
    });
}

/// **Property: OR is satisfied by any branch**
///
/// *For any* OR of leaf triggers, one notification for any branch satisfies it.
#[test]
fn property_or_any_branch() {
    proptest!(|(
        leaves in prop::collection::vec(leaf_with_notification(), 1..5),
        pick in any::<prop::sample::Index>(),
    )| {
        let (triggers, notifications): (Vec<_>, Vec<_>) = leaves.into_iter().unzip();
        let trigger = Trigger::or(triggers);
        let chosen = notifications[pick.index(notifications.len())].clone();

        prop_assert!(trigger.is_satisfied(&observe_all(&trigger, &[chosen])));
        prop_assert!(!trigger.is_satisfied(&ObservedNotifications::new()));
    });
}

/// **Property: Shared keys count once for every branch**
///
/// *For any* composite containing the same unit trigger in several branches,
/// a single notification satisfies every occurrence.
#[test]
fn property_shared_key_satisfies_all_occurrences() {
    proptest!(|(
        (leaf, notification) in leaf_with_notification(),
        copies in 2usize..5,
    )| {
        let trigger = Trigger::and(
            (0..copies)
                .map(|_| Trigger::or(vec![leaf.clone()]))
                .collect(),
        );
        prop_assert_eq!(trigger.trigger_keys().len(), 1);
        prop_assert!(trigger.is_satisfied(&observe_all(&trigger, &[notification])));
    });
}

/// **Property: Duplicate notifications are idempotent**
///
/// *For any* notification recorded several times, the observed state equals
/// the state after recording it once.
#[test]
fn property_duplicate_observation_idempotent() {
    proptest!(|(
        (_, notification) in leaf_with_notification(),
        repeats in 1usize..6,
    )| {
        let key = notification.trigger_key().unwrap();

        let mut once = TriggerSatisfactionState::default();
        prop_assert!(once.observe(&key, notification.clone()));

        let mut many = TriggerSatisfactionState::default();
        many.observe(&key, notification.clone());
        for _ in 0..repeats {
            prop_assert!(!many.observe(&key, notification.clone()));
        }

        prop_assert_eq!(once, many);
    });
}

/// **Property: Reset re-arms the trigger**
///
/// *For any* satisfied trigger, completing a launch clears the observed state
/// so the trigger is no longer satisfied until new notifications arrive.
#[test]
fn property_reset_rearms() {
    proptest!(|(
        leaves in prop::collection::vec(leaf_with_notification(), 1..4),
    )| {
        let (triggers, notifications): (Vec<_>, Vec<_>) = leaves.into_iter().unzip();
        let trigger = Trigger::and(triggers);

        let mut state = TriggerSatisfactionState::default();
        for notification in &notifications {
            state.observe(&notification.trigger_key().unwrap(), notification.clone());
        }
        prop_assert!(trigger.is_satisfied(&state.observed));

        state.complete_launch(Utc::now(), &common::models::RunId::from("run"));
        prop_assert!(!trigger.is_satisfied(&state.observed));
        prop_assert_eq!(state.fire_count, 1);
    });
}

/// **Property: Deleting an unreferenced program changes nothing**
///
/// *For any* trigger without program status branches, simplifying for a
/// deleted program returns the trigger unchanged.
#[test]
fn property_deletion_without_reference_is_identity() {
    proptest!(|(
        leaves in prop::collection::vec(leaf_with_notification(), 1..4),
        use_and in any::<bool>(),
    )| {
        let triggers: Vec<Trigger> = leaves
            .into_iter()
            .map(|(t, _)| t)
            .filter(|t| !matches!(t, Trigger::ProgramStatus(_)))
            .collect();
        prop_assume!(!triggers.is_empty());
        let trigger = if use_and { Trigger::and(triggers) } else { Trigger::or(triggers) };

        let deleted = program("never-referenced-program");
        prop_assert!(!trigger.references_program(&deleted));
        prop_assert_eq!(trigger.with_deleted_program(&deleted), Some(trigger.clone()));
    });
}

/// **Property: Deleting a required program makes AND unsatisfiable**
///
/// *For any* AND containing a program status trigger, deleting that program
/// yields no trigger.
#[test]
fn property_deleted_program_in_and_is_unsatisfiable() {
    proptest!(|(
        leaves in prop::collection::vec(leaf_with_notification(), 0..4),
    )| {
        let deleted = program("upstream");
        let mut triggers: Vec<Trigger> = leaves.into_iter().map(|(t, _)| t).collect();
        triggers.push(Trigger::program_status(deleted.clone(), vec![]));

        prop_assert_eq!(Trigger::and(triggers).with_deleted_program(&deleted), None);
    });
}
