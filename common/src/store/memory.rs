// In-memory schedule store, used for single-process deployments and tests

use super::{CasOutcome, ScheduleStore};
use crate::errors::StoreError;
use crate::models::{ProgramId, ProgramSchedule, ScheduleId, ScheduleRecord, ScheduleStatus};
use crate::state::TriggerSatisfactionState;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::instrument;

#[derive(Default)]
struct Inner {
    records: HashMap<ScheduleId, ScheduleRecord>,
    by_trigger_key: HashMap<String, BTreeSet<ScheduleId>>,
}

impl Inner {
    fn index(&mut self, record: &ScheduleRecord) {
        for key in &record.trigger_keys {
            self.by_trigger_key
                .entry(key.clone())
                .or_default()
                .insert(record.id().clone());
        }
    }

    fn unindex(&mut self, record: &ScheduleRecord) {
        for key in &record.trigger_keys {
            if let Some(ids) = self.by_trigger_key.get_mut(key) {
                ids.remove(record.id());
                if ids.is_empty() {
                    self.by_trigger_key.remove(key);
                }
            }
        }
    }
}

#[derive(Default)]
pub struct InMemoryScheduleStore {
    inner: RwLock<Inner>,
}

impl InMemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for InMemoryScheduleStore {
    #[instrument(skip(self, schedule), fields(schedule = %schedule.id))]
    async fn add_schedule(&self, schedule: ProgramSchedule) -> Result<ScheduleRecord, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.records.contains_key(&schedule.id) {
            return Err(StoreError::AlreadyExists(schedule.id.to_string()));
        }
        let record = ScheduleRecord::new(schedule, Utc::now());
        inner.index(&record);
        inner.records.insert(record.id().clone(), record.clone());
        Ok(record)
    }

    #[instrument(skip(self, schedule), fields(schedule = %schedule.id))]
    async fn update_schedule(
        &self,
        schedule: ProgramSchedule,
    ) -> Result<ScheduleRecord, StoreError> {
        let mut inner = self.inner.write().await;
        let existing = inner
            .records
            .get(&schedule.id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(schedule.id.to_string()))?;

        let mut record = ScheduleRecord::new(schedule, existing.created_at);
        record.status = existing.status;
        record.disabled_reason = existing.disabled_reason.clone();
        record.version = existing.version + 1;
        record.updated_at = Utc::now();

        inner.unindex(&existing);
        inner.index(&record);
        inner.records.insert(record.id().clone(), record.clone());
        Ok(record)
    }

    #[instrument(skip(self), fields(schedule = %id))]
    async fn delete_schedule(&self, id: &ScheduleId) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        inner.unindex(&record);
        Ok(())
    }

    async fn get_schedule(&self, id: &ScheduleId) -> Result<Option<ScheduleRecord>, StoreError> {
        Ok(self.inner.read().await.records.get(id).cloned())
    }

    async fn list_schedules(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<ScheduleRecord>, StoreError> {
        let inner = self.inner.read().await;
        let mut records: Vec<ScheduleRecord> = inner
            .records
            .values()
            .filter(|r| namespace.map_or(true, |ns| r.id().namespace == ns))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(records)
    }

    async fn list_schedules_by_trigger_key(
        &self,
        key: &str,
    ) -> Result<Vec<ScheduleId>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_trigger_key
            .get(key)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_schedules_by_program(
        &self,
        program: &ProgramId,
    ) -> Result<Vec<ScheduleRecord>, StoreError> {
        let inner = self.inner.read().await;
        let mut records: Vec<ScheduleRecord> = inner
            .records
            .values()
            .filter(|r| &r.schedule.program == program)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(records)
    }

    #[instrument(skip(self), fields(schedule = %id))]
    async fn set_status(
        &self,
        id: &ScheduleId,
        status: ScheduleStatus,
        reason: Option<String>,
    ) -> Result<ScheduleRecord, StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.status = status;
        record.disabled_reason = reason;
        record.state = TriggerSatisfactionState::default();
        record.version += 1;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn put_schedule_state(
        &self,
        id: &ScheduleId,
        expected_version: i64,
        state: &TriggerSatisfactionState,
    ) -> Result<CasOutcome, StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if record.version != expected_version {
            return Ok(CasOutcome::Conflict {
                current_version: record.version,
            });
        }
        record.state = state.clone();
        record.version += 1;
        record.updated_at = Utc::now();
        Ok(CasOutcome::Applied {
            version: record.version,
        })
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DatasetId, Notification};
    use crate::trigger::Trigger;

    fn schedule(name: &str, trigger: Trigger) -> ProgramSchedule {
        ProgramSchedule::new(
            ScheduleId::new("ns", name),
            ProgramId::new("ns", "app", "target"),
            trigger,
        )
    }

    #[tokio::test]
    async fn test_add_and_route_by_trigger_key() {
        let store = InMemoryScheduleStore::new();
        store
            .add_schedule(schedule("daily", Trigger::time("0 0 * * *")))
            .await
            .unwrap();

        let ids = store
            .list_schedules_by_trigger_key("time:UTC:0 0 * * *")
            .await
            .unwrap();
        assert_eq!(ids, vec![ScheduleId::new("ns", "daily")]);
        assert!(store
            .list_schedules_by_trigger_key("time:UTC:0 1 * * *")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_add_rejected() {
        let store = InMemoryScheduleStore::new();
        store
            .add_schedule(schedule("daily", Trigger::time("0 0 * * *")))
            .await
            .unwrap();
        let err = store
            .add_schedule(schedule("daily", Trigger::time("0 0 * * *")))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_stale_version_write_conflicts() {
        let store = InMemoryScheduleStore::new();
        let record = store
            .add_schedule(schedule("daily", Trigger::time("0 0 * * *")))
            .await
            .unwrap();

        let state = TriggerSatisfactionState::default();
        let first = store
            .put_schedule_state(record.id(), record.version, &state)
            .await
            .unwrap();
        assert_eq!(first, CasOutcome::Applied { version: 2 });

        let second = store
            .put_schedule_state(record.id(), record.version, &state)
            .await
            .unwrap();
        assert_eq!(second, CasOutcome::Conflict { current_version: 2 });
    }

    #[tokio::test]
    async fn test_write_after_delete_does_not_resurrect() {
        let store = InMemoryScheduleStore::new();
        let record = store
            .add_schedule(schedule("daily", Trigger::time("0 0 * * *")))
            .await
            .unwrap();
        store.delete_schedule(record.id()).await.unwrap();

        let err = store
            .put_schedule_state(record.id(), record.version, &TriggerSatisfactionState::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(store.get_schedule(record.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_reindexes_and_resets_state() {
        let store = InMemoryScheduleStore::new();
        let dataset = DatasetId::new("ns", "events");
        let record = store
            .add_schedule(schedule("load", Trigger::partition(dataset.clone(), 2)))
            .await
            .unwrap();

        let mut state = TriggerSatisfactionState::default();
        state.observe("partition:ns:events", Notification::partition(&dataset, "p1"));
        store
            .put_schedule_state(record.id(), record.version, &state)
            .await
            .unwrap();

        let updated = store
            .update_schedule(schedule("load", Trigger::time("0 0 * * *")))
            .await
            .unwrap();
        assert!(updated.state.observed.is_empty());
        assert_eq!(updated.version, 3);
        assert!(store
            .list_schedules_by_trigger_key("partition:ns:events")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            store
                .list_schedules_by_trigger_key("time:UTC:0 0 * * *")
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_set_status_bumps_version() {
        let store = InMemoryScheduleStore::new();
        let record = store
            .add_schedule(schedule("daily", Trigger::time("0 0 * * *")))
            .await
            .unwrap();
        let disabled = store
            .set_status(record.id(), ScheduleStatus::Disabled, Some("maintenance".into()))
            .await
            .unwrap();
        assert_eq!(disabled.status, ScheduleStatus::Disabled);
        assert_eq!(disabled.disabled_reason.as_deref(), Some("maintenance"));
        assert_eq!(disabled.version, record.version + 1);
    }
}
