// PostgreSQL schedule store
//
// Schedule definitions and satisfaction state are stored as JSONB on
// `program_schedules`; `schedule_trigger_keys` is the routing index.

use super::{CasOutcome, ScheduleStore};
use crate::db::DbPool;
use crate::errors::StoreError;
use crate::models::{ProgramId, ProgramSchedule, ScheduleId, ScheduleRecord, ScheduleStatus};
use crate::state::TriggerSatisfactionState;
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row, Transaction};
use std::collections::BTreeSet;
use tracing::{info, instrument};

const SELECT_COLUMNS: &str = r#"
    SELECT definition, status, disabled_reason, state, version, created_at, updated_at
    FROM program_schedules
"#;

pub struct PostgresScheduleStore {
    pool: DbPool,
}

impl PostgresScheduleStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Apply pending migrations from `migrations/`
    #[instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../migrations").run(self.pool.pool()).await?;
        info!("Schedule store migrations applied");
        Ok(())
    }

    fn record_from_row(row: &PgRow) -> Result<ScheduleRecord, StoreError> {
        let definition: serde_json::Value = row.try_get("definition")?;
        let schedule: ProgramSchedule = serde_json::from_value(definition)?;

        let status: String = row.try_get("status")?;
        let status = status
            .parse::<ScheduleStatus>()
            .map_err(StoreError::Serialization)?;

        let state: serde_json::Value = row.try_get("state")?;
        let state: TriggerSatisfactionState = serde_json::from_value(state)?;

        let trigger_keys = schedule.trigger.trigger_keys();
        Ok(ScheduleRecord {
            schedule,
            status,
            disabled_reason: row.try_get("disabled_reason")?,
            trigger_keys,
            state,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn write_trigger_keys(
        tx: &mut Transaction<'_, Postgres>,
        id: &ScheduleId,
        keys: &BTreeSet<String>,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM schedule_trigger_keys WHERE namespace = $1 AND name = $2")
            .bind(&id.namespace)
            .bind(&id.name)
            .execute(&mut **tx)
            .await?;

        for key in keys {
            sqlx::query(
                r#"
                INSERT INTO schedule_trigger_keys (trigger_key, namespace, name)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(key)
            .bind(&id.namespace)
            .bind(&id.name)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn fetch(&self, id: &ScheduleId) -> Result<Option<ScheduleRecord>, StoreError> {
        let query = format!("{} WHERE namespace = $1 AND name = $2", SELECT_COLUMNS);
        let row = sqlx::query(&query)
            .bind(&id.namespace)
            .bind(&id.name)
            .fetch_optional(self.pool.pool())
            .await?;
        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn fetch_existing(&self, id: &ScheduleId) -> Result<ScheduleRecord, StoreError> {
        self.fetch(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl ScheduleStore for PostgresScheduleStore {
    #[instrument(skip(self, schedule), fields(schedule = %schedule.id))]
    async fn add_schedule(&self, schedule: ProgramSchedule) -> Result<ScheduleRecord, StoreError> {
        let definition = serde_json::to_value(&schedule)?;
        let state = serde_json::to_value(TriggerSatisfactionState::default())?;
        let keys = schedule.trigger.trigger_keys();

        let mut tx = self.pool.pool().begin().await?;
        sqlx::query(
            r#"
            INSERT INTO program_schedules (
                namespace, name, program_namespace, program_application, program_name,
                definition, status, state, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'enabled', $7, 1)
            "#,
        )
        .bind(&schedule.id.namespace)
        .bind(&schedule.id.name)
        .bind(&schedule.program.namespace)
        .bind(&schedule.program.application)
        .bind(&schedule.program.program)
        .bind(definition)
        .bind(state)
        .execute(&mut *tx)
        .await
        .map_err(|e| match StoreError::from(e) {
            StoreError::AlreadyExists(_) => StoreError::AlreadyExists(schedule.id.to_string()),
            other => other,
        })?;
        Self::write_trigger_keys(&mut tx, &schedule.id, &keys).await?;
        tx.commit().await?;

        tracing::info!(schedule = %schedule.id, trigger_keys = keys.len(), "Schedule stored");
        self.fetch_existing(&schedule.id).await
    }

    #[instrument(skip(self, schedule), fields(schedule = %schedule.id))]
    async fn update_schedule(
        &self,
        schedule: ProgramSchedule,
    ) -> Result<ScheduleRecord, StoreError> {
        let definition = serde_json::to_value(&schedule)?;
        let state = serde_json::to_value(TriggerSatisfactionState::default())?;
        let keys = schedule.trigger.trigger_keys();

        let mut tx = self.pool.pool().begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE program_schedules
            SET program_namespace = $3,
                program_application = $4,
                program_name = $5,
                definition = $6,
                state = $7,
                version = version + 1,
                updated_at = NOW()
            WHERE namespace = $1 AND name = $2
            "#,
        )
        .bind(&schedule.id.namespace)
        .bind(&schedule.id.name)
        .bind(&schedule.program.namespace)
        .bind(&schedule.program.application)
        .bind(&schedule.program.program)
        .bind(definition)
        .bind(state)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(schedule.id.to_string()));
        }
        Self::write_trigger_keys(&mut tx, &schedule.id, &keys).await?;
        tx.commit().await?;

        self.fetch_existing(&schedule.id).await
    }

    #[instrument(skip(self), fields(schedule = %id))]
    async fn delete_schedule(&self, id: &ScheduleId) -> Result<(), StoreError> {
        // Trigger keys go with the row (ON DELETE CASCADE)
        let result = sqlx::query("DELETE FROM program_schedules WHERE namespace = $1 AND name = $2")
            .bind(&id.namespace)
            .bind(&id.name)
            .execute(self.pool.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(schedule = %id))]
    async fn get_schedule(&self, id: &ScheduleId) -> Result<Option<ScheduleRecord>, StoreError> {
        self.fetch(id).await
    }

    #[instrument(skip(self))]
    async fn list_schedules(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<ScheduleRecord>, StoreError> {
        let query = format!(
            "{} WHERE $1::TEXT IS NULL OR namespace = $1 ORDER BY namespace, name",
            SELECT_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(namespace)
            .fetch_all(self.pool.pool())
            .await?;

        rows.iter().map(Self::record_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn list_schedules_by_trigger_key(
        &self,
        key: &str,
    ) -> Result<Vec<ScheduleId>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT namespace, name
            FROM schedule_trigger_keys
            WHERE trigger_key = $1
            ORDER BY namespace, name
            "#,
        )
        .bind(key)
        .fetch_all(self.pool.pool())
        .await?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(ScheduleId::new(
                row.try_get::<String, _>("namespace")?,
                row.try_get::<String, _>("name")?,
            ));
        }
        Ok(ids)
    }

    #[instrument(skip(self), fields(program = %program))]
    async fn list_schedules_by_program(
        &self,
        program: &ProgramId,
    ) -> Result<Vec<ScheduleRecord>, StoreError> {
        let query = format!(
            r#"{}
            WHERE program_namespace = $1 AND program_application = $2 AND program_name = $3
            ORDER BY namespace, name"#,
            SELECT_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(&program.namespace)
            .bind(&program.application)
            .bind(&program.program)
            .fetch_all(self.pool.pool())
            .await?;

        rows.iter().map(Self::record_from_row).collect()
    }

    #[instrument(skip(self), fields(schedule = %id, status = status.as_str()))]
    async fn set_status(
        &self,
        id: &ScheduleId,
        status: ScheduleStatus,
        reason: Option<String>,
    ) -> Result<ScheduleRecord, StoreError> {
        let state = serde_json::to_value(TriggerSatisfactionState::default())?;
        let result = sqlx::query(
            r#"
            UPDATE program_schedules
            SET status = $3,
                disabled_reason = $4,
                state = $5,
                version = version + 1,
                updated_at = NOW()
            WHERE namespace = $1 AND name = $2
            "#,
        )
        .bind(&id.namespace)
        .bind(&id.name)
        .bind(status.as_str())
        .bind(reason)
        .bind(state)
        .execute(self.pool.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        self.fetch_existing(id).await
    }

    #[instrument(skip(self, state), fields(schedule = %id, expected_version))]
    async fn put_schedule_state(
        &self,
        id: &ScheduleId,
        expected_version: i64,
        state: &TriggerSatisfactionState,
    ) -> Result<CasOutcome, StoreError> {
        let state = serde_json::to_value(state)?;
        let applied = sqlx::query(
            r#"
            UPDATE program_schedules
            SET state = $4, version = version + 1, updated_at = NOW()
            WHERE namespace = $1 AND name = $2 AND version = $3
            RETURNING version
            "#,
        )
        .bind(&id.namespace)
        .bind(&id.name)
        .bind(expected_version)
        .bind(state)
        .fetch_optional(self.pool.pool())
        .await?;

        if let Some(row) = applied {
            return Ok(CasOutcome::Applied {
                version: row.try_get("version")?,
            });
        }

        let current = sqlx::query(
            "SELECT version FROM program_schedules WHERE namespace = $1 AND name = $2",
        )
        .bind(&id.namespace)
        .bind(&id.name)
        .fetch_optional(self.pool.pool())
        .await?;

        match current {
            Some(row) => Ok(CasOutcome::Conflict {
                current_version: row.try_get("version")?,
            }),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.pool.health_check().await
    }
}
