//! Persistence adapter (C5): the keyed record store behind `messages`,
//! `web_action_results`, and `schedules`, with conditional writes that back
//! every status transition's idempotency guarantee.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::message::{Message, MessageStatus};
use crate::schedule::Schedule;
use crate::web_action::WebActionResult;

/// Outcome of a conditional status transition. `AlreadyTransitioned` is not
/// surfaced as an error -- the caller should treat it as success and stop.
#[derive(Debug)]
pub enum ConditionalUpdateOutcome {
    Updated(Message),
    AlreadyTransitioned,
}

/// The persistence adapter's full surface across its three logical tables.
#[async_trait]
pub trait Store: Send + Sync {
    async fn put_message(&self, message: &Message) -> Result<()>;
    async fn get_message(&self, id: &str) -> Result<Option<Message>>;
    async fn query_messages_by_status(
        &self,
        status: MessageStatus,
        limit: i64,
    ) -> Result<Vec<Message>>;
    /// `update_conditional`: transitions to `new_status` only if the stored
    /// record's status is in `precondition`; otherwise a no-op that returns
    /// `AlreadyTransitioned`.
    async fn update_message_conditional(
        &self,
        id: &str,
        new_status: MessageStatus,
        precondition: &[MessageStatus],
        error_message: Option<String>,
    ) -> Result<ConditionalUpdateOutcome>;
    async fn delete_message(&self, id: &str) -> Result<()>;

    async fn put_web_action_result(&self, result: &WebActionResult) -> Result<()>;
    async fn get_web_action_result(&self, id: &str) -> Result<Option<WebActionResult>>;
    async fn query_web_action_results_by_message(
        &self,
        message_id: &str,
    ) -> Result<Vec<WebActionResult>>;

    async fn put_schedule(&self, schedule: &Schedule) -> Result<()>;
    async fn get_schedule(&self, id: &str) -> Result<Option<Schedule>>;
    async fn update_schedule(&self, schedule: &Schedule) -> Result<()>;
    async fn delete_schedule(&self, id: &str) -> Result<()>;

    /// Sweep rows past their retention epoch. Postgres has no native
    /// per-row TTL, unlike the keyed store this abstraction is modeled on,
    /// so this stands in for automatic deletion -- run from the seeder's
    /// scheduled tick or a worker's startup.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// `sqlx`-backed implementation against Postgres, reusing
/// `crate::database::create_pool` for connection setup and retry.
pub struct PostgresStore {
    pool: PgPool,
    config: DatabaseConfig,
}

impl PostgresStore {
    pub fn new(pool: PgPool, config: DatabaseConfig) -> Self {
        Self { pool, config }
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn put_message(&self, message: &Message) -> Result<()> {
        let payload = serde_json::to_value(&message.payload)?;
        let arguments = serde_json::to_value(&message.arguments)?;
        let auth_config = serde_json::to_value(&message.auth_config)?;

        sqlx::query(&format!(
            "INSERT INTO {} (id, version, stage, message_type, status, created_by, \
             created_date, updated_date, retry_count, error_message, payload, arguments, \
             auth_config) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13) \
             ON CONFLICT (id) DO NOTHING",
            self.config.messages_table
        ))
        .bind(&message.id)
        .bind(&message.version)
        .bind(message.stage.to_string())
        .bind(message.message_type.to_string())
        .bind(message.status.to_string())
        .bind(&message.created_by)
        .bind(message.created_date)
        .bind(message.updated_date)
        .bind(message.retry_count as i32)
        .bind(&message.error_message)
        .bind(payload)
        .bind(arguments)
        .bind(auth_config)
        .execute(&self.pool)
        .await
        .map_err(Error::from)?;

        Ok(())
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT * FROM {} WHERE id = $1",
            self.config.messages_table
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::from)?;

        row.map(MessageRow::into_message).transpose()
    }

    async fn query_messages_by_status(
        &self,
        status: MessageStatus,
        limit: i64,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT * FROM {} WHERE status = $1 ORDER BY created_date DESC LIMIT $2",
            self.config.messages_table
        ))
        .bind(status.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::from)?;

        rows.into_iter().map(MessageRow::into_message).collect()
    }

    async fn update_message_conditional(
        &self,
        id: &str,
        new_status: MessageStatus,
        precondition: &[MessageStatus],
        error_message: Option<String>,
    ) -> Result<ConditionalUpdateOutcome> {
        let allowed: Vec<String> = precondition.iter().map(|s| s.to_string()).collect();

        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "UPDATE {} SET status = $1, error_message = $2, updated_date = now() \
             WHERE id = $3 AND status = ANY($4) RETURNING *",
            self.config.messages_table
        ))
        .bind(new_status.to_string())
        .bind(&error_message)
        .bind(id)
        .bind(&allowed)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::from)?;

        match row {
            Some(row) => Ok(ConditionalUpdateOutcome::Updated(row.into_message()?)),
            None => Ok(ConditionalUpdateOutcome::AlreadyTransitioned),
        }
    }

    async fn delete_message(&self, id: &str) -> Result<()> {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE id = $1",
            self.config.messages_table
        ))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::from)?;
        Ok(())
    }

    async fn put_web_action_result(&self, result: &WebActionResult) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (id, message_id, action, url, status, response_code, \
             response_body, error_message, execution_time_ms, created_date, stage) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)",
            self.config.web_action_results_table
        ))
        .bind(&result.id)
        .bind(&result.message_id)
        .bind(serde_json::to_string(&result.action)?)
        .bind(&result.url)
        .bind(&result.status)
        .bind(result.response_code.map(|c| c as i32))
        .bind(&result.response_body)
        .bind(&result.error_message)
        .bind(result.execution_time_ms as i64)
        .bind(result.created_date)
        .bind(result.stage.to_string())
        .execute(&self.pool)
        .await
        .map_err(Error::from)?;

        Ok(())
    }

    async fn get_web_action_result(&self, id: &str) -> Result<Option<WebActionResult>> {
        let row = sqlx::query_as::<_, WebActionResultRow>(&format!(
            "SELECT * FROM {} WHERE id = $1",
            self.config.web_action_results_table
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::from)?;

        row.map(WebActionResultRow::into_result).transpose()
    }

    async fn query_web_action_results_by_message(
        &self,
        message_id: &str,
    ) -> Result<Vec<WebActionResult>> {
        let rows = sqlx::query_as::<_, WebActionResultRow>(&format!(
            "SELECT * FROM {} WHERE message_id = $1 ORDER BY created_date ASC",
            self.config.web_action_results_table
        ))
        .bind(message_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::from)?;

        rows.into_iter()
            .map(WebActionResultRow::into_result)
            .collect()
    }

    async fn put_schedule(&self, schedule: &Schedule) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (id, name, description, schedule_expression, timezone, \
             target_type, target_topic_arn, payload, eventbridge_arn, eventbridge_name, \
             status, created_by, created_date, updated_date, last_triggered, \
             execution_count, error_message, stage) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18)",
            self.config.schedules_table
        ))
        .bind(&schedule.id)
        .bind(&schedule.name)
        .bind(&schedule.description)
        .bind(&schedule.schedule_expression)
        .bind(&schedule.timezone)
        .bind(schedule.target_type.to_string())
        .bind(&schedule.target_topic_arn)
        .bind(&schedule.payload)
        .bind(&schedule.eventbridge_arn)
        .bind(&schedule.eventbridge_name)
        .bind(schedule.status.to_string())
        .bind(&schedule.created_by)
        .bind(schedule.created_date)
        .bind(schedule.updated_date)
        .bind(schedule.last_triggered)
        .bind(schedule.execution_count as i64)
        .bind(&schedule.error_message)
        .bind(schedule.stage.to_string())
        .execute(&self.pool)
        .await
        .map_err(Error::from)?;

        Ok(())
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<Schedule>> {
        let row = sqlx::query_as::<_, ScheduleRow>(&format!(
            "SELECT * FROM {} WHERE id = $1",
            self.config.schedules_table
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::from)?;

        row.map(ScheduleRow::into_schedule).transpose()
    }

    async fn update_schedule(&self, schedule: &Schedule) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {} SET status = $1, last_triggered = $2, execution_count = $3, \
             error_message = $4, updated_date = now() WHERE id = $5",
            self.config.schedules_table
        ))
        .bind(schedule.status.to_string())
        .bind(schedule.last_triggered)
        .bind(schedule.execution_count as i64)
        .bind(&schedule.error_message)
        .bind(&schedule.id)
        .execute(&self.pool)
        .await
        .map_err(Error::from)?;

        Ok(())
    }

    async fn delete_schedule(&self, id: &str) -> Result<()> {
        // `delete` leaves the record for audit: soft-delete by
        // status, not a row removal.
        sqlx::query(&format!(
            "UPDATE {} SET status = 'deleted', updated_date = now() WHERE id = $1",
            self.config.schedules_table
        ))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::from)?;

        Ok(())
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let results_deleted = sqlx::query(&format!(
            "DELETE FROM {} WHERE expires_at < $1",
            self.config.web_action_results_table
        ))
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Error::from)?
        .rows_affected();

        // `messages` carries a 90-day retention epoch off `created_date`
        // rather than its own `expires_at` column.
        let message_cutoff = now - chrono::Duration::days(MESSAGE_RETENTION_DAYS);
        let messages_deleted = sqlx::query(&format!(
            "DELETE FROM {} WHERE created_date < $1",
            self.config.messages_table
        ))
        .bind(message_cutoff)
        .execute(&self.pool)
        .await
        .map_err(Error::from)?
        .rows_affected();

        Ok(results_deleted + messages_deleted)
    }
}

/// Message retention epoch: rows are deleted automatically after 90 days.
const MESSAGE_RETENTION_DAYS: i64 = 90;

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    version: String,
    stage: String,
    message_type: String,
    status: String,
    created_by: String,
    created_date: DateTime<Utc>,
    updated_date: DateTime<Utc>,
    retry_count: i32,
    error_message: Option<String>,
    payload: serde_json::Value,
    arguments: serde_json::Value,
    auth_config: serde_json::Value,
}

impl MessageRow {
    fn into_message(self) -> Result<Message> {
        Ok(Message {
            id: self.id,
            version: self.version,
            stage: parse_stage(&self.stage)?,
            message_type: serde_json::from_value(serde_json::Value::String(self.message_type))?,
            status: serde_json::from_value(serde_json::Value::String(self.status))?,
            created_by: self.created_by,
            created_date: self.created_date,
            updated_date: self.updated_date,
            retry_count: self.retry_count as u32,
            error_message: self.error_message,
            payload: serde_json::from_value(self.payload).unwrap_or_default(),
            arguments: serde_json::from_value(self.arguments).unwrap_or_default(),
            auth_config: serde_json::from_value(self.auth_config).unwrap_or(None),
        })
    }
}

#[derive(sqlx::FromRow)]
struct WebActionResultRow {
    id: String,
    message_id: String,
    action: String,
    url: String,
    status: String,
    response_code: Option<i32>,
    response_body: Option<String>,
    error_message: Option<String>,
    execution_time_ms: i64,
    created_date: DateTime<Utc>,
    stage: String,
}

impl WebActionResultRow {
    fn into_result(self) -> Result<WebActionResult> {
        Ok(WebActionResult {
            id: self.id,
            message_id: self.message_id,
            action: serde_json::from_str(&self.action)?,
            url: self.url,
            status: self.status,
            response_code: self.response_code.map(|c| c as u16),
            response_body: self.response_body,
            error_message: self.error_message,
            execution_time_ms: self.execution_time_ms as u64,
            created_date: self.created_date,
            stage: parse_stage(&self.stage)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ScheduleRow {
    id: String,
    name: String,
    description: Option<String>,
    schedule_expression: String,
    timezone: String,
    target_type: String,
    target_topic_arn: String,
    payload: String,
    eventbridge_arn: Option<String>,
    eventbridge_name: Option<String>,
    status: String,
    created_by: String,
    created_date: DateTime<Utc>,
    updated_date: DateTime<Utc>,
    last_triggered: Option<DateTime<Utc>>,
    execution_count: i64,
    error_message: Option<String>,
    stage: String,
}

impl ScheduleRow {
    fn into_schedule(self) -> Result<Schedule> {
        Ok(Schedule {
            id: self.id,
            name: self.name,
            description: self.description,
            schedule_expression: self.schedule_expression,
            timezone: self.timezone,
            target_type: serde_json::from_value(serde_json::Value::String(self.target_type))?,
            target_topic_arn: self.target_topic_arn,
            payload: self.payload,
            eventbridge_arn: self.eventbridge_arn,
            eventbridge_name: self.eventbridge_name,
            status: serde_json::from_value(serde_json::Value::String(self.status))?,
            created_by: self.created_by,
            created_date: self.created_date,
            updated_date: self.updated_date,
            last_triggered: self.last_triggered,
            execution_count: self.execution_count as u64,
            error_message: self.error_message,
            stage: parse_stage(&self.stage)?,
        })
    }
}

fn parse_stage(value: &str) -> Result<crate::config::Stage> {
    serde_json::from_value(serde_json::Value::String(value.to_string())).map_err(Error::from)
}

/// In-memory fake implementing the same trait the Postgres adapter
/// implements, used in tests exercising the message lifecycle without a
/// real database connection.
#[derive(Default)]
pub struct InMemoryStore {
    messages: RwLock<HashMap<String, Message>>,
    results: RwLock<HashMap<String, WebActionResult>>,
    schedules: RwLock<HashMap<String, Schedule>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn put_message(&self, message: &Message) -> Result<()> {
        let mut guard = self.messages.write().await;
        guard.entry(message.id.clone()).or_insert_with(|| message.clone());
        Ok(())
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        Ok(self.messages.read().await.get(id).cloned())
    }

    async fn query_messages_by_status(
        &self,
        status: MessageStatus,
        limit: i64,
    ) -> Result<Vec<Message>> {
        let guard = self.messages.read().await;
        Ok(guard
            .values()
            .filter(|m| m.status == status)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn update_message_conditional(
        &self,
        id: &str,
        new_status: MessageStatus,
        precondition: &[MessageStatus],
        error_message: Option<String>,
    ) -> Result<ConditionalUpdateOutcome> {
        let mut guard = self.messages.write().await;
        let Some(message) = guard.get_mut(id) else {
            return Ok(ConditionalUpdateOutcome::AlreadyTransitioned);
        };

        if !precondition.contains(&message.status) {
            return Ok(ConditionalUpdateOutcome::AlreadyTransitioned);
        }

        message.status = new_status;
        message.error_message = error_message;
        message.updated_date = Utc::now();
        Ok(ConditionalUpdateOutcome::Updated(message.clone()))
    }

    async fn delete_message(&self, id: &str) -> Result<()> {
        self.messages.write().await.remove(id);
        Ok(())
    }

    async fn put_web_action_result(&self, result: &WebActionResult) -> Result<()> {
        self.results
            .write()
            .await
            .insert(result.id.clone(), result.clone());
        Ok(())
    }

    async fn get_web_action_result(&self, id: &str) -> Result<Option<WebActionResult>> {
        Ok(self.results.read().await.get(id).cloned())
    }

    async fn query_web_action_results_by_message(
        &self,
        message_id: &str,
    ) -> Result<Vec<WebActionResult>> {
        let guard = self.results.read().await;
        Ok(guard
            .values()
            .filter(|r| r.message_id == message_id)
            .cloned()
            .collect())
    }

    async fn put_schedule(&self, schedule: &Schedule) -> Result<()> {
        self.schedules
            .write()
            .await
            .insert(schedule.id.clone(), schedule.clone());
        Ok(())
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<Schedule>> {
        Ok(self.schedules.read().await.get(id).cloned())
    }

    async fn update_schedule(&self, schedule: &Schedule) -> Result<()> {
        self.schedules
            .write()
            .await
            .insert(schedule.id.clone(), schedule.clone());
        Ok(())
    }

    async fn delete_schedule(&self, id: &str) -> Result<()> {
        if let Some(schedule) = self.schedules.write().await.get_mut(id) {
            schedule.status = crate::schedule::ScheduleStatus::Deleted;
        }
        Ok(())
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut results_removed = 0usize;
        {
            let mut guard = self.results.write().await;
            let before = guard.len();
            guard.retain(|_, r| r.expires_at() >= now);
            results_removed = before - guard.len();
        }

        let message_cutoff = now - chrono::Duration::days(MESSAGE_RETENTION_DAYS);
        let mut messages_removed = 0usize;
        {
            let mut guard = self.messages.write().await;
            let before = guard.len();
            guard.retain(|_, m| m.created_date >= message_cutoff);
            messages_removed = before - guard.len();
        }

        Ok((results_removed + messages_removed) as u64)
    }
}

/// Shared handle to a store, the shape every worker binary holds in its
/// `AppState`-adjacent wiring.
pub type SharedStore = Arc<dyn Store>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Stage;
    use crate::message::MessageType;
    use std::collections::HashMap as StdHashMap;

    fn sample_message() -> Message {
        Message::new(
            Stage::Dev,
            MessageType::HelloWorld,
            "test-suite",
            StdHashMap::new(),
            StdHashMap::new(),
        )
    }

    #[tokio::test]
    async fn test_in_memory_put_then_get_round_trips() {
        let store = InMemoryStore::new();
        let message = sample_message();
        store.put_message(&message).await.unwrap();
        let fetched = store.get_message(&message.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, message.id);
    }

    #[tokio::test]
    async fn test_conditional_update_succeeds_from_valid_precondition() {
        let store = InMemoryStore::new();
        let message = sample_message();
        store.put_message(&message).await.unwrap();

        let outcome = store
            .update_message_conditional(
                &message.id,
                MessageStatus::Queued,
                &[MessageStatus::Created],
                None,
            )
            .await
            .unwrap();

        assert!(matches!(outcome, ConditionalUpdateOutcome::Updated(_)));
    }

    #[tokio::test]
    async fn test_conditional_update_rejects_wrong_precondition() {
        let store = InMemoryStore::new();
        let message = sample_message();
        store.put_message(&message).await.unwrap();

        let outcome = store
            .update_message_conditional(
                &message.id,
                MessageStatus::Completed,
                &[MessageStatus::Processing],
                None,
            )
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            ConditionalUpdateOutcome::AlreadyTransitioned
        ));
    }

    #[tokio::test]
    async fn test_concurrent_conditional_updates_exactly_one_succeeds() {
        let store = Arc::new(InMemoryStore::new());
        let message = sample_message();
        store.put_message(&message).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let id = message.id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update_message_conditional(
                        &id,
                        MessageStatus::Queued,
                        &[MessageStatus::Created],
                        None,
                    )
                    .await
                    .unwrap()
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), ConditionalUpdateOutcome::Updated(_)) {
                successes += 1;
            }
        }

        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn test_sweep_expired_removes_only_past_retention() {
        let store = InMemoryStore::new();
        let mut expired = WebActionResult::success(
            "msg-1",
            crate::web_action::WebActionKind::Weather,
            "https://api.weather.gov/x",
            200,
            "ok",
            10,
            Stage::Dev,
        );
        expired.created_date = Utc::now() - chrono::Duration::days(10);
        store.put_web_action_result(&expired).await.unwrap();

        let fresh = WebActionResult::success(
            "msg-2",
            crate::web_action::WebActionKind::Weather,
            "https://api.weather.gov/x",
            200,
            "ok",
            10,
            Stage::Dev,
        );
        store.put_web_action_result(&fresh).await.unwrap();

        let removed = store.sweep_expired(Utc::now()).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_web_action_result(&fresh.id).await.unwrap().is_some());
    }
}
