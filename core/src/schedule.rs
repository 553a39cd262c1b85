//! Schedule registrar (C10): parses the `rate`/`cron`/`at` expression
//! grammar, and mutates an external time-based trigger through a pluggable
//! [`ScheduleBackend`] in lockstep with the persisted [`Schedule`] record.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::ids::RequestId;
use crate::message::Message;
use crate::persistence::Store;

/// `target_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleTargetType {
    WebAction,
    Notification,
    Scheduled,
    Custom,
}

impl std::fmt::Display for ScheduleTargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::WebAction => "web_action",
            Self::Notification => "notification",
            Self::Scheduled => "scheduled",
            Self::Custom => "custom",
        };
        write!(f, "{s}")
    }
}

/// `status`. `Deleted` is a soft-delete marker, never a row removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    Paused,
    Deleted,
    Error,
}

impl std::fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Deleted => "deleted",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// A registered recurring (or one-shot) trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub schedule_expression: String,
    pub timezone: String,
    pub target_type: ScheduleTargetType,
    pub target_topic_arn: String,
    /// JSON-encoded payload forwarded to the target on each firing.
    pub payload: String,
    pub eventbridge_arn: Option<String>,
    pub eventbridge_name: Option<String>,
    pub status: ScheduleStatus,
    pub created_by: String,
    pub created_date: DateTime<Utc>,
    pub updated_date: DateTime<Utc>,
    pub last_triggered: Option<DateTime<Utc>>,
    pub execution_count: u64,
    pub error_message: Option<String>,
    pub stage: crate::config::Stage,
}

/// `rate(<n> unit)`, `cron(min hr dom mon dow year)`, `at(<RFC3339>)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleExpression {
    Rate { amount: u32, unit: RateUnit },
    Cron {
        minute: String,
        hour: String,
        day_of_month: String,
        month: String,
        day_of_week: String,
        year: String,
    },
    At(DateTime<Utc>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateUnit {
    Minute,
    Hour,
    Day,
}

impl std::fmt::Display for RateUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
        };
        write!(f, "{s}")
    }
}

static RATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^rate\((\d+)\s+(minute|minutes|hour|hours|day|days)\)$").unwrap()
});
static CRON_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^cron\((\S+)\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+)\)$").unwrap());
static AT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^at\((.+)\)$").unwrap());

impl ScheduleExpression {
    /// Parse the three supported forms above. No external cron crate: the
    /// grammar is a small closed form, and `regex` is already load-bearing elsewhere
    /// in this crate.
    pub fn parse(expression: &str) -> Result<Self> {
        let expression = expression.trim();

        if let Some(caps) = RATE_RE.captures(expression) {
            let amount: u32 = caps[1]
                .parse()
                .map_err(|_| Error::InvalidPayload(format!("invalid rate amount: {expression}")))?;
            let unit = match &caps[2] {
                "minute" | "minutes" => RateUnit::Minute,
                "hour" | "hours" => RateUnit::Hour,
                "day" | "days" => RateUnit::Day,
                other => {
                    return Err(Error::InvalidPayload(format!(
                        "unknown rate unit: {other}"
                    )))
                }
            };
            return Ok(ScheduleExpression::Rate { amount, unit });
        }

        if let Some(caps) = CRON_RE.captures(expression) {
            return Ok(ScheduleExpression::Cron {
                minute: caps[1].to_string(),
                hour: caps[2].to_string(),
                day_of_month: caps[3].to_string(),
                month: caps[4].to_string(),
                day_of_week: caps[5].to_string(),
                year: caps[6].to_string(),
            });
        }

        if let Some(caps) = AT_RE.captures(expression) {
            let raw = caps[1].trim();
            let parsed = DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| {
                    Error::InvalidPayload(format!("invalid at() timestamp {raw}: {e}"))
                })?;
            return Ok(ScheduleExpression::At(parsed));
        }

        Err(Error::InvalidPayload(format!(
            "schedule_expression does not match rate()/cron()/at() grammar: {expression}"
        )))
    }
}

/// Validate an IANA timezone name, defaulting to UTC. There is
/// no bundled tz database dependency in this workspace, so this recognizes
/// the fixed `UTC` alias plus any `Region/City` shaped name -- a full
/// `chrono-tz` lookup is the natural next step if stricter validation is
/// ever required.
pub fn validate_timezone(timezone: &str) -> Result<String> {
    if timezone.is_empty() {
        return Ok("UTC".to_string());
    }
    if timezone == "UTC" || timezone.contains('/') {
        return Ok(timezone.to_string());
    }
    Err(Error::InvalidPayload(format!(
        "timezone does not look like an IANA name: {timezone}"
    )))
}

/// Sanitize `name` to `[0-9a-zA-Z-_]`, truncate to 30 chars, and append
/// `-<stage>-<unix-seconds>`, a deterministic external name.
pub fn derive_external_name(name: &str, stage: &str, unix_seconds: i64) -> String {
    let sanitized: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    let truncated: String = sanitized.chars().take(30).collect();
    format!("{truncated}-{stage}-{unix_seconds}")
}

/// The external time-based trigger service (EventBridge-shaped), modeled
/// as a collaborator -- out of scope to implement here.
#[async_trait]
pub trait ScheduleBackend: Send + Sync {
    async fn create(
        &self,
        external_name: &str,
        expression: &ScheduleExpression,
        timezone: &str,
        target_topic_arn: &str,
        payload: &str,
    ) -> Result<String>;
    async fn update(
        &self,
        external_name: &str,
        expression: &ScheduleExpression,
        timezone: &str,
        payload: &str,
    ) -> Result<()>;
    async fn delete(&self, external_name: &str) -> Result<()>;
    async fn pause(&self, external_name: &str) -> Result<()>;
    async fn resume(&self, external_name: &str) -> Result<()>;
}

/// In-memory fake backend for tests, recording the calls it received.
#[derive(Default)]
pub struct FakeScheduleBackend {
    pub created: tokio::sync::Mutex<Vec<String>>,
}

#[async_trait]
impl ScheduleBackend for FakeScheduleBackend {
    async fn create(
        &self,
        external_name: &str,
        _expression: &ScheduleExpression,
        _timezone: &str,
        _target_topic_arn: &str,
        _payload: &str,
    ) -> Result<String> {
        self.created.lock().await.push(external_name.to_string());
        Ok(format!("arn:fake:schedule:{external_name}"))
    }

    async fn update(
        &self,
        _external_name: &str,
        _expression: &ScheduleExpression,
        _timezone: &str,
        _payload: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _external_name: &str) -> Result<()> {
        Ok(())
    }

    async fn pause(&self, _external_name: &str) -> Result<()> {
        Ok(())
    }

    async fn resume(&self, _external_name: &str) -> Result<()> {
        Ok(())
    }
}

/// Production stand-in for the external time-based trigger service: there is
/// no EventBridge-equivalent wired into this workspace, so registration is
/// logged and acknowledged locally rather than calling out anywhere -- the
/// real trigger service is modeled as an out-of-scope collaborator.
pub struct LoggingScheduleBackend;

#[async_trait]
impl ScheduleBackend for LoggingScheduleBackend {
    async fn create(
        &self,
        external_name: &str,
        expression: &ScheduleExpression,
        timezone: &str,
        target_topic_arn: &str,
        _payload: &str,
    ) -> Result<String> {
        tracing::info!(external_name, ?expression, timezone, target_topic_arn, "registering schedule");
        Ok(format!("local:schedule:{external_name}"))
    }

    async fn update(
        &self,
        external_name: &str,
        expression: &ScheduleExpression,
        timezone: &str,
        _payload: &str,
    ) -> Result<()> {
        tracing::info!(external_name, ?expression, timezone, "updating schedule");
        Ok(())
    }

    async fn delete(&self, external_name: &str) -> Result<()> {
        tracing::info!(external_name, "deleting schedule");
        Ok(())
    }

    async fn pause(&self, external_name: &str) -> Result<()> {
        tracing::info!(external_name, "pausing schedule");
        Ok(())
    }

    async fn resume(&self, external_name: &str) -> Result<()> {
        tracing::info!(external_name, "resuming schedule");
        Ok(())
    }
}

/// Operation arguments whitelisted for copying onto the schedule's generated
/// payload message, copying only whitelisted operation arguments.
const WHITELISTED_ARGUMENT_KEYS: &[&str] = &["operation", "course_id", "action"];

/// Handles `schedule_creation` messages, mutating the external
/// registration and the persisted [`Schedule`] record in lockstep.
pub struct Registrar {
    store: Arc<dyn Store>,
    backend: Arc<dyn ScheduleBackend>,
}

impl Registrar {
    pub fn new(store: Arc<dyn Store>, backend: Arc<dyn ScheduleBackend>) -> Self {
        Self { store, backend }
    }

    /// Dispatch a `schedule_creation` message's `arguments.action`.
    pub async fn handle(&self, message: &Message, now: DateTime<Utc>) -> Result<()> {
        let action = message
            .arguments
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::InvalidPayload("schedule_creation requires arguments.action".to_string())
            })?;

        match action {
            "create" => self.create(message, now).await,
            "update" => self.update(message).await,
            "delete" => self.delete(message).await,
            "pause" => self.set_status(message, ScheduleStatus::Paused).await,
            "resume" => self.set_status(message, ScheduleStatus::Active).await,
            other => Err(Error::InvalidPayload(format!(
                "unknown schedule_creation action: {other}"
            ))),
        }
    }

    async fn create(&self, message: &Message, now: DateTime<Utc>) -> Result<()> {
        let arguments = &message.arguments;
        let name = string_argument(arguments, "name")?;
        let expression_raw = string_argument(arguments, "schedule_expression")?;
        let target_type_raw = string_argument(arguments, "target_type")?;
        let timezone_raw = arguments
            .get("timezone")
            .and_then(Value::as_str)
            .unwrap_or("UTC");

        let expression = ScheduleExpression::parse(&expression_raw)?;
        let timezone = validate_timezone(timezone_raw)?;
        let target_type: ScheduleTargetType =
            serde_json::from_value(Value::String(target_type_raw.clone()))
                .map_err(|_| Error::InvalidPayload(format!("invalid target_type: {target_type_raw}")))?;

        let target_topic_arn = arguments
            .get("target_topic_arn")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let payload_args: serde_json::Map<String, Value> = WHITELISTED_ARGUMENT_KEYS
            .iter()
            .filter_map(|key| arguments.get(*key).map(|v| (key.to_string(), v.clone())))
            .collect();
        let payload = serde_json::to_string(&payload_args)?;

        let external_name = derive_external_name(&name, &message.stage.to_string(), now.timestamp());

        let mut schedule = Schedule {
            id: format!("sched_{}", RequestId::new()),
            name,
            description: arguments
                .get("description")
                .and_then(Value::as_str)
                .map(String::from),
            schedule_expression: expression_raw,
            timezone,
            target_type,
            target_topic_arn: target_topic_arn.clone(),
            payload,
            eventbridge_arn: None,
            eventbridge_name: Some(external_name.clone()),
            status: ScheduleStatus::Active,
            created_by: message.created_by.clone(),
            created_date: now,
            updated_date: now,
            last_triggered: None,
            execution_count: 0,
            error_message: None,
            stage: message.stage,
        };

        match self
            .backend
            .create(
                &external_name,
                &expression,
                &schedule.timezone,
                &target_topic_arn,
                &schedule.payload,
            )
            .await
        {
            Ok(arn) => {
                schedule.eventbridge_arn = Some(arn);
                self.store.put_schedule(&schedule).await?;
                Ok(())
            }
            Err(err) => {
                schedule.status = ScheduleStatus::Error;
                schedule.error_message = Some(err.to_string());
                // Persisted for audit even though registration failed; the
                // caller still sees the error.
                self.store.put_schedule(&schedule).await?;
                Err(err)
            }
        }
    }

    async fn update(&self, message: &Message) -> Result<()> {
        let id = string_argument(&message.arguments, "schedule_id")?;
        let mut schedule = self
            .store
            .get_schedule(&id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("schedule {id} not found")))?;

        if let Some(raw) = message.arguments.get("schedule_expression").and_then(Value::as_str) {
            let expression = ScheduleExpression::parse(raw)?;
            let external_name = schedule
                .eventbridge_name
                .clone()
                .ok_or_else(|| Error::Internal("schedule has no external name".to_string()))?;
            self.backend
                .update(&external_name, &expression, &schedule.timezone, &schedule.payload)
                .await?;
            schedule.schedule_expression = raw.to_string();
        }

        schedule.updated_date = Utc::now();
        self.store.update_schedule(&schedule).await
    }

    async fn delete(&self, message: &Message) -> Result<()> {
        let id = string_argument(&message.arguments, "schedule_id")?;
        let mut schedule = self
            .store
            .get_schedule(&id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("schedule {id} not found")))?;

        if let Some(external_name) = &schedule.eventbridge_name {
            self.backend.delete(external_name).await?;
        }

        schedule.status = ScheduleStatus::Deleted;
        schedule.updated_date = Utc::now();
        self.store.update_schedule(&schedule).await
    }

    async fn set_status(&self, message: &Message, status: ScheduleStatus) -> Result<()> {
        let id = string_argument(&message.arguments, "schedule_id")?;
        let mut schedule = self
            .store
            .get_schedule(&id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("schedule {id} not found")))?;

        let external_name = schedule
            .eventbridge_name
            .clone()
            .ok_or_else(|| Error::Internal("schedule has no external name".to_string()))?;

        match status {
            ScheduleStatus::Paused => self.backend.pause(&external_name).await?,
            ScheduleStatus::Active => self.backend.resume(&external_name).await?,
            _ => {}
        }

        schedule.status = status;
        schedule.updated_date = Utc::now();
        self.store.update_schedule(&schedule).await
    }
}

fn string_argument(arguments: &std::collections::HashMap<String, Value>, key: &str) -> Result<String> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| Error::InvalidPayload(format!("schedule_creation requires arguments.{key}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Stage;
    use crate::message::MessageType;
    use crate::persistence::InMemoryStore;
    use std::collections::HashMap;

    #[test]
    fn test_parse_rate_expression() {
        let parsed = ScheduleExpression::parse("rate(5 minutes)").unwrap();
        assert_eq!(
            parsed,
            ScheduleExpression::Rate {
                amount: 5,
                unit: RateUnit::Minute
            }
        );
    }

    #[test]
    fn test_parse_cron_expression_requires_six_fields() {
        let parsed = ScheduleExpression::parse("cron(0 9 * * ? *)").unwrap();
        assert!(matches!(parsed, ScheduleExpression::Cron { .. }));
        assert!(ScheduleExpression::parse("cron(0 9 * * ?)").is_err());
    }

    #[test]
    fn test_parse_at_expression_rfc3339() {
        let parsed = ScheduleExpression::parse("at(2026-01-01T00:00:00Z)").unwrap();
        assert!(matches!(parsed, ScheduleExpression::At(_)));
    }

    #[test]
    fn test_parse_rejects_unknown_grammar() {
        assert!(ScheduleExpression::parse("every tuesday").is_err());
    }

    #[test]
    fn test_derive_external_name_sanitizes_and_truncates() {
        let name = derive_external_name("Weekly Weather Check!! ", "prod", 1_700_000_000);
        assert!(name.starts_with("WeeklyWeatherCheck"));
        assert!(name.ends_with("-prod-1700000000"));
        assert!(!name.contains(' ') && !name.contains('!'));
    }

    #[test]
    fn test_validate_timezone_defaults_to_utc() {
        assert_eq!(validate_timezone("").unwrap(), "UTC");
        assert_eq!(validate_timezone("America/New_York").unwrap(), "America/New_York");
        assert!(validate_timezone("not-a-timezone").is_err());
    }

    fn create_message(action: &str, extra: &[(&str, &str)]) -> Message {
        let mut arguments = HashMap::new();
        arguments.insert("action".to_string(), Value::String(action.to_string()));
        for (k, v) in extra {
            arguments.insert(k.to_string(), Value::String(v.to_string()));
        }
        Message::new(Stage::Dev, MessageType::ScheduleCreation, "test-suite", HashMap::new(), arguments)
    }

    #[tokio::test]
    async fn test_registrar_create_persists_active_schedule() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(FakeScheduleBackend::default());
        let registrar = Registrar::new(store.clone(), backend.clone());

        let message = create_message(
            "create",
            &[
                ("name", "Daily Weather"),
                ("schedule_expression", "rate(1 day)"),
                ("target_type", "web_action"),
                ("timezone", "UTC"),
            ],
        );

        registrar.handle(&message, Utc::now()).await.unwrap();
        assert_eq!(backend.created.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_registrar_create_missing_name_fails() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(FakeScheduleBackend::default());
        let registrar = Registrar::new(store, backend);

        let message = create_message(
            "create",
            &[("schedule_expression", "rate(1 day)"), ("target_type", "web_action")],
        );

        assert!(registrar.handle(&message, Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn test_registrar_pause_then_resume_round_trips_status() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(FakeScheduleBackend::default());
        let registrar = Registrar::new(store.clone(), backend.clone());

        let now = Utc::now();
        let schedule = Schedule {
            id: "sched_fixed_test".to_string(),
            name: "Daily Weather".to_string(),
            description: None,
            schedule_expression: "rate(1 day)".to_string(),
            timezone: "UTC".to_string(),
            target_type: ScheduleTargetType::WebAction,
            target_topic_arn: String::new(),
            payload: "{}".to_string(),
            eventbridge_arn: Some("arn:fake:schedule:daily-weather".to_string()),
            eventbridge_name: Some("daily-weather".to_string()),
            status: ScheduleStatus::Active,
            created_by: "test-suite".to_string(),
            created_date: now,
            updated_date: now,
            last_triggered: None,
            execution_count: 0,
            error_message: None,
            stage: Stage::Dev,
        };
        store.put_schedule(&schedule).await.unwrap();

        let pause = create_message("pause", &[("schedule_id", "sched_fixed_test")]);
        registrar.handle(&pause, now).await.unwrap();
        let paused = store.get_schedule("sched_fixed_test").await.unwrap().unwrap();
        assert_eq!(paused.status, ScheduleStatus::Paused);

        let resume = create_message("resume", &[("schedule_id", "sched_fixed_test")]);
        registrar.handle(&resume, now).await.unwrap();
        let resumed = store.get_schedule("sched_fixed_test").await.unwrap().unwrap();
        assert_eq!(resumed.status, ScheduleStatus::Active);
    }
}
