//! Message model and per-type payload validation (C1)
//!
//! `Message` is the durable unit of work flowing through every component in
//! this crate: ingress and the seeder create it, C6 publishes it, C7 hands it
//! to a [`Handler`](crate::consumer::Handler), and C5 is the only component
//! allowed to mutate its persisted record.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Stage;
use crate::error::{Error, Result};
use crate::ids::RequestId;

/// Closed set of message kinds. New kinds require a validator arm in
/// [`Message::validate`] -- there is no untyped fallthrough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    HelloWorld,
    Notify,
    AgentResponse,
    Scheduled,
    WebAction,
    ScheduleCreation,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::HelloWorld => "hello_world",
            Self::Notify => "notify",
            Self::AgentResponse => "agent_response",
            Self::Scheduled => "scheduled",
            Self::WebAction => "web_action",
            Self::ScheduleCreation => "schedule_creation",
        };
        write!(f, "{s}")
    }
}

/// Status-machine states. The monotonic graph
/// `created -> queued -> processing -> {completed|failed}` is enforced by
/// C5's conditional write, not by this type -- see `Store::update_conditional`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Created,
    Queued,
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl MessageStatus {
    /// States a conditional update may legally originate from to reach this one.
    pub fn preconditions(self) -> &'static [MessageStatus] {
        match self {
            MessageStatus::Created => &[],
            MessageStatus::Queued => &[MessageStatus::Created],
            MessageStatus::Processing => &[MessageStatus::Created, MessageStatus::Queued],
            MessageStatus::Completed => &[MessageStatus::Processing],
            MessageStatus::Failed => &[MessageStatus::Processing],
        }
    }
}

/// Authentication mode attached to a message, used by C9's common prelude
/// and verified through C3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthConfigType {
    None,
    OauthPassword,
    ApiKey,
    Bearer,
}

/// `Message.auth_config`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(rename = "type")]
    pub auth_type: AuthConfigType,
    #[serde(default)]
    pub secret_name: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default)]
    pub jwks_url: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl AuthConfig {
    /// `oauth_password` requires a non-empty `secret_name`; any configured
    /// token endpoint must use TLS.
    pub fn validate(&self) -> Result<()> {
        if self.auth_type == AuthConfigType::OauthPassword
            && self.secret_name.as_deref().unwrap_or("").is_empty()
        {
            return Err(Error::InvalidPayload(
                "oauth_password auth_config requires a non-empty secret_name".to_string(),
            ));
        }

        if let Some(url) = &self.token_url {
            if !url.starts_with("https://") {
                return Err(Error::InvalidPayload(
                    "auth_config.token_url must use https".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// The durable unit of work flowing through every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub stage: Stage,
    pub message_type: MessageType,
    pub status: MessageStatus,
    pub created_by: String,
    pub created_date: DateTime<Utc>,
    pub updated_date: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub payload: HashMap<String, Value>,
    #[serde(default)]
    pub arguments: HashMap<String, Value>,
    #[serde(default)]
    pub auth_config: Option<AuthConfig>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Message {
    /// Build a new `created` message. `created_date`/`updated_date` are
    /// stamped to the same instant and `id` is minted from [`RequestId`]'s
    /// UUIDv7 scheme so ids sort by creation time.
    pub fn new(
        stage: Stage,
        message_type: MessageType,
        created_by: impl Into<String>,
        payload: HashMap<String, Value>,
        arguments: HashMap<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RequestId::new().to_string(),
            version: default_version(),
            stage,
            message_type,
            status: MessageStatus::Created,
            created_by: created_by.into(),
            created_date: now,
            updated_date: now,
            retry_count: 0,
            error_message: None,
            payload,
            arguments,
            auth_config: None,
        }
    }

    /// Per-type payload/argument contract. Never mutates state;
    /// a failure always surfaces as `Error::InvalidPayload`.
    pub fn validate(&self) -> Result<()> {
        match self.message_type {
            MessageType::WebAction => self.validate_web_action(),
            MessageType::ScheduleCreation => self.validate_schedule_creation(),
            _ => self.validate_generic(),
        }
    }

    fn validate_web_action(&self) -> Result<()> {
        let payload = crate::web_action::WebActionPayload::from_fields(&self.payload)?;
        payload.validate()?;

        if let Some(auth) = &self.auth_config {
            auth.validate()?;
        }

        Ok(())
    }

    fn validate_schedule_creation(&self) -> Result<()> {
        let action = self
            .arguments
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::InvalidPayload("schedule_creation requires arguments.action".to_string())
            })?;

        if action == "create" {
            for field in ["name", "schedule_expression", "target_type", "timezone"] {
                if self.arguments.get(field).and_then(Value::as_str).is_none() {
                    return Err(Error::InvalidPayload(format!(
                        "schedule_creation action=create requires arguments.{field}"
                    )));
                }
            }
        } else if !matches!(action, "update" | "delete" | "pause" | "resume") {
            return Err(Error::InvalidPayload(format!(
                "unknown schedule_creation action: {action}"
            )));
        }

        Ok(())
    }

    fn validate_generic(&self) -> Result<()> {
        if self.created_by.is_empty() {
            return Err(Error::InvalidPayload(
                "created_by must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// `created -> queued`
    pub fn mark_queued(&mut self) {
        self.status = MessageStatus::Queued;
        self.updated_date = Utc::now();
    }

    /// `{created,queued} -> processing`
    pub fn mark_processing(&mut self) {
        self.status = MessageStatus::Processing;
        self.updated_date = Utc::now();
    }

    /// `processing -> completed`
    pub fn mark_completed(&mut self) {
        self.status = MessageStatus::Completed;
        self.error_message = None;
        self.updated_date = Utc::now();
    }

    /// `processing -> failed`, stamping the non-empty error message invariant.
    pub fn mark_failed(&mut self, error_message: impl Into<String>) {
        self.status = MessageStatus::Failed;
        self.error_message = Some(error_message.into());
        self.updated_date = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello_world() -> Message {
        Message::new(
            Stage::Dev,
            MessageType::HelloWorld,
            "test-suite",
            HashMap::new(),
            HashMap::new(),
        )
    }

    #[test]
    fn test_new_message_is_created() {
        let msg = hello_world();
        assert_eq!(msg.status, MessageStatus::Created);
        assert_eq!(msg.created_date, msg.updated_date);
        assert_eq!(msg.retry_count, 0);
    }

    #[test]
    fn test_generic_validate_requires_created_by() {
        let mut msg = hello_world();
        msg.created_by = String::new();
        assert!(msg.validate().is_err());
    }

    #[test]
    fn test_mark_failed_sets_error_message() {
        let mut msg = hello_world();
        msg.mark_queued();
        msg.mark_processing();
        msg.mark_failed("upstream exploded");
        assert_eq!(msg.status, MessageStatus::Failed);
        assert_eq!(msg.error_message.as_deref(), Some("upstream exploded"));
    }

    #[test]
    fn test_mark_completed_clears_error_message() {
        let mut msg = hello_world();
        msg.error_message = Some("stale".to_string());
        msg.mark_completed();
        assert!(msg.error_message.is_none());
    }

    #[test]
    fn test_schedule_creation_requires_action() {
        let msg = Message::new(
            Stage::Dev,
            MessageType::ScheduleCreation,
            "test-suite",
            HashMap::new(),
            HashMap::new(),
        );
        assert!(msg.validate().is_err());
    }

    #[test]
    fn test_schedule_creation_create_requires_full_fields() {
        let mut arguments = HashMap::new();
        arguments.insert("action".to_string(), Value::String("create".to_string()));
        let msg = Message::new(
            Stage::Dev,
            MessageType::ScheduleCreation,
            "test-suite",
            HashMap::new(),
            arguments,
        );
        assert!(msg.validate().is_err());
    }

    #[test]
    fn test_schedule_creation_pause_only_requires_action() {
        let mut arguments = HashMap::new();
        arguments.insert("action".to_string(), Value::String("pause".to_string()));
        let msg = Message::new(
            Stage::Dev,
            MessageType::ScheduleCreation,
            "test-suite",
            HashMap::new(),
            arguments,
        );
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_serde_round_trip_preserves_fields() {
        let msg = hello_world();
        let json = serde_json::to_string(&msg).unwrap();
        let round_tripped: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(round_tripped.id, msg.id);
        assert_eq!(round_tripped.status, msg.status);
        assert_eq!(round_tripped.created_date, msg.created_date);
    }

    #[test]
    fn test_unknown_message_type_rejected_at_parse() {
        let json = r#"{"id":"x","stage":"dev","message_type":"bogus","status":"created","created_by":"t","created_date":"2026-01-01T00:00:00Z","updated_date":"2026-01-01T00:00:00Z"}"#;
        let result: std::result::Result<Message, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }
}
