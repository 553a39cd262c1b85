//! `web_action` payload and per-execution result record (C1, C9)

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Stage;
use crate::error::{Error, Result};
use crate::message::AuthConfig;

/// The outbound action dispatched against a course's web presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebActionKind {
    Weather,
    Golf,
}

/// `Message.payload` shape when `message_type = web_action`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebActionPayload {
    #[serde(default = "default_version")]
    pub version: String,
    pub url: String,
    pub action: WebActionKind,
    #[serde(default)]
    pub course_id: Option<String>,
    #[serde(default)]
    pub start_search_time: Option<String>,
    #[serde(default)]
    pub end_search_time: Option<String>,
    #[serde(default)]
    pub auto_book: bool,
    #[serde(default)]
    pub max_results: Option<u32>,
    #[serde(default)]
    pub days: Option<u32>,
    #[serde(default)]
    pub number_of_players: Option<u8>,
    #[serde(default)]
    pub tee_sheet_id: Option<String>,
    #[serde(default)]
    pub auth_config: Option<AuthConfig>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl WebActionPayload {
    /// Parse out of a message's untyped `payload` map.
    pub fn from_fields(payload: &HashMap<String, Value>) -> Result<Self> {
        let value = Value::Object(payload.clone().into_iter().collect());
        serde_json::from_value(value)
            .map_err(|e| Error::InvalidPayload(format!("invalid web_action payload: {e}")))
    }

    /// `number_of_players` must be 1-4 when present; `auth_config`, if
    /// present, must pass its own validation.
    pub fn validate(&self) -> Result<()> {
        if let Some(n) = self.number_of_players {
            if !(1..=4).contains(&n) {
                return Err(Error::InvalidPayload(format!(
                    "number_of_players must be 1-4, got {n}"
                )));
            }
        }

        if let Some(auth) = &self.auth_config {
            auth.validate()?;
        }

        Ok(())
    }

    /// Number of forecast entries to render: `2 * days`, default `days = 2`.
    pub fn weather_entry_count(&self) -> u32 {
        2 * self.days.unwrap_or(2)
    }
}

/// Maximum stored response body before truncation.
pub const RESPONSE_BODY_LIMIT_BYTES: usize = 50 * 1024;

/// Literal suffix appended to a truncated response body.
pub const TRUNCATION_MARKER: &str = "... [TRUNCATED]";

/// Truncate `body` to [`RESPONSE_BODY_LIMIT_BYTES`], appending
/// [`TRUNCATION_MARKER`] when truncation occurred.
pub fn truncate_response_body(body: &str) -> String {
    if body.len() <= RESPONSE_BODY_LIMIT_BYTES {
        return body.to_string();
    }

    let mut boundary = RESPONSE_BODY_LIMIT_BYTES;
    while boundary > 0 && !body.is_char_boundary(boundary) {
        boundary -= 1;
    }

    let mut truncated = body[..boundary].to_string();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

/// One row per executed web action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebActionResult {
    pub id: String,
    pub message_id: String,
    pub action: WebActionKind,
    pub url: String,
    pub status: String,
    #[serde(default)]
    pub response_code: Option<u16>,
    #[serde(default)]
    pub response_body: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub execution_time_ms: u64,
    pub created_date: DateTime<Utc>,
    pub stage: Stage,
}

impl WebActionResult {
    /// Retention window for `web_action_results` rows.
    pub const RETENTION_DAYS: i64 = 3;

    pub fn success(
        message_id: impl Into<String>,
        action: WebActionKind,
        url: impl Into<String>,
        response_code: u16,
        response_body: impl Into<String>,
        execution_time_ms: u64,
        stage: Stage,
    ) -> Self {
        Self {
            id: crate::ids::RequestId::new().to_string(),
            message_id: message_id.into(),
            action,
            url: url.into(),
            status: "completed".to_string(),
            response_code: Some(response_code),
            response_body: Some(truncate_response_body(&response_body.into())),
            error_message: None,
            execution_time_ms,
            created_date: Utc::now(),
            stage,
        }
    }

    pub fn failure(
        message_id: impl Into<String>,
        action: WebActionKind,
        url: impl Into<String>,
        error_message: impl Into<String>,
        execution_time_ms: u64,
        stage: Stage,
    ) -> Self {
        Self {
            id: crate::ids::RequestId::new().to_string(),
            message_id: message_id.into(),
            action,
            url: url.into(),
            status: "failed".to_string(),
            response_code: None,
            response_body: None,
            error_message: Some(error_message.into()),
            execution_time_ms,
            created_date: Utc::now(),
            stage,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_date + chrono::Duration::days(Self::RETENTION_DAYS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_of_players_out_of_range_rejected() {
        let mut payload: HashMap<String, Value> = HashMap::new();
        payload.insert("url".to_string(), Value::String("https://example.com".to_string()));
        payload.insert("action".to_string(), Value::String("golf".to_string()));
        payload.insert("number_of_players".to_string(), Value::from(5));

        let parsed = WebActionPayload::from_fields(&payload).unwrap();
        assert!(parsed.validate().is_err());
    }

    #[test]
    fn test_unknown_action_rejected_at_parse() {
        let mut payload: HashMap<String, Value> = HashMap::new();
        payload.insert("url".to_string(), Value::String("https://example.com".to_string()));
        payload.insert("action".to_string(), Value::String("bogus".to_string()));

        assert!(WebActionPayload::from_fields(&payload).is_err());
    }

    #[test]
    fn test_weather_entry_count_defaults_to_two_days() {
        let mut payload: HashMap<String, Value> = HashMap::new();
        payload.insert("url".to_string(), Value::String("https://api.weather.gov/x".to_string()));
        payload.insert("action".to_string(), Value::String("weather".to_string()));

        let parsed = WebActionPayload::from_fields(&payload).unwrap();
        assert_eq!(parsed.weather_entry_count(), 4);
    }

    #[test]
    fn test_truncate_response_body_exact_boundary() {
        let body = "a".repeat(RESPONSE_BODY_LIMIT_BYTES);
        let result = truncate_response_body(&body);
        assert_eq!(result, body);
        assert!(!result.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_truncate_response_body_over_limit() {
        let body = "a".repeat(RESPONSE_BODY_LIMIT_BYTES + 100);
        let result = truncate_response_body(&body);
        assert!(result.ends_with(TRUNCATION_MARKER));
        assert_eq!(result.len(), RESPONSE_BODY_LIMIT_BYTES + TRUNCATION_MARKER.len());
    }

    #[test]
    fn test_result_expires_at_three_days_out() {
        let result = WebActionResult::success(
            "msg-1",
            WebActionKind::Weather,
            "https://api.weather.gov/x",
            200,
            "ok",
            42,
            Stage::Dev,
        );
        let delta = result.expires_at() - result.created_date;
        assert_eq!(delta.num_days(), 3);
    }
}
