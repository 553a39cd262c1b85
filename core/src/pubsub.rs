//! Type-routed publisher (C6), built directly on `events.rs`'s NATS client.
//!
//! `publish` resolves the destination subject from `message_type`, attaches
//! routing headers (the closest JetStream analogue to SNS message
//! attributes), and serializes the message to JSON. Delivery is
//! at-least-once; there is no synchronous ack from the subscriber side.

use async_nats::{Client, HeaderMap};

use crate::config::TopicsConfig;
use crate::error::{Error, Result};
use crate::message::{Message, MessageType};

/// Resolves `message_type` to a subject.
pub fn resolve_subject(message_type: MessageType, topics: &TopicsConfig) -> String {
    match message_type {
        MessageType::WebAction => topics.web_actions.clone(),
        MessageType::AgentResponse => topics.agent_response.clone(),
        _ => topics.notifications.clone(),
    }
}

/// Dead-letter subject a consumer publishes to after exhausting redeliveries.
pub fn dlq_subject(message_type: MessageType, topics: &TopicsConfig) -> String {
    format!("{}{}", topics.dlq_prefix, message_type)
}

/// Publishes [`Message`]s, routed by `message_type`, to one of three NATS
/// subjects.
pub struct Publisher {
    client: Client,
    topics: TopicsConfig,
}

impl Publisher {
    pub fn new(client: Client, topics: TopicsConfig) -> Self {
        Self { client, topics }
    }

    /// Serialize `message` to JSON and publish to the subject resolved from
    /// its `message_type`, with `{stage, message_type, status}` headers.
    pub async fn publish(&self, message: &Message) -> Result<()> {
        let subject = resolve_subject(message.message_type, &self.topics);
        self.publish_to(&subject, message).await
    }

    /// Publish to the type's dead-letter subject instead of its primary one
    /// (used by C7 after exhausting redeliveries).
    pub async fn publish_to_dlq(&self, message: &Message) -> Result<()> {
        let subject = dlq_subject(message.message_type, &self.topics);
        self.publish_to(&subject, message).await
    }

    async fn publish_to(&self, subject: &str, message: &Message) -> Result<()> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| Error::Internal(format!("failed to serialize message: {e}")))?;

        let mut headers = HeaderMap::new();
        headers.insert("stage", message.stage.to_string().as_str());
        headers.insert("message_type", message.message_type.to_string().as_str());
        headers.insert("status", message.status.to_string().as_str());

        self.client
            .publish_with_headers(subject.to_string(), headers, payload.into())
            .await
            .map_err(|e| Error::Nats(format!("failed to publish to {subject}: {e}")))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Stage;
    use std::collections::HashMap;

    fn topics() -> TopicsConfig {
        TopicsConfig {
            web_actions: "relay.web-actions".to_string(),
            notifications: "relay.notifications".to_string(),
            agent_response: "relay.agent-response".to_string(),
            dlq_prefix: "relay.dlq.".to_string(),
        }
    }

    #[test]
    fn test_resolve_subject_web_action() {
        let subject = resolve_subject(MessageType::WebAction, &topics());
        assert_eq!(subject, "relay.web-actions");
    }

    #[test]
    fn test_resolve_subject_agent_response() {
        let subject = resolve_subject(MessageType::AgentResponse, &topics());
        assert_eq!(subject, "relay.agent-response");
    }

    #[test]
    fn test_resolve_subject_defaults_to_notifications() {
        for message_type in [
            MessageType::HelloWorld,
            MessageType::Notify,
            MessageType::Scheduled,
            MessageType::ScheduleCreation,
        ] {
            assert_eq!(resolve_subject(message_type, &topics()), "relay.notifications");
        }
    }

    #[test]
    fn test_dlq_subject_suffixes_message_type() {
        assert_eq!(
            dlq_subject(MessageType::WebAction, &topics()),
            "relay.dlq.web_action"
        );
    }

    #[test]
    fn test_message_serializes_for_publish() {
        let message = Message::new(
            Stage::Dev,
            MessageType::HelloWorld,
            "test-suite",
            HashMap::new(),
            HashMap::new(),
        );
        let bytes = serde_json::to_vec(&message).unwrap();
        assert!(!bytes.is_empty());
    }
}
