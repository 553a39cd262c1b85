//! Batch consumer harness (C7): pulls a bounded batch from a JetStream pull
//! consumer, unwraps the optional SNS-shaped `{"Message": ...}` envelope,
//! dispatches each record to a [`Handler`], and acks/naks per-message so the
//! broker only redelivers what actually failed.

use std::sync::Arc;

use async_nats::jetstream::consumer::PullConsumer;
use async_nats::jetstream::Message as JetstreamMessage;
use futures::StreamExt;
use serde_json::Value;

use crate::error::Result;
use crate::ids::RequestId;
use crate::message::Message;
use crate::pubsub::Publisher;

/// Redeliveries tolerated before a record is routed to the dead-letter
/// subject instead of being nak'ed again.
pub const MAX_DELIVERIES: u64 = 3;

/// Per-record work invoked by [`BatchConsumer`]. Implemented by the
/// notification worker (C8) and web-action worker (C9).
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, message: Message, correlation_id: RequestId) -> Result<()>;
}

/// Drives a JetStream pull consumer against a [`Handler`], routing
/// exhausted redeliveries to the type's dead-letter subject.
pub struct BatchConsumer<H: Handler> {
    consumer: PullConsumer,
    handler: Arc<H>,
    dlq_publisher: Arc<Publisher>,
    batch_size: usize,
}

impl<H: Handler> BatchConsumer<H> {
    pub fn new(
        consumer: PullConsumer,
        handler: Arc<H>,
        dlq_publisher: Arc<Publisher>,
        batch_size: usize,
    ) -> Self {
        Self {
            consumer,
            handler,
            dlq_publisher,
            batch_size,
        }
    }

    /// Pull one batch, process every record, and return the number of
    /// records that failed processing (already redelivered or DLQ'd).
    pub async fn run_once(&self) -> Result<usize> {
        let mut batch = self
            .consumer
            .fetch()
            .max_messages(self.batch_size)
            .messages()
            .await
            .map_err(|e| crate::error::Error::Nats(format!("failed to fetch batch: {e}")))?;

        let mut failures = 0usize;
        while let Some(next) = batch.next().await {
            let jetstream_message = match next {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!("error reading message from batch: {e}");
                    continue;
                }
            };

            if let Err(e) = self.process_one(&jetstream_message).await {
                tracing::warn!(error = %e, "record processing failed");
                failures += 1;
            }
        }

        Ok(failures)
    }

    async fn process_one(&self, jetstream_message: &JetstreamMessage) -> Result<()> {
        let delivered = jetstream_message
            .info()
            .map(|info| info.delivered)
            .unwrap_or(1);

        let parsed = match parse_envelope(&jetstream_message.payload) {
            Ok(message) => message,
            Err(e) => {
                // Malformed payloads cannot be fixed by redelivery; ack and
                // drop rather than spin forever.
                jetstream_message.ack().await.ok();
                return Err(e);
            }
        };

        let correlation_id = RequestId::new();
        let outcome = self.handler.handle(parsed.clone(), correlation_id).await;

        match outcome {
            Ok(()) => {
                jetstream_message.ack().await.ok();
                Ok(())
            }
            Err(err) => {
                if delivered >= MAX_DELIVERIES {
                    if let Err(publish_err) = self.dlq_publisher.publish_to_dlq(&parsed).await {
                        tracing::error!(error = %publish_err, "failed to publish to dead-letter subject");
                    }
                    jetstream_message.ack().await.ok();
                } else {
                    jetstream_message.ack_with(async_nats::jetstream::AckKind::Nak(None)).await.ok();
                }
                Err(err)
            }
        }
    }
}

/// Unwrap the optional `{"Message": ...}` envelope some upstream publishers
/// wrap the body in, then parse the inner JSON as a
/// [`Message`].
fn parse_envelope(payload: &[u8]) -> Result<Message> {
    let raw: Value = serde_json::from_slice(payload)
        .map_err(|e| crate::error::Error::InvalidPayload(format!("record is not valid JSON: {e}")))?;

    let inner = match raw {
        Value::Object(ref map) if map.contains_key("Message") && map.len() == 1 => {
            map.get("Message").cloned().unwrap_or(Value::Null)
        }
        other => other,
    };

    let inner = match inner {
        Value::String(s) => serde_json::from_str(&s).map_err(|e| {
            crate::error::Error::InvalidPayload(format!("enveloped message is not valid JSON: {e}"))
        })?,
        other => other,
    };

    serde_json::from_value(inner)
        .map_err(|e| crate::error::Error::InvalidPayload(format!("record is not a valid message: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Stage;
    use crate::message::MessageType;
    use std::collections::HashMap;

    fn sample_message_json() -> String {
        let message = Message::new(
            Stage::Dev,
            MessageType::HelloWorld,
            "test-suite",
            HashMap::new(),
            HashMap::new(),
        );
        serde_json::to_string(&message).unwrap()
    }

    #[test]
    fn test_parse_envelope_unwraps_message_wrapper() {
        let inner = sample_message_json();
        let wrapped = format!(r#"{{"Message": {}}}"#, inner);
        let parsed = parse_envelope(wrapped.as_bytes()).unwrap();
        assert_eq!(parsed.created_by, "test-suite");
    }

    #[test]
    fn test_parse_envelope_unwraps_string_encoded_message() {
        let inner = sample_message_json();
        let wrapped = serde_json::json!({ "Message": inner }).to_string();
        let parsed = parse_envelope(wrapped.as_bytes()).unwrap();
        assert_eq!(parsed.created_by, "test-suite");
    }

    #[test]
    fn test_parse_envelope_accepts_raw_message() {
        let raw = sample_message_json();
        let parsed = parse_envelope(raw.as_bytes()).unwrap();
        assert_eq!(parsed.created_by, "test-suite");
    }

    #[test]
    fn test_parse_envelope_rejects_garbage() {
        assert!(parse_envelope(b"not json at all").is_err());
    }

    #[test]
    fn test_max_deliveries_is_three() {
        assert_eq!(MAX_DELIVERIES, 3);
    }
}
