//! Notification worker (C8): consumes `hello_world`/`notify`/`scheduled`/
//! `agent_response` messages and delivers a rendered body to the external
//! push service through the SSRF-hardened client, fronted by a circuit
//! breaker and exponential backoff.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use relay_core::config::Config;
use relay_core::consumer::{BatchConsumer, Handler};
use relay_core::error::{Error, Result};
use relay_core::http_client::SafeHttpClient;
use relay_core::ids::RequestId;
use relay_core::message::{Message, MessageStatus, MessageType};
use relay_core::observability::init_tracing;
use relay_core::persistence::{ConditionalUpdateOutcome, PostgresStore, Store};
use relay_core::pubsub::Publisher;
use relay_core::retry::{backoff, CircuitBreaker, PostgresBreakerStore};
use relay_core::state::AppState;

const CONSUMER_NAME: &str = "notify-worker";
const BATCH_SIZE: usize = 10;
const POLL_INTERVAL: Duration = Duration::from_secs(2);

struct NotifyHandler {
    store: Arc<dyn Store>,
    http: SafeHttpClient,
    breaker: CircuitBreaker,
    push_url: String,
    max_retries: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
}

#[async_trait]
impl Handler for NotifyHandler {
    async fn handle(&self, message: Message, correlation_id: RequestId) -> Result<()> {
        let span = tracing::info_span!("notify", correlation_id = %correlation_id, message_id = %message.id);
        let _enter = span.enter();

        if !matches!(
            message.message_type,
            MessageType::HelloWorld | MessageType::Notify | MessageType::Scheduled | MessageType::AgentResponse
        ) {
            tracing::debug!(message_type = %message.message_type, "not a notify-worker message type, skipping");
            return Ok(());
        }

        let outcome = self
            .store
            .update_message_conditional(
                &message.id,
                MessageStatus::Processing,
                &[MessageStatus::Created, MessageStatus::Queued],
                None,
            )
            .await?;

        let record = match outcome {
            ConditionalUpdateOutcome::Updated(message) => message,
            ConditionalUpdateOutcome::AlreadyTransitioned => {
                tracing::debug!("message already transitioned, skipping redelivery");
                return Ok(());
            }
        };

        let body = render_body(&record);
        let delivery = self.deliver(&body).await;

        match delivery {
            Ok(()) => {
                self.store
                    .update_message_conditional(
                        &record.id,
                        MessageStatus::Completed,
                        &[MessageStatus::Processing],
                        None,
                    )
                    .await?;
                tracing::info!("notification delivered");
                Ok(())
            }
            Err(e) => {
                self.store
                    .update_message_conditional(
                        &record.id,
                        MessageStatus::Failed,
                        &[MessageStatus::Processing],
                        Some(e.to_string()),
                    )
                    .await?;
                tracing::warn!(error = %e, "notification delivery failed terminally");
                Err(e)
            }
        }
    }
}

impl NotifyHandler {
    async fn deliver(&self, body: &str) -> Result<()> {
        let http = &self.http;
        let url = self.push_url.clone();
        let body = body.to_string();
        let max_retries = self.max_retries;
        let base = self.backoff_base;
        let cap = self.backoff_cap;

        self.breaker
            .call(|| async move {
                backoff::with_backoff(max_retries, base, cap, |_attempt| {
                    let url = url.clone();
                    let body = body.clone();
                    async move { push_once(http, &url, &body).await }
                })
                .await
            })
            .await
    }
}

async fn push_once(http: &SafeHttpClient, url: &str, body: &str) -> Result<()> {
    http.post_json(
        url,
        reqwest::header::HeaderMap::new(),
        &serde_json::json!({ "body": body }),
    )
    .await
    .map(|_| ())
}

/// Render a textual notification body from the payload template associated
/// with `message_type`.
fn render_body(message: &Message) -> String {
    match message.message_type {
        MessageType::Notify => {
            let title = message
                .payload
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or("Notification");
            let body = message
                .payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("");
            format!("{title}: {body}")
        }
        MessageType::HelloWorld => "Hello, world!".to_string(),
        MessageType::AgentResponse => message
            .payload
            .get("response")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        MessageType::Scheduled => message
            .payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Scheduled trigger fired")
            .to_string(),
        other => format!("{other} event"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load_for_service("relay-notify-worker")?;
    init_tracing(&config)?;

    let app_state = AppState::builder().config(config.clone()).build().await?;

    let pool = app_state
        .db()
        .await
        .ok_or_else(|| anyhow::anyhow!("notify-worker requires a database connection"))?;
    let store: Arc<dyn Store> = Arc::new(PostgresStore::new(pool.clone(), config.database.clone()));

    let nats = app_state
        .nats()
        .await
        .ok_or_else(|| anyhow::anyhow!("notify-worker requires a NATS connection"))?;
    let dlq_publisher = Arc::new(Publisher::new(nats.clone(), config.topics.clone()));

    let push_url = std::env::var("RELAY_PUSH_SERVICE_URL")
        .unwrap_or_else(|_| "https://push.relaymesh.dev/v1/notifications".to_string());
    let push_host = reqwest::Url::parse(&push_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .ok_or_else(|| anyhow::anyhow!("invalid RELAY_PUSH_SERVICE_URL: {push_url}"))?;

    let mut allowlist = HashSet::new();
    allowlist.insert(push_host);
    let http = SafeHttpClient::new(allowlist, config.service.stage == relay_core::config::Stage::Dev)?;

    let breaker_store = Arc::new(PostgresBreakerStore::new(
        pool,
        config.database.circuit_breaker_table.clone(),
    ));
    let breaker = CircuitBreaker::new(
        CONSUMER_NAME,
        breaker_store,
        config.middleware.resilience.clone(),
    );

    let handler = Arc::new(NotifyHandler {
        store,
        http,
        breaker,
        push_url,
        max_retries: config.retry.max_retries,
        backoff_base: Duration::from_millis(config.retry.backoff_base_ms),
        backoff_cap: Duration::from_millis(config.retry.backoff_cap_ms),
    });

    let jetstream = async_nats::jetstream::new(nats);
    let stream = jetstream
        .get_or_create_stream(async_nats::jetstream::stream::Config {
            name: config.topics.notifications.clone(),
            subjects: vec![config.topics.notifications.clone()],
            ..Default::default()
        })
        .await
        .map_err(|e| anyhow::anyhow!("failed to resolve notifications stream: {e}"))?;

    let consumer = stream
        .get_or_create_consumer(
            CONSUMER_NAME,
            async_nats::jetstream::consumer::pull::Config {
                durable_name: Some(CONSUMER_NAME.to_string()),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| anyhow::anyhow!("failed to resolve notify-worker consumer: {e}"))?;

    let batch_consumer = BatchConsumer::new(consumer, handler, dlq_publisher, BATCH_SIZE);

    tracing::info!("notify-worker polling for messages");
    loop {
        match batch_consumer.run_once().await {
            Ok(failures) if failures > 0 => {
                tracing::warn!(failures, "batch completed with failures");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "batch fetch failed"),
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
