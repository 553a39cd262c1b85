//! Web-action worker (C9): consumes `web_action` messages, resolves course
//! and authentication context, and dispatches to the weather or golf
//! execution paths.

mod golf;
mod weather;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use relay_core::config::Config;
use relay_core::consumer::{BatchConsumer, Handler};
use relay_core::course::CourseRegistry;
use relay_core::error::{Error, Result};
use relay_core::http_client::SafeHttpClient;
use relay_core::ids::RequestId;
use relay_core::message::{AuthConfigType, Message, MessageStatus};
use relay_core::observability::init_tracing;
use relay_core::persistence::{ConditionalUpdateOutcome, PostgresStore, Store};
use relay_core::pubsub::Publisher;
use relay_core::retry::{CircuitBreaker, PostgresBreakerStore};
use relay_core::secrets::{EnvSecretStore, JwksVerifier, OAuthTokenClient, SecretsClient};
use relay_core::state::AppState;
use relay_core::web_action::{WebActionKind, WebActionPayload};

const CONSUMER_NAME: &str = "webaction-worker";
const BATCH_SIZE: usize = 1;
const POLL_INTERVAL: Duration = Duration::from_secs(2);

struct WebActionHandler {
    store: Arc<dyn Store>,
    http: SafeHttpClient,
    breaker: CircuitBreaker,
    courses: CourseRegistry,
    oauth: OAuthTokenClient,
    jwks: JwksVerifier,
    publisher: Arc<Publisher>,
    stage: relay_core::config::Stage,
}

impl WebActionHandler {
    /// Parse/validate the payload, resolve the course, fill in any
    /// URL/scope/jwks/token-url left implicit by the catalog, and
    /// authenticate when the action requires identity.
    async fn prepare(
        &self,
        message: &Message,
    ) -> Result<(WebActionPayload, Option<relay_core::secrets::Claims>, Option<String>)> {
        let payload = WebActionPayload::from_fields(&message.payload)?;
        payload.validate()?;

        let course = match &payload.course_id {
            Some(course_id) => Some(self.courses.get_course_by_id(course_id)?),
            None => None,
        };

        let auth_config = payload.auth_config.clone().or_else(|| {
            message.auth_config.clone()
        });

        let (claims, access_token) = match auth_config {
            Some(auth) if auth.auth_type == AuthConfigType::OauthPassword => {
                let course = course.ok_or_else(|| {
                    Error::InvalidPayload("oauth_password auth requires course_id".to_string())
                })?;
                let secret_name = auth
                    .secret_name
                    .clone()
                    .or_else(|| self.courses.get_secret_name(
                        payload.course_id.as_deref().unwrap_or_default(),
                        &self.stage.to_string(),
                    ).ok())
                    .ok_or_else(|| Error::ConfigNotFound("no secret_name resolvable for oauth_password auth".to_string()))?;
                let token_url = auth
                    .token_url
                    .clone()
                    .or_else(|| course.actions.get("token").cloned())
                    .ok_or_else(|| Error::ConfigNotFound("no token_url resolvable for oauth_password auth".to_string()))?;
                let jwks_url = auth
                    .jwks_url
                    .clone()
                    .ok_or_else(|| Error::ConfigNotFound("oauth_password auth requires jwks_url".to_string()))?;
                let scope = auth.scope.clone().unwrap_or_else(|| course.scope.clone());

                let access_token = self
                    .oauth
                    .password_grant(&self.http, &token_url, &secret_name, &scope, &auth.headers)
                    .await?;
                let claims = self
                    .jwks
                    .parse_and_verify(&self.http, &access_token, &jwks_url)
                    .await?;
                (Some(claims), Some(access_token))
            }
            _ => (None, None),
        };

        Ok((payload, claims, access_token))
    }

    async fn dispatch(
        &self,
        message: &Message,
        payload: &WebActionPayload,
        claims: Option<&relay_core::secrets::Claims>,
        access_token: Option<&str>,
    ) -> Result<String> {
        match payload.action {
            WebActionKind::Weather => weather::run(&self.http, payload).await,
            WebActionKind::Golf => {
                let course_id = payload
                    .course_id
                    .as_deref()
                    .ok_or_else(|| Error::InvalidPayload("golf action requires course_id".to_string()))?;
                let course = self.courses.get_course_by_id(course_id)?;
                let operation = message
                    .arguments
                    .get("operation")
                    .and_then(|v| v.as_str())
                    .unwrap_or("search_tee_times");

                match operation {
                    "fetch_reservations" => {
                        let claims = claims.ok_or_else(|| {
                            Error::Unauthorized("fetch_reservations requires authentication".to_string())
                        })?;
                        let access_token = access_token.ok_or_else(|| {
                            Error::Unauthorized("fetch_reservations requires an access token".to_string())
                        })?;
                        let golfer_id = claims
                            .golfer_id
                            .clone()
                            .ok_or_else(|| Error::Unauthorized("claims missing golferId".to_string()))?;
                        golf::fetch_reservations(&self.http, course, &golfer_id, access_token).await
                    }
                    _ => {
                        golf::search_tee_times(
                            &self.http,
                            self.store.as_ref(),
                            course,
                            &message.id,
                            self.stage,
                            payload,
                            &message.arguments,
                            claims,
                            access_token,
                        )
                        .await
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Handler for WebActionHandler {
    async fn handle(&self, message: Message, correlation_id: RequestId) -> Result<()> {
        let span = tracing::info_span!("web_action", correlation_id = %correlation_id, message_id = %message.id);
        let _enter = span.enter();

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

        let result = self.run_with_resilience(&record).await;

        match result {
            Ok(body) => {
                self.store
                    .update_message_conditional(&record.id, MessageStatus::Completed, &[MessageStatus::Processing], None)
                    .await?;
                self.notify_follow_up(&record, &body).await?;
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
                tracing::warn!(error = %e, "web action failed terminally");
                Err(e)
            }
        }
    }
}

impl WebActionHandler {
    async fn run_with_resilience(&self, message: &Message) -> Result<String> {
        let (payload, claims, access_token) = self.prepare(message).await?;
        self.breaker
            .call(|| async { self.dispatch(message, &payload, claims.as_ref(), access_token.as_deref()).await })
            .await
    }

    async fn notify_follow_up(&self, source: &Message, body: &str) -> Result<()> {
        let mut notify_payload = std::collections::HashMap::new();
        notify_payload.insert("title".to_string(), serde_json::Value::String("Web action completed".to_string()));
        notify_payload.insert("message".to_string(), serde_json::Value::String(body.to_string()));

        let notify = Message::new(
            source.stage,
            relay_core::message::MessageType::Notify,
            "webaction-worker",
            notify_payload,
            std::collections::HashMap::new(),
        );
        self.publisher.publish(&notify).await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load_for_service("relay-webaction-worker")?;
    init_tracing(&config)?;

    let app_state = AppState::builder().config(config.clone()).build().await?;

    let pool = app_state
        .db()
        .await
        .ok_or_else(|| anyhow::anyhow!("webaction-worker requires a database connection"))?;
    let store: Arc<dyn Store> = Arc::new(PostgresStore::new(pool.clone(), config.database.clone()));

    let nats = app_state
        .nats()
        .await
        .ok_or_else(|| anyhow::anyhow!("webaction-worker requires a NATS connection"))?;
    let publisher = Arc::new(Publisher::new(nats.clone(), config.topics.clone()));

    let courses = CourseRegistry::load(&config.course_catalog_path)?;

    let mut allowlist: HashSet<String> = HashSet::new();
    allowlist.insert("api.weather.gov".to_string());
    for course in courses_hosts(&courses) {
        allowlist.insert(course);
    }
    let http = SafeHttpClient::new(allowlist, config.service.stage == relay_core::config::Stage::Dev)?;

    let secrets = Arc::new(SecretsClient::new(Arc::new(EnvSecretStore), &config.secrets));
    let oauth = OAuthTokenClient::new(secrets);
    let jwks = JwksVerifier::new(config.jwt.clone());

    let breaker_store = Arc::new(PostgresBreakerStore::new(
        pool,
        config.database.circuit_breaker_table.clone(),
    ));
    let breaker = CircuitBreaker::new(
        CONSUMER_NAME,
        breaker_store,
        config.middleware.resilience.clone(),
    );

    let handler = Arc::new(WebActionHandler {
        store,
        http,
        breaker,
        courses,
        oauth,
        jwks,
        publisher: publisher.clone(),
        stage: config.service.stage,
    });

    let jetstream = async_nats::jetstream::new(nats);
    let stream = jetstream
        .get_or_create_stream(async_nats::jetstream::stream::Config {
            name: config.topics.web_actions.clone(),
            subjects: vec![config.topics.web_actions.clone()],
            ..Default::default()
        })
        .await
        .map_err(|e| anyhow::anyhow!("failed to resolve web-actions stream: {e}"))?;

    let consumer = stream
        .get_or_create_consumer(
            CONSUMER_NAME,
            async_nats::jetstream::consumer::pull::Config {
                durable_name: Some(CONSUMER_NAME.to_string()),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| anyhow::anyhow!("failed to resolve webaction-worker consumer: {e}"))?;

    let batch_consumer = BatchConsumer::new(consumer, handler, publisher, BATCH_SIZE);

    tracing::info!("webaction-worker polling for messages");
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

fn courses_hosts(registry: &CourseRegistry) -> Vec<String> {
    registry
        .hosts()
        .into_iter()
        .filter_map(|origin| {
            reqwest::Url::parse(&origin)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
        })
        .collect()
}
