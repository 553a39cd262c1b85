//! HTTP ingress (C11): translates external HTTP requests into `Message`s,
//! persists them `created`, and publishes through C6. Performs no outbound
//! work synchronously beyond persistence and publishing.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use relay_core::prelude::*;
use relay_core::message::{Message, MessageType};
use relay_core::persistence::{PostgresStore, Store};
use relay_core::pubsub::Publisher;

#[derive(Clone)]
struct IngressState {
    app: AppState,
    store: Arc<dyn Store>,
    publisher: Arc<Publisher>,
}

#[derive(Debug, Deserialize)]
struct CreateMessageRequest {
    message_type: MessageType,
    #[serde(default)]
    stage: Option<Stage>,
    #[serde(default)]
    payload: HashMap<String, Value>,
    #[serde(default)]
    arguments: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct CreateScheduleRequest {
    action: String,
    name: String,
    schedule_expression: String,
    timezone: String,
    target_type: String,
    message_type: String,
    #[serde(default)]
    payload: HashMap<String, Value>,
    #[serde(default)]
    arguments: HashMap<String, Value>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load_for_service("relay-ingress")?;
    init_tracing(&config)?;

    let app_state = AppState::builder().config(config.clone()).build().await?;

    let pool = app_state
        .db()
        .await
        .ok_or_else(|| anyhow::anyhow!("ingress requires a database connection"))?;
    let store: Arc<dyn Store> = Arc::new(PostgresStore::new(pool, config.database.clone()));

    let nats = app_state
        .nats()
        .await
        .ok_or_else(|| anyhow::anyhow!("ingress requires a NATS connection"))?;
    let publisher = Arc::new(Publisher::new(nats, config.topics.clone()));

    let state = IngressState {
        app: app_state,
        store,
        publisher,
    };

    let router = Router::new()
        .route("/api/health", get(health_proxy))
        .route("/api/ready", get(readiness_proxy))
        .route("/api/messages", post(create_message))
        .route("/api/schedules", post(create_schedule))
        .with_state(state);

    Server::new(config).serve(router).await?;

    Ok(())
}

async fn health_proxy(State(state): State<IngressState>) -> impl IntoResponse {
    relay_core::health::health(State(state.app)).await
}

async fn readiness_proxy(State(state): State<IngressState>) -> impl IntoResponse {
    relay_core::health::readiness(State(state.app)).await
}

/// `POST /api/messages`.
async fn create_message(
    State(state): State<IngressState>,
    Json(request): Json<CreateMessageRequest>,
) -> impl IntoResponse {
    let stage = request.stage.unwrap_or(state.app.config().service.stage);

    let message = Message::new(
        stage,
        request.message_type,
        "ingress",
        request.payload,
        request.arguments,
    );

    if let Err(e) = message.validate() {
        return bad_request(e);
    }

    if let Err(e) = state.store.put_message(&message).await {
        return internal_error(e);
    }

    let mut queued = message.clone();
    queued.mark_queued();
    if let Err(e) = state
        .store
        .update_message_conditional(
            &message.id,
            MessageStatus::Queued,
            &[MessageStatus::Created],
            None,
        )
        .await
    {
        return internal_error(e);
    }

    if let Err(e) = state.publisher.publish(&queued).await {
        tracing::error!(error = %e, message_id = %queued.id, "failed to publish message");
        return internal_error(e);
    }

    (
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message_id": queued.id,
            "message": queued,
        })),
    )
        .into_response()
}

/// `POST /api/schedules`: builds a `schedule_creation`
/// message and runs it through the same create/validate/persist/publish
/// pipeline as any other message. The scheduler binary (C10) consumes it.
async fn create_schedule(
    State(state): State<IngressState>,
    Json(request): Json<CreateScheduleRequest>,
) -> impl IntoResponse {
    let stage = state.app.config().service.stage;

    let mut arguments = request.arguments;
    arguments.insert("action".to_string(), Value::String(request.action));
    arguments.insert("name".to_string(), Value::String(request.name.clone()));
    arguments.insert(
        "schedule_expression".to_string(),
        Value::String(request.schedule_expression),
    );
    arguments.insert("timezone".to_string(), Value::String(request.timezone));
    arguments.insert("target_type".to_string(), Value::String(request.target_type));
    arguments.insert("message_type".to_string(), Value::String(request.message_type));

    let message = Message::new(
        stage,
        MessageType::ScheduleCreation,
        "ingress",
        request.payload,
        arguments,
    );

    if let Err(e) = message.validate() {
        return bad_request(e);
    }

    if let Err(e) = state.store.put_message(&message).await {
        return internal_error(e);
    }

    let mut queued = message.clone();
    queued.mark_queued();
    if let Err(e) = state
        .store
        .update_message_conditional(
            &message.id,
            MessageStatus::Queued,
            &[MessageStatus::Created],
            None,
        )
        .await
    {
        return internal_error(e);
    }

    if let Err(e) = state.publisher.publish(&queued).await {
        tracing::error!(error = %e, message_id = %queued.id, "failed to publish schedule_creation message");
        return internal_error(e);
    }

    (
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message_id": queued.id,
            "schedule_name": request.name,
        })),
    )
        .into_response()
}

fn bad_request(error: Error) -> axum::response::Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"success": false, "error": error.to_string()})),
    )
        .into_response()
}

fn internal_error(error: Error) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"success": false, "error": error.to_string()})),
    )
        .into_response()
}
