//! Schedule registrar (C10): consumes `schedule_creation` messages off the
//! notifications topic and exposes an operator CLI for local
//! create/pause/resume/delete without going through HTTP ingress.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::Value;

use relay_core::config::Config;
use relay_core::consumer::{BatchConsumer, Handler};
use relay_core::error::Result;
use relay_core::ids::RequestId;
use relay_core::message::{Message, MessageStatus, MessageType};
use relay_core::observability::init_tracing;
use relay_core::persistence::{ConditionalUpdateOutcome, PostgresStore, Store};
use relay_core::pubsub::Publisher;
use relay_core::schedule::{LoggingScheduleBackend, Registrar, ScheduleBackend};
use relay_core::state::AppState;

const CONSUMER_NAME: &str = "scheduler";
const BATCH_SIZE: usize = 10;
const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "relay-scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the schedule_creation consumer loop (the default with no subcommand).
    Serve,
    /// Register a new schedule without going through HTTP ingress.
    Create {
        name: String,
        schedule_expression: String,
        target_type: String,
        #[arg(long, default_value = "UTC")]
        timezone: String,
        #[arg(long)]
        operation: Option<String>,
        #[arg(long)]
        course_id: Option<String>,
    },
    Pause { schedule_id: String },
    Resume { schedule_id: String },
    Delete { schedule_id: String },
}

struct RegistrarHandler {
    store: Arc<dyn Store>,
    registrar: Registrar,
}

#[async_trait]
impl Handler for RegistrarHandler {
    async fn handle(&self, message: Message, correlation_id: RequestId) -> Result<()> {
        let span = tracing::info_span!("schedule_creation", correlation_id = %correlation_id, message_id = %message.id);
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

        match self.registrar.handle(&record, chrono::Utc::now()).await {
            Ok(()) => {
                self.store
                    .update_message_conditional(&record.id, MessageStatus::Completed, &[MessageStatus::Processing], None)
                    .await?;
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
                tracing::warn!(error = %e, "schedule registration failed terminally");
                Err(e)
            }
        }
    }
}

fn cli_message(stage: relay_core::config::Stage, action: &str, arguments: HashMap<String, Value>) -> Message {
    let mut arguments = arguments;
    arguments.insert("action".to_string(), Value::String(action.to_string()));
    Message::new(stage, MessageType::ScheduleCreation, "scheduler-cli", HashMap::new(), arguments)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load_for_service("relay-scheduler")?;
    init_tracing(&config)?;

    let app_state = AppState::builder().config(config.clone()).build().await?;
    let pool = app_state
        .db()
        .await
        .ok_or_else(|| anyhow::anyhow!("scheduler requires a database connection"))?;
    let store: Arc<dyn Store> = Arc::new(PostgresStore::new(pool, config.database.clone()));

    let backend: Arc<dyn ScheduleBackend> = Arc::new(LoggingScheduleBackend);
    let registrar = Registrar::new(store.clone(), backend);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, app_state, store, registrar).await,
        Command::Create {
            name,
            schedule_expression,
            target_type,
            timezone,
            operation,
            course_id,
        } => {
            let mut arguments = HashMap::new();
            arguments.insert("name".to_string(), Value::String(name));
            arguments.insert("schedule_expression".to_string(), Value::String(schedule_expression));
            arguments.insert("target_type".to_string(), Value::String(target_type));
            arguments.insert("timezone".to_string(), Value::String(timezone));
            if let Some(operation) = operation {
                arguments.insert("operation".to_string(), Value::String(operation));
            }
            if let Some(course_id) = course_id {
                arguments.insert("course_id".to_string(), Value::String(course_id));
            }
            let message = cli_message(config.service.stage, "create", arguments);
            registrar.handle(&message, chrono::Utc::now()).await?;
            println!("schedule created");
            Ok(())
        }
        Command::Pause { schedule_id } => run_status_change(&registrar, &config, "pause", schedule_id).await,
        Command::Resume { schedule_id } => run_status_change(&registrar, &config, "resume", schedule_id).await,
        Command::Delete { schedule_id } => run_status_change(&registrar, &config, "delete", schedule_id).await,
    }
}

async fn run_status_change(
    registrar: &Registrar,
    config: &Config,
    action: &str,
    schedule_id: String,
) -> anyhow::Result<()> {
    let mut arguments = HashMap::new();
    arguments.insert("schedule_id".to_string(), Value::String(schedule_id));
    let message = cli_message(config.service.stage, action, arguments);
    registrar.handle(&message, chrono::Utc::now()).await?;
    println!("schedule {action} applied");
    Ok(())
}

async fn serve(
    config: Config,
    app_state: AppState,
    store: Arc<dyn Store>,
    registrar: Registrar,
) -> anyhow::Result<()> {
    let nats = app_state
        .nats()
        .await
        .ok_or_else(|| anyhow::anyhow!("scheduler requires a NATS connection"))?;
    let dlq_publisher = Arc::new(Publisher::new(nats.clone(), config.topics.clone()));

    let handler = Arc::new(RegistrarHandler { store, registrar });

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
                filter_subject: config.topics.notifications.clone(),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| anyhow::anyhow!("failed to resolve scheduler consumer: {e}"))?;

    let batch_consumer = BatchConsumer::new(consumer, handler, dlq_publisher, BATCH_SIZE);

    tracing::info!("scheduler polling for schedule_creation messages");
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
