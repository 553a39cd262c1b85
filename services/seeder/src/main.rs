//! Periodic seeder (C12): a single invocation per wall-clock firing. The
//! external trigger (daily at a fixed local time) re-runs this binary; the
//! trigger's event id, when supplied, makes redelivery idempotent.

use std::sync::Arc;

use relay_core::config::Config;
use relay_core::observability::init_tracing;
use relay_core::persistence::{PostgresStore, Store};
use relay_core::pubsub::Publisher;
use relay_core::seed::{self, SeedConfig};
use relay_core::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load_for_service("relay-seeder")?;
    init_tracing(&config)?;

    let app_state = AppState::builder().config(config.clone()).build().await?;

    let pool = app_state
        .db()
        .await
        .ok_or_else(|| anyhow::anyhow!("seeder requires a database connection"))?;
    let store: Arc<dyn Store> = Arc::new(PostgresStore::new(pool, config.database.clone()));

    let nats = app_state
        .nats()
        .await
        .ok_or_else(|| anyhow::anyhow!("seeder requires a NATS connection"))?;
    let publisher = Publisher::new(nats, config.topics.clone());

    let seed_config = SeedConfig {
        forecast_url: std::env::var("RELAY_SEED_FORECAST_URL")
            .unwrap_or_else(|_| "https://api.weather.gov/gridpoints/MTR/85,105/forecast".to_string()),
        course_id: std::env::var("RELAY_SEED_COURSE_ID").unwrap_or_else(|_| "default".to_string()),
    };

    let trigger_event_id = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("RELAY_SEED_TRIGGER_EVENT_ID").ok())
        .unwrap_or_else(seed::new_trigger_event_id);

    let ids = seed::run_once(&store, &publisher, config.service.stage, &seed_config, &trigger_event_id).await?;

    tracing::info!(trigger_event_id, message_ids = ?ids, "seed run complete");
    Ok(())
}
