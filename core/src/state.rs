//! Application state management

use std::sync::Arc;
use tokio::sync::RwLock;

use async_nats::Client as NatsClient;
use sqlx::PgPool;

use crate::{config::Config, error::Result};

/// Application state shared across every axum handler and worker loop.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    db_pool: Arc<RwLock<Option<PgPool>>>,
    nats_client: Arc<RwLock<Option<NatsClient>>>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            config: Arc::new(Config::default()),
            db_pool: Arc::new(RwLock::new(None)),
            nats_client: Arc::new(RwLock::new(None)),
        }
    }
}

impl AppState {
    /// Create a new AppState with the given configuration and no connection
    /// pools initialized. Use [`AppStateBuilder`] for connection setup.
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            db_pool: Arc::new(RwLock::new(None)),
            nats_client: Arc::new(RwLock::new(None)),
        }
    }

    /// Create a new builder for AppState
    pub fn builder() -> AppStateBuilder {
        AppStateBuilder::new()
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the database pool. `PgPool` is `Arc`-backed internally, so
    /// cloning is cheap.
    pub async fn db(&self) -> Option<PgPool> {
        self.db_pool.read().await.clone()
    }

    /// Direct access to the database pool lock, for checking availability
    /// without cloning the pool.
    pub fn db_lock(&self) -> &Arc<RwLock<Option<PgPool>>> {
        &self.db_pool
    }

    /// Get the NATS client. `async_nats::Client` is `Arc`-backed internally.
    pub async fn nats(&self) -> Option<NatsClient> {
        self.nats_client.read().await.clone()
    }

    /// Direct access to the NATS client lock.
    pub fn nats_lock(&self) -> &Arc<RwLock<Option<NatsClient>>> {
        &self.nats_client
    }

    /// Get pool health metrics for all configured pools
    pub async fn pool_health(&self) -> crate::pool_health::PoolHealthSummary {
        let mut summary = crate::pool_health::PoolHealthSummary::new();

        if let Some(pool) = self.db().await {
            summary.database = Some(crate::pool_health::DatabasePoolHealth::from_pool(
                &pool,
                &self.config.database,
            ));
        }

        if let Some(client) = self.nats().await {
            summary.nats = Some(crate::pool_health::NatsClientHealth::from_client(
                &client,
                &self.config.nats,
            ));
        }

        summary.healthy = summary.is_healthy();
        summary
    }
}

/// Builder for AppState
pub struct AppStateBuilder {
    config: Option<Config>,
    enable_tracing: bool,
    db_pool: Option<PgPool>,
    nats_client: Option<NatsClient>,
}

impl AppStateBuilder {
    /// Create a new builder with sensible defaults
    pub fn new() -> Self {
        Self {
            config: None,
            enable_tracing: true,
            db_pool: None,
            nats_client: None,
        }
    }

    /// Set the configuration
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the database pool
    pub fn db_pool(mut self, pool: PgPool) -> Self {
        self.db_pool = Some(pool);
        self
    }

    /// Set the NATS client
    pub fn nats_client(mut self, client: NatsClient) -> Self {
        self.nats_client = Some(client);
        self
    }

    /// Enable automatic tracing initialization (default: enabled)
    pub fn with_tracing(mut self) -> Self {
        self.enable_tracing = true;
        self
    }

    /// Disable automatic tracing initialization
    pub fn without_tracing(mut self) -> Self {
        self.enable_tracing = false;
        self
    }

    fn init_tracing() {
        use std::sync::Once;
        static INIT: Once = Once::new();

        INIT.call_once(|| {
            tracing_subscriber::fmt()
                .with_max_level(tracing::Level::INFO)
                .with_target(false)
                .init();
            tracing::debug!("Tracing initialized with default configuration");
        });
    }

    /// Build the AppState, connecting the database and NATS clients if a
    /// pool/client wasn't supplied explicitly.
    pub async fn build(self) -> Result<AppState> {
        if self.enable_tracing {
            Self::init_tracing();
        }

        let config = self.config.unwrap_or_default();

        let db_pool = if let Some(pool) = self.db_pool {
            Arc::new(RwLock::new(Some(pool)))
        } else {
            match crate::database::create_pool(&config.database).await {
                Ok(pool) => Arc::new(RwLock::new(Some(pool))),
                Err(e) => {
                    tracing::error!("Database connection failed: {}. Service is degraded.", e);
                    return Err(e);
                }
            }
        };

        let nats_client = if let Some(client) = self.nats_client {
            Arc::new(RwLock::new(Some(client)))
        } else if config.nats.optional {
            let client_lock = Arc::new(RwLock::new(None));
            let client_clone = client_lock.clone();
            let nats_config = config.nats.clone();

            tokio::spawn(async move {
                match crate::events::create_client(&nats_config).await {
                    Ok(client) => {
                        *client_clone.write().await = Some(client);
                        tracing::info!("NATS connection established");
                    }
                    Err(e) => {
                        tracing::warn!("Optional NATS connection failed: {}. Continuing without pub/sub.", e);
                    }
                }
            });

            client_lock
        } else {
            match crate::events::create_client(&config.nats).await {
                Ok(client) => Arc::new(RwLock::new(Some(client))),
                Err(e) => return Err(e),
            }
        };

        Ok(AppState {
            config: Arc::new(config),
            db_pool,
            nats_client,
        })
    }
}

impl Default for AppStateBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_default_config() {
        let state = AppState::default();
        assert_eq!(state.config().service.name, "relay-service");
    }
}
