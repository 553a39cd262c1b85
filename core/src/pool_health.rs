//! Connection pool health monitoring

use serde::{Deserialize, Serialize};

/// Database connection pool health metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabasePoolHealth {
    /// Total number of connections in the pool
    pub size: u32,

    /// Number of idle connections available
    pub idle: usize,

    /// Maximum pool size configured
    pub max_size: u32,

    /// Minimum pool size configured
    pub min_size: u32,

    /// Whether the pool is healthy
    pub healthy: bool,

    /// Pool utilization percentage (0-100)
    pub utilization_percent: f32,
}

impl DatabasePoolHealth {
    /// Create health metrics from a PostgreSQL pool
    pub fn from_pool(pool: &sqlx::PgPool, config: &crate::config::DatabaseConfig) -> Self {
        let size = pool.size();
        let idle = pool.num_idle();
        let max_size = config.max_connections;
        let min_size = config.min_connections;

        let utilization_percent = if max_size > 0 {
            ((size as f32 / max_size as f32) * 100.0).min(100.0)
        } else {
            0.0
        };

        let healthy = size < max_size;

        Self {
            size,
            idle,
            max_size,
            min_size,
            healthy,
            utilization_percent,
        }
    }
}

/// NATS client health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsClientHealth {
    /// Whether the client is connected
    pub connected: bool,

    /// Server URL
    pub server_url: String,

    /// Client name if configured
    pub client_name: Option<String>,
}

impl NatsClientHealth {
    /// Create health status from a NATS client
    pub fn from_client(client: &async_nats::Client, config: &crate::config::NatsConfig) -> Self {
        Self {
            connected: client.connection_state() == async_nats::connection::State::Connected,
            server_url: config.url.clone(),
            client_name: config.name.clone(),
        }
    }
}

/// Overall pool health summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolHealthSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabasePoolHealth>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub nats: Option<NatsClientHealth>,

    /// Overall healthy status
    pub healthy: bool,
}

impl PoolHealthSummary {
    /// Create a new pool health summary
    pub fn new() -> Self {
        Self {
            database: None,
            nats: None,
            healthy: true,
        }
    }

    /// Check if all pools are healthy
    pub fn is_healthy(&self) -> bool {
        let database_healthy = self.database.as_ref().map_or(true, |db| db.healthy);
        let events_healthy = self.nats.as_ref().map_or(true, |nats| nats.connected);
        database_healthy && events_healthy
    }
}

impl Default for PoolHealthSummary {
    fn default() -> Self {
        Self::new()
    }
}
