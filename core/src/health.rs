//! Health check handlers backing the ingress `/api/health` route (C11)

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{error::Error, state::AppState};

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service name
    pub service: String,

    /// Version
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Readiness check response with dependency status
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadinessResponse {
    /// Overall readiness status
    pub ready: bool,

    /// Service name
    pub service: String,

    /// Dependency statuses
    pub dependencies: HashMap<String, DependencyStatus>,
}

/// Individual dependency status
#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    /// Dependency is healthy
    pub healthy: bool,

    /// Optional message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Simple health check (liveness probe). Always returns 200 while the
/// process is running.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "healthy".to_string(),
        service: state.config().service.name.clone(),
        version: Some(env!("CARGO_PKG_VERSION").to_string()),
    };

    (StatusCode::OK, Json(response))
}

/// Readiness check with dependency validation: 200 only if Postgres and
/// NATS (unless marked optional) both respond.
pub async fn readiness(State(state): State<AppState>) -> Result<impl IntoResponse, Error> {
    let mut dependencies = HashMap::new();
    let mut all_ready = true;

    match state.db().await {
        Some(pool) => match sqlx::query("SELECT 1").fetch_one(&pool).await {
            Ok(_) => {
                dependencies.insert(
                    "database".to_string(),
                    DependencyStatus {
                        healthy: true,
                        message: Some("Connected".to_string()),
                    },
                );
            }
            Err(e) => {
                tracing::error!("Database health check failed: {}", e);
                all_ready = false;
                dependencies.insert(
                    "database".to_string(),
                    DependencyStatus {
                        healthy: false,
                        message: Some(format!("Connection failed: {}", e)),
                    },
                );
            }
        },
        None => {
            all_ready = false;
            dependencies.insert(
                "database".to_string(),
                DependencyStatus {
                    healthy: false,
                    message: Some("Not connected".to_string()),
                },
            );
        }
    }

    match state.nats().await {
        Some(client) => match client.connection_state() {
            async_nats::connection::State::Connected => {
                dependencies.insert(
                    "nats".to_string(),
                    DependencyStatus {
                        healthy: true,
                        message: Some("Connected".to_string()),
                    },
                );
            }
            conn_state => {
                tracing::warn!("NATS connection state: {:?}", conn_state);
                if !state.config().nats.optional {
                    all_ready = false;
                }
                dependencies.insert(
                    "nats".to_string(),
                    DependencyStatus {
                        healthy: false,
                        message: Some(format!("Connection state: {:?}", conn_state)),
                    },
                );
            }
        },
        None => {
            if !state.config().nats.optional {
                all_ready = false;
            }
            let message = if state.config().nats.lazy_init {
                "Connection initializing (lazy mode)".to_string()
            } else {
                "Not connected".to_string()
            };
            dependencies.insert(
                "nats".to_string(),
                DependencyStatus {
                    healthy: false,
                    message: Some(message),
                },
            );
        }
    }

    let response = ReadinessResponse {
        ready: all_ready,
        service: state.config().service.name.clone(),
        dependencies,
    };

    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    Ok((status, Json(response)))
}

/// Pool health metrics endpoint: Postgres pool utilization and NATS
/// connection state, for monitoring and capacity planning.
pub async fn pool_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.pool_health().await;
    let status = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(health))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response() {
        let response = HealthResponse {
            status: "healthy".to_string(),
            service: "test-service".to_string(),
            version: Some("1.0.0".to_string()),
        };

        assert_eq!(response.status, "healthy");
        assert_eq!(response.service, "test-service");
    }

    #[test]
    fn test_dependency_status() {
        let status = DependencyStatus {
            healthy: true,
            message: Some("OK".to_string()),
        };

        assert!(status.healthy);
        assert_eq!(status.message, Some("OK".to_string()));
    }
}
