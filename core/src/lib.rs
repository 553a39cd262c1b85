//! # relay-core
//!
//! Shared runtime for the message orchestration platform: message model,
//! SSRF-hardened HTTP egress, secrets/OAuth/JWKS client, course registry,
//! persistence, pub/sub publishing, batch consumption, and the retry /
//! circuit-breaker primitives every worker binary builds on.
//!
//! ## Example
//!
//! ```rust,no_run
//! use relay_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let state = AppState::builder()
//!         .config(config.clone())
//!         .build()
//!         .await?;
//!
//!     let app = Router::new()
//!         .route("/health", get(health))
//!         .route("/ready", get(readiness))
//!         .with_state(state);
//!
//!     Server::new(config).serve(app).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod ids;
pub mod middleware;
pub mod health;
pub mod pool_health;
pub mod responses;
pub mod server;
pub mod state;
pub mod database;
pub mod events;
pub mod observability;

pub mod message;
pub mod course;
pub mod http_client;
pub mod secrets;
pub mod persistence;
pub mod pubsub;
pub mod consumer;
pub mod retry;
pub mod schedule;
pub mod seed;
pub mod web_action;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{
        Config, DatabaseConfig, JwtVerificationConfig, NatsConfig, ResilienceConfig, RetryConfig,
        SecretsConfig, SecurityHeadersConfig, ServiceConfig, Stage, TopicsConfig,
    };

    pub use crate::error::{Error, Result};
    pub use crate::health::{health, pool_metrics, readiness};
    pub use crate::ids::{MakeTypedRequestId, RequestId, RequestIdError};
    pub use crate::pool_health::{DatabasePoolHealth, NatsClientHealth, PoolHealthSummary};

    pub use crate::middleware::{
        apply_security_headers, request_id_layer, request_id_propagation_layer,
        sensitive_headers_layer, RequestTrackingConfig, PROPAGATE_HEADERS, SENSITIVE_HEADERS,
    };

    pub use crate::server::Server;
    pub use crate::state::{AppState, AppStateBuilder};

    pub use crate::responses::{
        Accepted, Conflict, Created, FieldError, NoContent, Success, ValidationError,
    };

    pub use crate::observability::init_tracing;

    pub use crate::message::{Message, MessageStatus, MessageType};
    pub use crate::course::{CourseDefinition, CourseRegistry};
    pub use crate::http_client::SafeHttpClient;
    pub use crate::secrets::{JwksVerifier, OAuthTokenClient, SecretsClient};
    pub use crate::persistence::Store;
    pub use crate::pubsub::Publisher;
    pub use crate::consumer::BatchConsumer;
    pub use crate::retry::CircuitBreaker;
    pub use crate::schedule::{Schedule, ScheduleExpression};
    pub use crate::web_action::{WebActionPayload, WebActionResult};

    pub use axum::{
        extract::{Path, Query, State},
        http::{HeaderMap, HeaderValue, StatusCode},
        response::{IntoResponse, Json, Response},
        routing::{delete, get, patch, post, put},
        Extension, Router,
    };

    pub use serde::{Deserialize, Serialize};

    // Re-export tracing macros and types
    pub use tracing::{debug, error, info, instrument, trace, warn, Level, Span};

    // Re-export tokio for async runtime
    pub use tokio;

    // Re-export async-trait for async trait definitions
    pub use async_trait::async_trait;

    // Re-export error handling utilities
    pub use anyhow::{self, Context as AnyhowContext};
    pub use thiserror::Error;

    // Re-export time utilities
    pub use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};

    // Re-export UUID
    pub use uuid::Uuid;

    // Re-export futures utilities
    pub use futures::{future, stream, Future, Stream, StreamExt, TryFutureExt, TryStreamExt};

    // Re-export HTTP types
    pub use http::{Method, Uri};
}
