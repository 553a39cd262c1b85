//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence
//! (highest to lowest):
//! 1. Environment variables (prefix: `RELAY_`)
//! 2. Current working directory: `./config.toml`
//! 3. XDG config directory: `~/.config/relay-core/{service_name}/config.toml`
//! 4. System directory: `/etc/relay-core/{service_name}/config.toml`
//! 5. Default values
//!
//! The variable names enumerated in the platform's external-interface contract
//! (`STAGE`, `WEB_ACTIONS_TOPIC_ARN`, `NOTIFICATIONS_TOPIC_ARN`,
//! `AGENT_RESPONSE_TOPIC_ARN`, `MESSAGES_TABLE_NAME`,
//! `WEB_ACTION_RESULTS_TABLE_NAME`, `SCHEDULES_TABLE_NAME`,
//! `CIRCUIT_BREAKER_TABLE_NAME`, `MAX_RETRIES`, `LOG_LEVEL`) map onto
//! `RELAY_SERVICE_STAGE`, `RELAY_TOPICS_WEB_ACTIONS`, etc. through figment's
//! env provider.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::middleware::request_tracking::RequestTrackingConfig;

/// Deployment stage tag, carried on `Message.stage` as the multi-tenant-by-tag boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Dev,
    Stage,
    Prod,
}

impl Default for Stage {
    fn default() -> Self {
        Stage::Dev
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Dev => write!(f, "dev"),
            Stage::Stage => write!(f, "stage"),
            Stage::Prod => write!(f, "prod"),
        }
    }
}

/// Main configuration structure, shared by every binary in the workspace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service-level configuration
    pub service: ServiceConfig,

    /// Persistence adapter configuration (C5)
    pub database: DatabaseConfig,

    /// Pub/sub configuration (C6)
    pub nats: NatsConfig,

    /// Topic routing configuration (C6)
    #[serde(default)]
    pub topics: TopicsConfig,

    /// JWT verification defaults (C3) -- per-message `auth_config` can override
    /// the jwks/issuer/algorithm for a specific course
    #[serde(default)]
    pub jwt: JwtVerificationConfig,

    /// Secret-name prefix template, per stage (C3)
    #[serde(default)]
    pub secrets: SecretsConfig,

    /// Path to the course/action catalog TOML file (C4)
    #[serde(default = "default_course_catalog_path")]
    pub course_catalog_path: PathBuf,

    /// Idempotency & retry defaults (C14)
    #[serde(default)]
    pub retry: RetryConfig,

    /// HTTP ingress middleware configuration (C11)
    #[serde(default)]
    pub middleware: MiddlewareConfig,

    /// OpenTelemetry configuration (optional, C13)
    #[serde(default)]
    pub otlp: Option<OtlpConfig>,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name (used for logging and XDG config path resolution)
    pub name: String,

    /// Port to listen on (ingress only; workers ignore this)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Request/handler timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Deployment stage tag
    #[serde(default)]
    pub stage: Stage,
}

/// Persistence adapter configuration (C5)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum idle connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Maximum retry attempts for establishing the database connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Table name for `messages` (PK=id, secondary index on (stage, created_date) and (status, created_date))
    #[serde(default = "default_messages_table")]
    pub messages_table: String,

    /// Table name for `web_action_results` (PK=id, secondary index on message_id)
    #[serde(default = "default_web_action_results_table")]
    pub web_action_results_table: String,

    /// Table name for `schedules` (PK=id, optional secondary index on (stage, status))
    #[serde(default = "default_schedules_table")]
    pub schedules_table: String,

    /// Table name for the persisted circuit-breaker state (C14)
    #[serde(default = "default_circuit_breaker_table")]
    pub circuit_breaker_table: String,
}

/// NATS configuration (C6 pub/sub transport)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    /// NATS server URL
    pub url: String,

    /// Connection name
    #[serde(default)]
    pub name: Option<String>,

    /// Max reconnection attempts
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: usize,

    /// Maximum retry attempts for initial connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Whether NATS is optional (service can start without it)
    #[serde(default = "default_false")]
    pub optional: bool,

    /// Whether to initialize the connection lazily (in background)
    #[serde(default = "default_lazy_init")]
    pub lazy_init: bool,
}

/// Topic routing configuration -- resolves the destination subject for a
/// published `Message` by `message_type`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicsConfig {
    #[serde(default = "default_web_actions_topic")]
    pub web_actions: String,
    #[serde(default = "default_notifications_topic")]
    pub notifications: String,
    #[serde(default = "default_agent_response_topic")]
    pub agent_response: String,
    #[serde(default = "default_dlq_prefix")]
    pub dlq_prefix: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            web_actions: default_web_actions_topic(),
            notifications: default_notifications_topic(),
            agent_response: default_agent_response_topic(),
            dlq_prefix: default_dlq_prefix(),
        }
    }
}

/// Default JWT/JWKS verification policy (C3)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtVerificationConfig {
    /// Algorithms accepted when verifying a JWT against its JWKS (never `none`)
    #[serde(default = "default_jwt_algorithms")]
    pub allowed_algorithms: Vec<String>,

    /// Expected issuer, if the caller wants issuer validation enforced globally
    #[serde(default)]
    pub issuer: Option<String>,

    /// JWKS cache TTL in seconds (default 24h)
    #[serde(default = "default_jwks_cache_ttl_secs")]
    pub jwks_cache_ttl_secs: u64,
}

impl Default for JwtVerificationConfig {
    fn default() -> Self {
        Self {
            allowed_algorithms: default_jwt_algorithms(),
            issuer: None,
            jwks_cache_ttl_secs: default_jwks_cache_ttl_secs(),
        }
    }
}

/// Secret-name templating configuration (C3)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// Template with a `{stage}` placeholder, e.g. `relay/{stage}/course-creds`
    #[serde(default = "default_secret_name_prefix")]
    pub name_prefix_template: String,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            name_prefix_template: default_secret_name_prefix(),
        }
    }
}

/// Idempotency & retry defaults (C14)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum redelivery attempts before a record is routed to its DLQ (K=3, §4.7)
    #[serde(default = "default_max_redeliveries")]
    pub max_retries: u32,

    /// Backoff base delay in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Backoff cap in milliseconds
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_redeliveries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

/// OpenTelemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtlpConfig {
    /// OTLP endpoint URL
    pub endpoint: String,
    /// Service name for tracing
    #[serde(default)]
    pub service_name: Option<String>,
    /// Enable tracing
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Security headers configuration, applied to every ingress response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityHeadersConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub hsts: bool,
    #[serde(default = "default_hsts_max_age")]
    pub hsts_max_age_secs: u64,
    #[serde(default = "default_true")]
    pub hsts_include_subdomains: bool,
    #[serde(default = "default_false")]
    pub hsts_preload: bool,
    #[serde(default = "default_true")]
    pub x_content_type_options: bool,
    #[serde(default = "default_x_frame_options")]
    pub x_frame_options: String,
    #[serde(default = "default_true")]
    pub x_xss_protection: bool,
    #[serde(default = "default_referrer_policy")]
    pub referrer_policy: String,
    #[serde(default)]
    pub permissions_policy: Option<String>,
}

impl Default for SecurityHeadersConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hsts: true,
            hsts_max_age_secs: default_hsts_max_age(),
            hsts_include_subdomains: true,
            hsts_preload: false,
            x_content_type_options: true,
            x_frame_options: default_x_frame_options(),
            x_xss_protection: true,
            referrer_policy: default_referrer_policy(),
            permissions_policy: None,
        }
    }
}

/// Middleware configuration for the ingress binary (C11)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddlewareConfig {
    /// Request tracking configuration (request IDs -- the correlation id origin, C13)
    #[serde(default)]
    pub request_tracking: RequestTrackingConfig,

    /// Resilience configuration (circuit breaker defaults, C14)
    #[serde(default)]
    pub resilience: ResilienceConfig,

    /// Security headers
    #[serde(default)]
    pub security_headers: SecurityHeadersConfig,

    /// Request body size limit in MB
    #[serde(default = "default_body_limit_mb")]
    pub body_limit_mb: usize,

    /// Enable panic recovery middleware
    #[serde(default = "default_true")]
    pub catch_panic: bool,

    /// Enable compression
    #[serde(default = "default_true")]
    pub compression: bool,

    /// CORS configuration
    #[serde(default = "default_cors_mode")]
    pub cors_mode: String,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            request_tracking: RequestTrackingConfig::default(),
            resilience: ResilienceConfig::default(),
            security_headers: SecurityHeadersConfig::default(),
            body_limit_mb: default_body_limit_mb(),
            catch_panic: true,
            compression: true,
            cors_mode: default_cors_mode(),
        }
    }
}

/// Circuit breaker configuration (C14, §4.8 step 3)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Failure count within the rolling window that opens the breaker
    #[serde(default = "default_cb_failure_threshold")]
    pub failure_threshold: u32,

    /// Rolling window over which failures are counted, in seconds
    #[serde(default = "default_cb_window_secs")]
    pub window_secs: u64,

    /// How long the breaker stays open before allowing a half-open probe
    #[serde(default = "default_cb_open_secs")]
    pub open_secs: u64,

    /// Consecutive successes required in half-open state to re-close
    #[serde(default = "default_cb_half_open_successes")]
    pub half_open_successes: u32,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_cb_failure_threshold(),
            window_secs: default_cb_window_secs(),
            open_secs: default_cb_open_secs(),
            half_open_successes: default_cb_half_open_successes(),
        }
    }
}

impl ResilienceConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn open_duration(&self) -> Duration {
        Duration::from_secs(self.open_secs)
    }
}

// ============================================================================
// Default value functions (figment requires named fns, not closures)
// ============================================================================

fn default_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_timeout() -> u64 {
    30
}
fn default_max_connections() -> u32 {
    10
}
fn default_min_connections() -> u32 {
    1
}
fn default_connection_timeout() -> u64 {
    10
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    2
}
fn default_messages_table() -> String {
    "messages".to_string()
}
fn default_web_action_results_table() -> String {
    "web_action_results".to_string()
}
fn default_schedules_table() -> String {
    "schedules".to_string()
}
fn default_circuit_breaker_table() -> String {
    "circuit_breaker_state".to_string()
}
fn default_max_reconnects() -> usize {
    60
}
fn default_false() -> bool {
    false
}
fn default_true() -> bool {
    true
}
fn default_lazy_init() -> bool {
    false
}
fn default_web_actions_topic() -> String {
    "relay.web-actions".to_string()
}
fn default_notifications_topic() -> String {
    "relay.notifications".to_string()
}
fn default_agent_response_topic() -> String {
    "relay.agent-response".to_string()
}
fn default_dlq_prefix() -> String {
    "relay.dlq".to_string()
}
fn default_jwt_algorithms() -> Vec<String> {
    vec!["RS256".to_string(), "ES256".to_string()]
}
fn default_jwks_cache_ttl_secs() -> u64 {
    24 * 60 * 60
}
fn default_secret_name_prefix() -> String {
    "relay/{stage}/courses".to_string()
}
fn default_course_catalog_path() -> PathBuf {
    PathBuf::from("./config/courses.toml")
}
fn default_max_redeliveries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_cap_ms() -> u64 {
    32_000
}
fn default_body_limit_mb() -> usize {
    10
}
fn default_cors_mode() -> String {
    "permissive".to_string()
}
fn default_request_id_header() -> String {
    "x-request-id".to_string()
}
fn default_hsts_max_age() -> u64 {
    31_536_000
}
fn default_x_frame_options() -> String {
    "DENY".to_string()
}
fn default_referrer_policy() -> String {
    "strict-origin-when-cross-origin".to_string()
}
fn default_cb_failure_threshold() -> u32 {
    5
}
fn default_cb_window_secs() -> u64 {
    60
}
fn default_cb_open_secs() -> u64 {
    30
}
fn default_cb_half_open_successes() -> u32 {
    2
}

impl Config {
    /// Load configuration from all sources
    ///
    /// Searches for config files in this order (first found is used):
    /// 1. Current working directory: `./config.toml`
    /// 2. XDG config directory: `~/.config/relay-core/{service_name}/config.toml`
    /// 3. System directory: `/etc/relay-core/{service_name}/config.toml`
    ///
    /// Environment variables (`RELAY_` prefix) override all file-based configs.
    pub fn load() -> Result<Self> {
        let service_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "relay-service".to_string());

        Self::load_for_service(&service_name)
    }

    /// Load configuration for a specific service name
    pub fn load_for_service(service_name: &str) -> Result<Self> {
        let config_paths = Self::find_config_paths(service_name);

        tracing::debug!("Searching for config files in order:");
        for path in &config_paths {
            tracing::debug!("  - {}", path.display());
        }

        let mut figment = Figment::new();

        for path in config_paths.iter().rev() {
            if path.exists() {
                tracing::info!("Loading configuration from: {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(Env::prefixed("RELAY_").split("_"));

        let config: Config = figment.extract()?;
        Ok(config)
    }

    /// Load configuration from a specific file, bypassing XDG/system lookup.
    /// Useful for tests or non-standard deployments.
    pub fn load_from(path: &str) -> Result<Self> {
        let config = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("RELAY_").split("_"))
            .extract()?;

        Ok(config)
    }

    fn find_config_paths(service_name: &str) -> Vec<PathBuf> {
        let mut paths = Vec::new();

        paths.push(PathBuf::from("config.toml"));

        let xdg_dirs = xdg::BaseDirectories::with_prefix("relay-core");
        let config_file_path = Path::new(service_name).join("config.toml");
        if let Ok(path) = xdg_dirs.place_config_file(&config_file_path) {
            paths.push(path);
        }

        paths.push(
            PathBuf::from("/etc/relay-core")
                .join(service_name)
                .join("config.toml"),
        );

        paths
    }

    pub fn secret_name_prefix(&self) -> String {
        self.secrets
            .name_prefix_template
            .replace("{stage}", &self.service.stage.to_string())
    }
}

/// This exists purely so `figment::providers::Serialized::defaults` has
/// something to merge under the file/env layers during tests that build a
/// `Config` by hand rather than loading it.
impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: "relay-service".to_string(),
                port: default_port(),
                log_level: default_log_level(),
                timeout_secs: default_timeout(),
                stage: Stage::default(),
            },
            database: DatabaseConfig {
                url: "postgres://localhost/relay".to_string(),
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                connection_timeout_secs: default_connection_timeout(),
                max_retries: default_max_retries(),
                retry_delay_secs: default_retry_delay(),
                messages_table: default_messages_table(),
                web_action_results_table: default_web_action_results_table(),
                schedules_table: default_schedules_table(),
                circuit_breaker_table: default_circuit_breaker_table(),
            },
            nats: NatsConfig {
                url: "nats://localhost:4222".to_string(),
                name: None,
                max_reconnects: default_max_reconnects(),
                max_retries: default_max_retries(),
                retry_delay_secs: default_retry_delay(),
                optional: false,
                lazy_init: false,
            },
            topics: TopicsConfig::default(),
            jwt: JwtVerificationConfig::default(),
            secrets: SecretsConfig::default(),
            course_catalog_path: default_course_catalog_path(),
            retry: RetryConfig::default(),
            middleware: MiddlewareConfig::default(),
            otlp: None,
        }
    }
}

#[allow(unused_imports)]
use figment::providers::Serialized as _SerializedUnused;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service.port, 8080);
        assert_eq!(config.service.log_level, "info");
        assert_eq!(config.topics.web_actions, "relay.web-actions");
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn test_secret_name_prefix_interpolates_stage() {
        let mut config = Config::default();
        config.service.stage = Stage::Prod;
        assert_eq!(config.secret_name_prefix(), "relay/prod/courses");
    }

    #[test]
    fn test_load_from_missing_file_falls_back_to_defaults() {
        let config = Config::load_from("/nonexistent/config.toml").unwrap();
        assert_eq!(config.service.port, 8080);
    }
}
