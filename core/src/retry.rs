//! Idempotency & retry primitives (C14): exponential backoff with full
//! jitter, and a circuit breaker whose state is persisted through C5 so
//! every concurrently running worker process observes the same view.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::ResilienceConfig;
use crate::error::{Error, Result};

/// `wait = min(cap, base*2^attempt) + rand(0, 0.5s)`.
pub mod backoff {
    use super::*;

    pub async fn with_backoff<F, Fut, T>(
        max_retries: u32,
        base: Duration,
        cap: Duration,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < max_retries && is_retryable(&err) => {
                    tokio::time::sleep(delay_for_attempt(attempt, base, cap)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Network timeouts and `429`/`502`/`503`/`504` are retryable; anything
    /// else is terminal.
    pub fn is_retryable(error: &Error) -> bool {
        matches!(
            error,
            Error::NetworkTimeout(_)
                | Error::HttpStatus(429)
                | Error::HttpStatus(502)
                | Error::HttpStatus(503)
                | Error::HttpStatus(504)
        )
    }

    pub fn delay_for_attempt(attempt: u32, base: Duration, cap: Duration) -> Duration {
        let exp = base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX).max(1));
        let capped = exp.min(cap);
        let jitter = Duration::from_millis(rand::rng().random_range(0..500));
        capped + jitter
    }
}

/// Observed circuit-breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// `{state, failure_count, window_start, opened_at, last_success}`, the row
/// persisted through C5's `circuit_breaker_table`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerRecord {
    pub state: BreakerState,
    pub failure_count: u32,
    pub window_start: DateTime<Utc>,
    pub opened_at: Option<DateTime<Utc>>,
    pub half_open_successes: u32,
    pub last_success: Option<DateTime<Utc>>,
}

impl BreakerRecord {
    pub fn closed(now: DateTime<Utc>) -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            window_start: now,
            opened_at: None,
            half_open_successes: 0,
            last_success: None,
        }
    }
}

/// Persists breaker rows by name; a thin seam over C5's keyed store, kept
/// narrow so the circuit breaker doesn't need the full `Store` surface.
#[async_trait::async_trait]
pub trait BreakerStore: Send + Sync {
    async fn load(&self, name: &str) -> Result<Option<BreakerRecord>>;
    async fn save(&self, name: &str, record: &BreakerRecord) -> Result<()>;
}

/// In-process fake, useful for tests and for a single-binary deployment
/// that doesn't need cross-process breaker sharing.
#[derive(Default)]
pub struct InMemoryBreakerStore {
    rows: tokio::sync::Mutex<std::collections::HashMap<String, BreakerRecord>>,
}

#[async_trait::async_trait]
impl BreakerStore for InMemoryBreakerStore {
    async fn load(&self, name: &str) -> Result<Option<BreakerRecord>> {
        Ok(self.rows.lock().await.get(name).cloned())
    }

    async fn save(&self, name: &str, record: &BreakerRecord) -> Result<()> {
        self.rows.lock().await.insert(name.to_string(), record.clone());
        Ok(())
    }
}

/// `sqlx`-backed breaker row, against `DatabaseConfig::circuit_breaker_table`.
/// State is persisted so that all concurrently running workers observe the
/// same value.
pub struct PostgresBreakerStore {
    pool: sqlx::PgPool,
    table: String,
}

impl PostgresBreakerStore {
    pub fn new(pool: sqlx::PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct BreakerRow {
    state: String,
    failure_count: i32,
    window_start: DateTime<Utc>,
    opened_at: Option<DateTime<Utc>>,
    half_open_successes: i32,
    last_success: Option<DateTime<Utc>>,
}

impl BreakerRow {
    fn into_record(self) -> Result<BreakerRecord> {
        let state = match self.state.as_str() {
            "closed" => BreakerState::Closed,
            "open" => BreakerState::Open,
            "half_open" => BreakerState::HalfOpen,
            other => {
                return Err(Error::Internal(format!(
                    "unknown persisted circuit breaker state: {other}"
                )))
            }
        };
        Ok(BreakerRecord {
            state,
            failure_count: self.failure_count as u32,
            window_start: self.window_start,
            opened_at: self.opened_at,
            half_open_successes: self.half_open_successes as u32,
            last_success: self.last_success,
        })
    }
}

fn state_name(state: BreakerState) -> &'static str {
    match state {
        BreakerState::Closed => "closed",
        BreakerState::Open => "open",
        BreakerState::HalfOpen => "half_open",
    }
}

#[async_trait::async_trait]
impl BreakerStore for PostgresBreakerStore {
    async fn load(&self, name: &str) -> Result<Option<BreakerRecord>> {
        let row = sqlx::query_as::<_, BreakerRow>(&format!(
            "SELECT state, failure_count, window_start, opened_at, half_open_successes, \
             last_success FROM {} WHERE name = $1",
            self.table
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::from)?;

        row.map(BreakerRow::into_record).transpose()
    }

    async fn save(&self, name: &str, record: &BreakerRecord) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (name, state, failure_count, window_start, opened_at, \
             half_open_successes, last_success) VALUES ($1,$2,$3,$4,$5,$6,$7) \
             ON CONFLICT (name) DO UPDATE SET state = EXCLUDED.state, \
             failure_count = EXCLUDED.failure_count, window_start = EXCLUDED.window_start, \
             opened_at = EXCLUDED.opened_at, half_open_successes = EXCLUDED.half_open_successes, \
             last_success = EXCLUDED.last_success",
            self.table
        ))
        .bind(name)
        .bind(state_name(record.state))
        .bind(record.failure_count as i32)
        .bind(record.window_start)
        .bind(record.opened_at)
        .bind(record.half_open_successes as i32)
        .bind(record.last_success)
        .execute(&self.pool)
        .await
        .map_err(Error::from)?;

        Ok(())
    }
}

/// Wraps a named downstream call with persisted circuit-breaker state.
/// Reads/writes are each a single keyed store operation; stale reads are
/// tolerated -- worst case one extra request goes through a not-yet-opened
/// breaker.
pub struct CircuitBreaker {
    name: String,
    store: std::sync::Arc<dyn BreakerStore>,
    config: ResilienceConfig,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, store: std::sync::Arc<dyn BreakerStore>, config: ResilienceConfig) -> Self {
        Self {
            name: name.into(),
            store,
            config,
        }
    }

    /// Run `operation` through the breaker: fail fast while open, allow
    /// exactly one probe while half-open, and record the outcome back to
    /// the store on every transition.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let now = Utc::now();
        let mut record = self
            .store
            .load(&self.name)
            .await?
            .unwrap_or_else(|| BreakerRecord::closed(now));

        if record.state == BreakerState::Open {
            let opened_at = record.opened_at.unwrap_or(now);
            let elapsed = (now - opened_at).to_std().unwrap_or_default();
            if elapsed >= self.config.open_duration() {
                record.state = BreakerState::HalfOpen;
                record.half_open_successes = 0;
                self.store.save(&self.name, &record).await?;
            } else {
                return Err(Error::External(format!(
                    "circuit breaker {} is open",
                    self.name
                )));
            }
        }

        match operation().await {
            Ok(value) => {
                self.record_success(&mut record, now).await?;
                Ok(value)
            }
            Err(err) => {
                self.record_failure(&mut record, now).await?;
                Err(err)
            }
        }
    }

    async fn record_success(&self, record: &mut BreakerRecord, now: DateTime<Utc>) -> Result<()> {
        record.last_success = Some(now);

        match record.state {
            BreakerState::HalfOpen => {
                record.half_open_successes += 1;
                if record.half_open_successes >= self.config.half_open_successes {
                    *record = BreakerRecord::closed(now);
                    record.last_success = Some(now);
                }
            }
            BreakerState::Closed => {
                record.failure_count = 0;
            }
            BreakerState::Open => {}
        }

        self.store.save(&self.name, record).await
    }

    async fn record_failure(&self, record: &mut BreakerRecord, now: DateTime<Utc>) -> Result<()> {
        match record.state {
            BreakerState::HalfOpen => {
                record.state = BreakerState::Open;
                record.opened_at = Some(now);
                record.failure_count = 0;
            }
            BreakerState::Closed => {
                let elapsed = (now - record.window_start).to_std().unwrap_or_default();
                if elapsed > self.config.window() {
                    record.window_start = now;
                    record.failure_count = 0;
                }
                record.failure_count += 1;
                if record.failure_count >= self.config.failure_threshold {
                    record.state = BreakerState::Open;
                    record.opened_at = Some(now);
                }
            }
            BreakerState::Open => {}
        }

        self.store.save(&self.name, record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> ResilienceConfig {
        ResilienceConfig {
            failure_threshold: 2,
            window_secs: 60,
            open_secs: 30,
            half_open_successes: 2,
        }
    }

    #[test]
    fn test_delay_for_attempt_respects_cap() {
        let delay = backoff::delay_for_attempt(10, Duration::from_secs(1), Duration::from_secs(32));
        assert!(delay <= Duration::from_millis(32_500));
    }

    #[test]
    fn test_is_retryable_classifies_status_codes() {
        assert!(backoff::is_retryable(&Error::HttpStatus(429)));
        assert!(backoff::is_retryable(&Error::HttpStatus(502)));
        assert!(backoff::is_retryable(&Error::HttpStatus(503)));
        assert!(backoff::is_retryable(&Error::HttpStatus(504)));
        assert!(!backoff::is_retryable(&Error::HttpStatus(400)));
    }

    #[tokio::test]
    async fn test_with_backoff_retries_then_succeeds() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result = backoff::with_backoff(3, Duration::from_millis(1), Duration::from_millis(5), move |_| {
            let attempts = attempts_clone.clone();
            async move {
                let count = attempts.fetch_add(1, Ordering::SeqCst);
                if count < 2 {
                    Err(Error::HttpStatus(503))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_backoff_does_not_retry_terminal_errors() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<()> = backoff::with_backoff(3, Duration::from_millis(1), Duration::from_millis(5), move |_| {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::InvalidPayload("bad request".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_after_threshold_failures() {
        let store = Arc::new(InMemoryBreakerStore::default());
        let breaker = CircuitBreaker::new("test-breaker", store.clone(), config());

        for _ in 0..2 {
            let _: Result<()> = breaker.call(|| async { Err(Error::HttpStatus(503)) }).await;
        }

        let result: Result<()> = breaker.call(|| async { Ok(()) }).await;
        assert!(result.is_err());

        let record = store.load("test-breaker").await.unwrap().unwrap();
        assert_eq!(record.state, BreakerState::Open);
    }

    #[tokio::test]
    async fn test_circuit_breaker_half_open_recloses_after_successes() {
        let store = Arc::new(InMemoryBreakerStore::default());
        let mut record = BreakerRecord::closed(Utc::now());
        record.state = BreakerState::HalfOpen;
        store.save("test-breaker", &record).await.unwrap();

        let breaker = CircuitBreaker::new("test-breaker", store.clone(), config());
        for _ in 0..2 {
            let _: Result<()> = breaker.call(|| async { Ok(()) }).await;
        }

        let record = store.load("test-breaker").await.unwrap().unwrap();
        assert_eq!(record.state, BreakerState::Closed);
    }
}
