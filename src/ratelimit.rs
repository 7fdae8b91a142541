//! Rate-limit decisions from an external service.
//!
//! Before polling a queue the scheduler asks whether the queue's key is
//! throttled. The answer is advisory: any error, timeout or unexpected
//! status resolves to "not throttled" so a broken decision service never
//! stops consumption.

use crate::config::RateLimitConfig;
use crate::error::{DockhandError, DockhandResult};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Statuses worth another attempt.
const RETRY_STATUSES: [u16; 5] = [400, 500, 502, 503, 504];

/// Status meaning "over the limit".
const THROTTLED_STATUS: u16 = 429;

/// Answers whether work under a key should be held back.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// `true` only when the service explicitly reports the key as over its limit.
    async fn is_throttled(&self, key: &str) -> bool;

    /// Count one unit of work against `key`. The outcome is ignored.
    async fn record_hit(&self, key: &str);
}

/// Rate limiter that never throttles.
#[derive(Debug, Clone, Default)]
pub struct NoopRateLimiter;

#[async_trait]
impl RateLimiter for NoopRateLimiter {
    async fn is_throttled(&self, _key: &str) -> bool {
        false
    }

    async fn record_hit(&self, _key: &str) {}
}

#[derive(Serialize)]
struct DecisionRequest<'a> {
    domain: &'a str,
    descriptors: [Descriptor<'a>; 1],
}

#[derive(Serialize)]
struct Descriptor<'a> {
    entries: [Entry<'a>; 1],
}

#[derive(Serialize)]
struct Entry<'a> {
    key: &'a str,
}

/// Client of a JSON rate-limit decision service.
#[derive(Debug, Clone)]
pub struct HttpRateLimiter {
    http_client: reqwest::Client,
    url: String,
    domain: String,
    decision_ceiling: Duration,
    max_attempts: u32,
    backoff: Duration,
}

impl HttpRateLimiter {
    /// Create a client from configuration.
    pub fn new(config: &RateLimitConfig) -> DockhandResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| DockhandError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            url: config.url.clone(),
            domain: config.domain.clone(),
            decision_ceiling: Duration::from_millis(config.decision_ceiling_ms),
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
        })
    }

    fn request_body<'a>(&'a self, key: &'a str) -> DecisionRequest<'a> {
        DecisionRequest {
            domain: &self.domain,
            descriptors: [Descriptor {
                entries: [Entry { key }],
            }],
        }
    }

    async fn post(&self, key: &str) -> Result<u16, reqwest::Error> {
        let response = self
            .http_client
            .post(&self.url)
            .json(&self.request_body(key))
            .send()
            .await?;
        Ok(response.status().as_u16())
    }

    async fn decide(&self, key: &str) -> bool {
        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.backoff * 2u32.saturating_pow(attempt - 1)).await;
            }

            match self.post(key).await {
                Ok(THROTTLED_STATUS) => return true,
                Ok(status) if RETRY_STATUSES.contains(&status) => {
                    tracing::debug!(key, status, attempt, "Rate limit service returned retryable status");
                }
                Ok(_) => return false,
                Err(e) => {
                    tracing::debug!(key, attempt, error = %e, "Rate limit request failed");
                }
            }
        }
        false
    }
}

#[async_trait]
impl RateLimiter for HttpRateLimiter {
    async fn is_throttled(&self, key: &str) -> bool {
        if self.domain.is_empty() {
            return false;
        }

        match tokio::time::timeout(self.decision_ceiling, self.decide(key)).await {
            Ok(throttled) => throttled,
            Err(_) => {
                tracing::warn!(
                    key,
                    ceiling_ms = self.decision_ceiling.as_millis() as u64,
                    "Rate limit decision timed out, treating as not throttled"
                );
                false
            }
        }
    }

    async fn record_hit(&self, key: &str) {
        if self.domain.is_empty() {
            return;
        }
        if let Err(e) = self.post(key).await {
            tracing::debug!(key, error = %e, "Rate limit hit not recorded");
        }
    }
}

/// Build the limiter configured by `config`: HTTP when a domain is set,
/// otherwise a no-op.
pub fn from_config(config: &RateLimitConfig) -> DockhandResult<Arc<dyn RateLimiter>> {
    if config.is_enabled() {
        Ok(Arc::new(HttpRateLimiter::new(config)?))
    } else {
        Ok(Arc::new(NoopRateLimiter))
    }
}
