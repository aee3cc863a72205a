//! Metering delivery with retry and error classification.
//!
//! One payload is serialized once and POSTed up to `max_attempts` times with
//! exponential backoff between attempts. Retries resend the same bytes, so
//! the transaction id never changes across attempts.
//!
//! - 2xx        -> delivered
//! - 4xx        -> `Error::Validation`, returned immediately
//! - 5xx, other -> `Error::Metering`, retried
//! - transport  -> `Error::Network`, retried (including per-attempt timeouts)

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::payload::{CallKind, MeteringPayload};
use crate::util::build_http_client;

/// Retry schedule for a single payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Sleep before the second attempt.
    pub initial_backoff: Duration,
    pub backoff_multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            backoff_multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Sleep before attempt `attempt` (1-based). Zero for the first attempt.
    pub fn backoff_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = self.backoff_multiplier.saturating_pow(attempt - 2);
        self.initial_backoff.saturating_mul(factor)
    }
}

/// Result of a successful delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub attempts: u32,
    pub transaction_id: Option<String>,
}

/// POSTs payloads to the metering API.
#[derive(Clone)]
pub struct MeteringDelivery {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    policy: RetryPolicy,
}

impl std::fmt::Debug for MeteringDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeteringDelivery")
            .field("base_url", &self.base_url)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl MeteringDelivery {
    pub fn new(config: &Config) -> Result<Self> {
        let http = build_http_client(config.request_timeout).map_err(|e| Error::Config {
            message: "failed to build metering HTTP client".into(),
            source: Some(Box::new(e)),
        })?;
        Ok(Self {
            http,
            base_url: config.revenium_base_url.clone(),
            api_key: config.revenium_api_key.clone(),
            policy: RetryPolicy::default(),
        })
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn endpoint_url(&self, kind: CallKind) -> String {
        format!("{}{}", self.base_url, kind.endpoint_path())
    }

    /// Deliver one payload, retrying transient failures.
    pub async fn deliver(&self, kind: CallKind, payload: &MeteringPayload) -> Result<DeliveryReport> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| Error::metering_with_source("failed to serialize metering payload", e))?;
        let url = self.endpoint_url(kind);
        let transaction_id = payload.transaction_id().map(str::to_string);
        let max_attempts = self.policy.max_attempts.max(1);

        tracing::debug!(
            %kind,
            url = %url,
            transaction_id = transaction_id.as_deref().unwrap_or(""),
            bytes = body.len(),
            "sending metering payload"
        );

        let mut last_error = None;
        for attempt in 1..=max_attempts {
            let backoff = self.policy.backoff_before(attempt);
            if !backoff.is_zero() {
                tokio::time::sleep(backoff).await;
            }

            match self.send_once(&url, &body).await {
                Ok(()) => {
                    tracing::debug!(%kind, attempt, "metering payload accepted");
                    return Ok(DeliveryReport {
                        attempts: attempt,
                        transaction_id,
                    });
                }
                Err(e) if e.is_validation() => {
                    tracing::warn!(%kind, attempt, error = %e, "metering payload rejected");
                    return Err(e);
                }
                Err(e) => {
                    tracing::debug!(
                        %kind,
                        attempt,
                        max_attempts,
                        error = %e,
                        "metering attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        let message = format!("metering failed after {max_attempts} attempts");
        Err(match last_error {
            Some(last) => Error::metering_with_source(message, last),
            None => Error::metering(message),
        })
    }

    async fn send_once(&self, url: &str, body: &[u8]) -> Result<()> {
        let response = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/json; charset=utf-8")
            .header("x-api-key", &self.api_key)
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::network("metering request timed out", e)
                } else {
                    Error::network("metering request failed", e)
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let detail = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        if status.is_client_error() {
            return Err(Error::validation(format!(
                "metering API rejected payload ({}): {}",
                status, detail
            )));
        }
        Err(Error::metering(format!(
            "metering API returned {}: {}",
            status, detail
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_before(1), Duration::ZERO);
        assert_eq!(policy.backoff_before(2), Duration::from_millis(100));
        assert_eq!(policy.backoff_before(3), Duration::from_millis(200));
        assert_eq!(policy.backoff_before(4), Duration::from_millis(400));
    }

    #[test]
    fn endpoint_urls() {
        let config = Config::builder()
            .revenium_api_key("hak_test")
            .revenium_base_url("https://meter.example.com/meter/v2/")
            .build()
            .unwrap();
        let delivery = MeteringDelivery::new(&config).unwrap();
        assert_eq!(
            delivery.endpoint_url(CallKind::Chat),
            "https://meter.example.com/meter/v2/ai/completions"
        );
        assert_eq!(
            delivery.endpoint_url(CallKind::Image),
            "https://meter.example.com/meter/v2/ai/images"
        );
        assert_eq!(
            delivery.endpoint_url(CallKind::Video),
            "https://meter.example.com/meter/v2/ai/video"
        );
        assert!(!format!("{delivery:?}").contains("hak_test"));
    }

    #[tokio::test]
    async fn unreachable_backend_exhausts_attempts() {
        let config = Config::builder()
            .revenium_api_key("hak_test")
            // Port 9 (discard) on localhost is not expected to accept connections.
            .revenium_base_url("http://127.0.0.1:9")
            .request_timeout(Duration::from_millis(500))
            .build()
            .unwrap();
        let delivery = MeteringDelivery::new(&config).unwrap().with_policy(RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            backoff_multiplier: 2,
        });
        let mut map = serde_json::Map::new();
        map.insert("transactionId".into(), serde_json::json!("t-1"));
        let payload = MeteringPayload::from(map);
        let err = delivery.deliver(CallKind::Chat, &payload).await.unwrap_err();
        assert!(matches!(err, Error::Metering { .. }));
        assert!(err.to_string().contains("after 2 attempts"));
    }
}
