//! Courier tracking API client
//!
//! One HTTP GET per AWB, bounded by a per-call timeout. The client performs no
//! retries of its own: a failed call is a failed sync attempt, and the shipment
//! backoff policy decides when to try again.

pub mod payload;

pub use payload::{parse_envelope, TrackingRecord};

use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT},
    Client,
};
use std::time::{Duration, Instant};
use url::Url;

use crate::config::UpstreamConfig;
use crate::error::SyncError;
use crate::models::sanitize_awb;

/// A successful, validated tracking response
#[derive(Debug, Clone)]
pub struct FetchedTracking {
    pub record: TrackingRecord,
    /// Whole response body as received
    pub raw: serde_json::Value,
    pub response_time_ms: i64,
}

/// Source of tracking data for one AWB
#[async_trait]
pub trait TrackingApi: Send + Sync {
    async fn fetch(&self, awb: &str) -> Result<FetchedTracking, SyncError>;
}

/// reqwest-backed courier client
pub struct CourierClient {
    client: Client,
    base_url: Url,
    awb_param: String,
    timeout: Duration,
}

impl CourierClient {
    /// Create a client from the upstream configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is invalid, the API key is not a valid
    /// header value, or the HTTP client cannot be built.
    pub fn new(config: &UpstreamConfig) -> anyhow::Result<Self> {
        let base_url = Url::parse(&config.base_url)?;
        let timeout = Duration::from_secs(config.timeout_secs);

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("awbsync/{}", env!("CARGO_PKG_VERSION")))?,
        );
        if let Some(key) = &config.api_key {
            let mut value = HeaderValue::from_str(&format!("Bearer {key}"))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .timeout(timeout)
            .gzip(true)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url,
            awb_param: config.awb_param.clone(),
            timeout,
        })
    }

    /// Tracking URL for a sanitised AWB
    pub fn tracking_url(&self, awb: &str) -> Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut().append_pair(&self.awb_param, awb);
        url
    }

    fn transport_error(&self, err: reqwest::Error) -> SyncError {
        if err.is_timeout() {
            SyncError::UpstreamTimeout {
                timeout_secs: self.timeout.as_secs(),
            }
        } else {
            // Keep the query string out of logs
            SyncError::UpstreamTransport(err.without_url().to_string())
        }
    }
}

#[async_trait]
impl TrackingApi for CourierClient {
    async fn fetch(&self, awb: &str) -> Result<FetchedTracking, SyncError> {
        let awb = sanitize_awb(awb).ok_or_else(|| SyncError::InvalidAwb(awb.to_string()))?;
        let started = Instant::now();

        let response = self
            .client
            .get(self.tracking_url(&awb))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::UpstreamStatus {
                status: status.as_u16(),
            });
        }

        let raw: serde_json::Value = response.json().await.map_err(|e| {
            if e.is_decode() {
                SyncError::MalformedPayload(e.without_url().to_string())
            } else {
                self.transport_error(e)
            }
        })?;
        let response_time_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        let record = parse_envelope(&awb, &raw)?;
        tracing::debug!(
            awb = %awb,
            status_code = record.status_code.as_deref().unwrap_or("-"),
            response_time_ms,
            "tracking fetched"
        );

        Ok(FetchedTracking {
            record,
            raw,
            response_time_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base: &str) -> UpstreamConfig {
        UpstreamConfig {
            base_url: base.to_string(),
            api_key: None,
            awb_param: "awb".to_string(),
            timeout_secs: 5,
        }
    }

    #[test]
    fn test_tracking_url_encodes_param() {
        let client = CourierClient::new(&config("https://api.courier.example/v1/track?fmt=json")).unwrap();
        let url = client.tracking_url("AWB0001");
        assert_eq!(
            url.as_str(),
            "https://api.courier.example/v1/track?fmt=json&awb=AWB0001"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(CourierClient::new(&config("not a url")).is_err());
    }

    #[tokio::test]
    async fn test_invalid_awb_is_not_sent() {
        let client = CourierClient::new(&config("http://127.0.0.1:9/track")).unwrap();
        let err = client.fetch("--").await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidAwb(_)));
    }
}
