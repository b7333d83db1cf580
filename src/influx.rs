use anyhow::{bail, Context};
use async_trait::async_trait;
use tracing::info;

use crate::config::Config;
use crate::point::DataPoint;

/// One write per publish cycle. Implemented against a trait so the scheduler
/// can be exercised without a live store.
#[async_trait]
pub trait PointWriter: Send {
    async fn publish(&mut self, point: &DataPoint) -> anyhow::Result<()>;
}

/// InfluxDB v2 client: serializes a point into line protocol and performs a
/// single authenticated write. No internal retry; a failed write is dropped
/// and the diagnostic surfaces to the caller.
pub struct InfluxWriter {
    base_url: String,
    org: String,
    bucket: String,
    token: String,
    client: reqwest::Client,
}

impl InfluxWriter {
    pub fn new(config: &Config) -> Self {
        Self::with_target(
            &config.influx_url,
            &config.influx_org,
            &config.influx_bucket,
            &config.influx_token,
        )
    }

    pub fn with_target(base_url: &str, org: &str, bucket: &str, token: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            org: org.to_string(),
            bucket: bucket.to_string(),
            token: token.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Startup health check against the store's ping endpoint. Failure is
    /// reported, not fatal; the loop starts either way.
    pub async fn validate_connection(&self) -> bool {
        let response = self
            .client
            .get(format!("{}/ping", self.base_url))
            .send()
            .await;
        matches!(response, Ok(r) if r.status().is_success())
    }

    pub fn server_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl PointWriter for InfluxWriter {
    async fn publish(&mut self, point: &DataPoint) -> anyhow::Result<()> {
        let line = point.to_line_protocol();
        // Intentional observability aid: the outbound payload is always
        // logged before the write attempt.
        info!("Writing: {line}");

        let response = self
            .client
            .post(format!("{}/api/v2/write", self.base_url))
            .query(&[("org", &self.org), ("bucket", &self.bucket)])
            .bearer_auth(&self.token)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(line)
            .send()
            .await
            .context("write request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("server rejected write: {status} {}", body.trim());
        }
        Ok(())
    }
}
