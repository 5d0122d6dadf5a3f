use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use reqwest::header::ACCEPT;
use reqwest::Response;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tokio_util::io::StreamReader;
use tracing::info;

use super::{FeedError, FeedSource, FeedStream};
use crate::models::{FeedInfoEnvelope, FeedType, RealtimeWatermark, SnapshotWatermark};

const TOKEN_HEADER: &str = "Token";

/// Error payload returned by the provider on non-success responses
#[derive(Debug, Deserialize)]
struct FeedErrorPayload {
    error: String,
}

/// HTTPS client for the upstream feed provider.
#[derive(Clone)]
pub struct FeedClient {
    http: reqwest::Client,
    base_url: String,
    version: String,
    token: String,
}

impl FeedClient {
    pub fn new(base_url: &str, version: &str, token: &str) -> Result<Self, FeedError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            version: version.to_string(),
            token: token.to_string(),
        })
    }

    fn feed_url(&self, feed: FeedType, path: &str) -> String {
        format!("{}/{}/{}{}", self.base_url, self.version, feed, path)
    }

    async fn send(&self, url: &str) -> Result<Response, FeedError> {
        let response = self
            .http
            .get(url)
            .header(TOKEN_HEADER, &self.token)
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<FeedErrorPayload>(&body)
            .map(|payload| payload.error)
            .unwrap_or_else(|_| format!("unexpected response body: {}", body.trim()));

        Err(FeedError::Upstream {
            status: status.as_u16(),
            message,
        })
    }

    async fn fetch_info<T: DeserializeOwned>(&self, url: &str) -> Result<T, FeedError> {
        let envelope: FeedInfoEnvelope<T> = self.send(url).await?.json().await?;
        Ok(envelope.json)
    }

    async fn fetch_stream(&self, url: &str) -> Result<FeedStream, FeedError> {
        let response = self.send(url).await?;
        let body = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::new(StreamReader::new(Box::pin(body))))
    }
}

/// Path of the realtime file for the window starting at `at`
fn realtime_window_path(at: DateTime<Utc>) -> String {
    format!("/realtime/{}.json.gz", at.format("%Y%m%d/%H%M"))
}

#[async_trait]
impl FeedSource for FeedClient {
    async fn latest_snapshot_info(&self, feed: FeedType) -> Result<SnapshotWatermark, FeedError> {
        let url = self.feed_url(feed, "/latest");
        info!(%url, "getting latest feed info");
        let watermark: SnapshotWatermark = self.fetch_info(&url).await?;
        info!(
            feed_type = %feed,
            date = %watermark.date,
            available_at = %watermark.available_at.to_rfc3339(),
            location = %watermark.location,
            "latest feed info"
        );
        Ok(watermark)
    }

    async fn latest_snapshot(&self, feed: FeedType) -> Result<FeedStream, FeedError> {
        let url = self.feed_url(feed, "/latest.json.gz");
        info!(%url, "getting latest feed");
        self.fetch_stream(&url).await
    }

    async fn latest_realtime_info(&self, feed: FeedType) -> Result<RealtimeWatermark, FeedError> {
        let url = self.feed_url(feed, "/realtime/latest");
        info!(%url, "getting latest realtime feed info");
        let watermark: RealtimeWatermark = self.fetch_info(&url).await?;
        info!(
            feed_type = %feed,
            date = %watermark.date.to_rfc3339(),
            location = %watermark.location,
            "latest realtime feed info"
        );
        Ok(watermark)
    }

    async fn latest_realtime(&self, feed: FeedType) -> Result<FeedStream, FeedError> {
        let url = self.feed_url(feed, "/realtime/latest.json.gz");
        info!(%url, "getting latest realtime feed");
        self.fetch_stream(&url).await
    }

    async fn realtime_window(
        &self,
        feed: FeedType,
        at: DateTime<Utc>,
    ) -> Result<FeedStream, FeedError> {
        let url = self.feed_url(feed, &realtime_window_path(at));
        info!(%url, "getting realtime feed");
        self.fetch_stream(&url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_feed_urls() {
        let client = FeedClient::new("https://feeds.example.com/", "v2", "token").unwrap();
        assert_eq!(
            client.feed_url(FeedType::Anonymous, "/latest"),
            "https://feeds.example.com/v2/anonymous/latest"
        );
        assert_eq!(
            client.feed_url(FeedType::AnonymousResidential, "/realtime/latest.json.gz"),
            "https://feeds.example.com/v2/anonymous-residential/realtime/latest.json.gz"
        );
    }

    #[test]
    fn test_realtime_window_path() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 0).unwrap();
        assert_eq!(realtime_window_path(at), "/realtime/20240309/0705.json.gz");
    }

    #[test]
    fn test_error_payload_decoding() {
        let payload: FeedErrorPayload =
            serde_json::from_str(r#"{"error":"invalid token"}"#).unwrap();
        assert_eq!(payload.error, "invalid token");
    }
}
