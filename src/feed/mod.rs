//! Upstream threat-intelligence feed access
//!
//! [`FeedSource`] is the seam between the sync scheduler and the provider;
//! [`FeedClient`] implements it over HTTPS.

pub mod client;
pub mod decoder;

pub use client::FeedClient;
pub use decoder::{decode_lines, spawn_line_producer, DecodeError, DecodeSummary, LineDecoder};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::models::{FeedType, RealtimeWatermark, SnapshotWatermark};

/// Raw (still compressed) body of a feed file
pub type FeedStream = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("feed provider returned {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("no IPv6 feed exists for feed type {0}")]
    NoIpv6Feed(FeedType),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Metadata of the latest full snapshot
    async fn latest_snapshot_info(&self, feed: FeedType) -> Result<SnapshotWatermark, FeedError>;

    /// Body of the latest full snapshot
    async fn latest_snapshot(&self, feed: FeedType) -> Result<FeedStream, FeedError>;

    /// Metadata of the latest realtime file
    async fn latest_realtime_info(&self, feed: FeedType) -> Result<RealtimeWatermark, FeedError>;

    /// Body of the latest realtime file
    async fn latest_realtime(&self, feed: FeedType) -> Result<FeedStream, FeedError>;

    /// Body of the realtime file covering the 5-minute window starting at `at`
    async fn realtime_window(
        &self,
        feed: FeedType,
        at: DateTime<Utc>,
    ) -> Result<FeedStream, FeedError>;
}
