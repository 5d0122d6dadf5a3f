//! Shared fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use ipfeed::feed::{FeedError, FeedSource, FeedStream};
use ipfeed::models::{FeedType, RealtimeWatermark, SnapshotWatermark};
use std::collections::HashSet;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Gzip `lines` as a newline-delimited feed file
pub fn gzip_lines(lines: &[&str]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for line in lines {
        writeln!(encoder, "{line}").unwrap();
    }
    encoder.finish().unwrap()
}

pub fn stream_of(bytes: Vec<u8>) -> FeedStream {
    Box::new(Cursor::new(bytes))
}

pub fn snapshot_watermark(date: &str) -> SnapshotWatermark {
    let generated_at = Utc.with_ymd_and_hms(2024, 5, 1, 1, 0, 0).unwrap();
    SnapshotWatermark {
        location: format!("anonymous/{date}/feed.json.gz"),
        date: date.to_string(),
        generated_at,
        available_at: generated_at,
    }
}

pub fn realtime_watermark(at: DateTime<Utc>) -> RealtimeWatermark {
    RealtimeWatermark {
        date: at,
        location: format!("anonymous/realtime/{}.json.gz", at.format("%Y%m%d/%H%M")),
    }
}

/// Scripted feed provider that counts every call it receives.
pub struct FakeFeed {
    pub snapshot_info: Mutex<SnapshotWatermark>,
    pub snapshot_body: Mutex<Vec<u8>>,
    pub ipv6_info: Mutex<SnapshotWatermark>,
    pub ipv6_body: Mutex<Vec<u8>>,
    pub realtime_info: Mutex<RealtimeWatermark>,
    pub realtime_body: Mutex<Vec<u8>>,
    pub window_body: Mutex<Vec<u8>>,
    /// Windows whose download fails
    pub failing_windows: Mutex<HashSet<DateTime<Utc>>>,
    pub fail_snapshot_info: Mutex<bool>,
    pub requested_windows: Mutex<Vec<DateTime<Utc>>>,
    pub snapshot_downloads: AtomicUsize,
    pub ipv6_downloads: AtomicUsize,
    pub realtime_downloads: AtomicUsize,
}

impl FakeFeed {
    pub fn new(snapshot_date: &str, realtime_at: DateTime<Utc>) -> Self {
        Self {
            snapshot_info: Mutex::new(snapshot_watermark(snapshot_date)),
            snapshot_body: Mutex::new(gzip_lines(&[])),
            ipv6_info: Mutex::new(snapshot_watermark(snapshot_date)),
            ipv6_body: Mutex::new(gzip_lines(&[])),
            realtime_info: Mutex::new(realtime_watermark(realtime_at)),
            realtime_body: Mutex::new(gzip_lines(&[])),
            window_body: Mutex::new(gzip_lines(&[])),
            failing_windows: Mutex::new(HashSet::new()),
            fail_snapshot_info: Mutex::new(false),
            requested_windows: Mutex::new(Vec::new()),
            snapshot_downloads: AtomicUsize::new(0),
            ipv6_downloads: AtomicUsize::new(0),
            realtime_downloads: AtomicUsize::new(0),
        }
    }

    pub fn set_snapshot(&self, date: &str, lines: &[&str]) {
        *self.snapshot_info.lock().unwrap() = snapshot_watermark(date);
        *self.snapshot_body.lock().unwrap() = gzip_lines(lines);
    }

    pub fn set_ipv6_snapshot(&self, date: &str, lines: &[&str]) {
        *self.ipv6_info.lock().unwrap() = snapshot_watermark(date);
        *self.ipv6_body.lock().unwrap() = gzip_lines(lines);
    }

    pub fn set_realtime(&self, at: DateTime<Utc>, lines: &[&str]) {
        *self.realtime_info.lock().unwrap() = realtime_watermark(at);
        *self.realtime_body.lock().unwrap() = gzip_lines(lines);
    }

    pub fn set_window_lines(&self, lines: &[&str]) {
        *self.window_body.lock().unwrap() = gzip_lines(lines);
    }

    pub fn fail_window(&self, at: DateTime<Utc>) {
        self.failing_windows.lock().unwrap().insert(at);
    }

    pub fn windows(&self) -> Vec<DateTime<Utc>> {
        self.requested_windows.lock().unwrap().clone()
    }

    pub fn snapshot_downloads(&self) -> usize {
        self.snapshot_downloads.load(Ordering::SeqCst)
    }

    pub fn ipv6_downloads(&self) -> usize {
        self.ipv6_downloads.load(Ordering::SeqCst)
    }

    pub fn realtime_downloads(&self) -> usize {
        self.realtime_downloads.load(Ordering::SeqCst)
    }

    fn is_ipv6(feed: FeedType) -> bool {
        matches!(
            feed,
            FeedType::AnonymousIpv6 | FeedType::AnonymousResidentialIpv6
        )
    }
}

#[async_trait]
impl FeedSource for FakeFeed {
    async fn latest_snapshot_info(&self, feed: FeedType) -> Result<SnapshotWatermark, FeedError> {
        if Self::is_ipv6(feed) {
            return Ok(self.ipv6_info.lock().unwrap().clone());
        }
        if *self.fail_snapshot_info.lock().unwrap() {
            return Err(FeedError::Upstream {
                status: 503,
                message: "unavailable".to_string(),
            });
        }
        Ok(self.snapshot_info.lock().unwrap().clone())
    }

    async fn latest_snapshot(&self, feed: FeedType) -> Result<FeedStream, FeedError> {
        if Self::is_ipv6(feed) {
            self.ipv6_downloads.fetch_add(1, Ordering::SeqCst);
            return Ok(stream_of(self.ipv6_body.lock().unwrap().clone()));
        }
        self.snapshot_downloads.fetch_add(1, Ordering::SeqCst);
        Ok(stream_of(self.snapshot_body.lock().unwrap().clone()))
    }

    async fn latest_realtime_info(&self, _feed: FeedType) -> Result<RealtimeWatermark, FeedError> {
        Ok(self.realtime_info.lock().unwrap().clone())
    }

    async fn latest_realtime(&self, _feed: FeedType) -> Result<FeedStream, FeedError> {
        self.realtime_downloads.fetch_add(1, Ordering::SeqCst);
        Ok(stream_of(self.realtime_body.lock().unwrap().clone()))
    }

    async fn realtime_window(
        &self,
        _feed: FeedType,
        at: DateTime<Utc>,
    ) -> Result<FeedStream, FeedError> {
        self.requested_windows.lock().unwrap().push(at);
        if self.failing_windows.lock().unwrap().contains(&at) {
            return Err(FeedError::Upstream {
                status: 404,
                message: "file not found".to_string(),
            });
        }
        Ok(stream_of(self.window_body.lock().unwrap().clone()))
    }
}
