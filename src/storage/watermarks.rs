use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use crate::models::{RealtimeWatermark, SnapshotWatermark};
use crate::storage::{KvStore, StoreResult};

const SNAPSHOT_KEY: &str = "feed_info";
const REALTIME_KEY: &str = "realtime_feed_info";

/// Persists sync watermarks next to the records so a restart can resume.
#[derive(Clone)]
pub struct WatermarkStore {
    store: Arc<dyn KvStore>,
}

impl WatermarkStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn load_snapshot(&self) -> StoreResult<Option<SnapshotWatermark>> {
        self.load(SNAPSHOT_KEY).await
    }

    pub async fn save_snapshot(&self, watermark: &SnapshotWatermark) -> StoreResult<()> {
        self.save(SNAPSHOT_KEY, watermark).await
    }

    pub async fn load_realtime(&self) -> StoreResult<Option<RealtimeWatermark>> {
        self.load(REALTIME_KEY).await
    }

    pub async fn save_realtime(&self, watermark: &RealtimeWatermark) -> StoreResult<()> {
        self.save(REALTIME_KEY, watermark).await
    }

    async fn load<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.store.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    // Watermarks never expire
    async fn save<T: Serialize>(&self, key: &str, watermark: &T) -> StoreResult<()> {
        let raw = serde_json::to_string(watermark)?;
        self.store.set(key, &raw, None).await
    }
}
