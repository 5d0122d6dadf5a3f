//! Immutable longest-prefix index over IPv6 network records
//!
//! Every full snapshot is compiled into a fresh MMDB buffer and published
//! with a single pointer swap. Readers take the published index once per
//! lookup and never see a half-built one.

pub mod writer;

pub use writer::{MmdbWriter, WriterError};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use maxminddb::{MaxMindDbError, Reader};
use std::io::Read;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::Mutex;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::feed::{decode_lines, DecodeError};
use crate::models::IPContextV6;

const DATABASE_TYPE: &str = "ipfeed-context-v6";

#[derive(Debug, Error)]
pub enum RangeStoreError {
    #[error("failed to decode snapshot: {0}")]
    Decode(#[from] DecodeError),
    #[error("failed to build index: {0}")]
    Write(#[from] WriterError),
    #[error("failed to open built index: {0}")]
    Open(#[source] MaxMindDbError),
    #[error("lookup failed: {0}")]
    Lookup(#[source] MaxMindDbError),
    #[error("build cancelled")]
    Cancelled,
    #[error("build task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeStoreState {
    /// Nothing has been published yet
    Empty,
    /// A build is running; lookups use the previous index, if any
    Building,
    Ready,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSummary {
    pub lines: u64,
    pub networks: u64,
    /// Lines that were not a record or had no usable network
    pub skipped: u64,
}

/// One published, read-only index.
pub struct RangeIndex {
    reader: Reader<Vec<u8>>,
    built_at: DateTime<Utc>,
    networks: u64,
}

impl RangeIndex {
    pub fn lookup(&self, ip: IpAddr) -> Result<Option<IPContextV6>, RangeStoreError> {
        self.reader
            .lookup(ip)
            .map_err(RangeStoreError::Lookup)?
            .decode::<IPContextV6>()
            .map_err(RangeStoreError::Lookup)
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn networks(&self) -> u64 {
        self.networks
    }
}

pub struct RangeStore {
    current: ArcSwapOption<RangeIndex>,
    build_lock: Mutex<()>,
    building: AtomicBool,
}

impl Default for RangeStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Clears the building flag even when the build future is dropped
struct BuildingFlag<'a>(&'a AtomicBool);

impl Drop for BuildingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RangeStore {
    pub fn new() -> Self {
        Self {
            current: ArcSwapOption::empty(),
            build_lock: Mutex::new(()),
            building: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> RangeStoreState {
        if self.building.load(Ordering::Acquire) {
            RangeStoreState::Building
        } else if self.current.load().is_some() {
            RangeStoreState::Ready
        } else {
            RangeStoreState::Empty
        }
    }

    /// The currently published index, kept alive for as long as the caller holds it
    pub fn snapshot(&self) -> Option<Arc<RangeIndex>> {
        self.current.load_full()
    }

    /// Longest-prefix lookup against the published index.
    ///
    /// `Ok(None)` when no index is published or no network contains `ip`.
    pub fn lookup(&self, ip: IpAddr) -> Result<Option<IPContextV6>, RangeStoreError> {
        match self.current.load_full() {
            Some(index) => index.lookup(ip),
            None => Ok(None),
        }
    }

    /// Build a new index from a full snapshot and publish it.
    ///
    /// Builds run one at a time. On any failure, cancellation included, the
    /// previously published index stays live.
    pub async fn build_snapshot<R>(
        &self,
        stream: R,
        cancel: &CancellationToken,
    ) -> Result<BuildSummary, RangeStoreError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let _build = self.build_lock.lock().await;
        self.building.store(true, Ordering::Release);
        let _flag = BuildingFlag(&self.building);

        let reader = SyncIoBridge::new(stream);
        let cancel = cancel.clone();
        let built_at = Utc::now();
        let (index, summary) =
            tokio::task::spawn_blocking(move || build_index(reader, &cancel, built_at)).await??;

        self.current.store(Some(Arc::new(index)));
        info!(
            networks = summary.networks,
            skipped = summary.skipped,
            "published new range index"
        );
        Ok(summary)
    }
}

/// Parse a CIDR, accepting a bare address as a single-host network
fn parse_network(raw: &str) -> Option<IpNet> {
    let raw = raw.trim();
    raw.parse::<IpNet>()
        .ok()
        .or_else(|| raw.parse::<IpAddr>().ok().map(IpNet::from))
}

fn build_index<R: Read>(
    reader: R,
    cancel: &CancellationToken,
    built_at: DateTime<Utc>,
) -> Result<(RangeIndex, BuildSummary), RangeStoreError> {
    let mut writer = MmdbWriter::new(DATABASE_TYPE, "IP context by network");
    let mut summary = BuildSummary::default();

    for line in decode_lines(reader) {
        if cancel.is_cancelled() {
            return Err(RangeStoreError::Cancelled);
        }
        let line = line?;
        summary.lines += 1;

        let record: IPContextV6 = match serde_json::from_slice(&line) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "skipping malformed network record");
                summary.skipped += 1;
                continue;
            }
        };
        let Some(network) = parse_network(&record.network) else {
            warn!(network = %record.network, "skipping record with invalid network");
            summary.skipped += 1;
            continue;
        };

        if let Err(e) = writer.insert(network, &record) {
            warn!(network = %record.network, error = %e, "skipping record that cannot be indexed");
            summary.skipped += 1;
            continue;
        }
        summary.networks += 1;
    }

    let epoch = u64::try_from(built_at.timestamp()).unwrap_or_default();
    let reader = Reader::from_source(writer.into_bytes(epoch)?).map_err(RangeStoreError::Open)?;

    Ok((
        RangeIndex {
            reader,
            built_at,
            networks: summary.networks,
        },
        summary,
    ))
}
