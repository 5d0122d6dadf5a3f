//! Polling control loop that keeps the stores in step with the feed
//!
//! The outer state machine is [`Scheduler::tick`]; backfilling missed
//! realtime files is driven by [`CatchUpPlan`].

pub mod catchup;

pub use catchup::{CatchUpPlan, CatchUpReport, REALTIME_WINDOW_MINUTES};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::feed::{FeedError, FeedSource};
use crate::ingest::{BatchWriter, IngestError, WriteMode};
use crate::models::{FeedType, RealtimeWatermark, SnapshotWatermark};
use crate::rangestore::{BuildSummary, RangeStore, RangeStoreError};
use crate::storage::{StoreError, WatermarkStore};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("feed request failed: {0}")]
    Feed(#[from] FeedError),
    #[error("ingest failed: {0}")]
    Ingest(#[from] IngestError),
    #[error("range store build failed: {0}")]
    RangeStore(#[from] RangeStoreError),
    #[error("watermark storage failed: {0}")]
    Store(#[from] StoreError),
    #[error("invalid watermark: {0}")]
    InvalidWatermark(String),
    #[error("sync cancelled")]
    Cancelled,
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing changed upstream
    Idle,
    /// A new full snapshot was ingested; `catch_up` is set when the
    /// realtime backfill that follows it succeeded
    SnapshotSynced {
        written: u64,
        catch_up: Option<CatchUpReport>,
    },
    /// The latest realtime delta was merged
    RealtimeSynced { written: u64 },
    /// A realtime backfill that failed earlier was retried and completed
    CatchUpResumed(CatchUpReport),
}

/// Last watermarks known to have been fully ingested.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
    pub snapshot: Option<SnapshotWatermark>,
    pub realtime: Option<RealtimeWatermark>,
    /// Only kept in memory; the range store is rebuilt on every start
    pub ipv6_snapshot: Option<SnapshotWatermark>,
    /// Snapshot date whose realtime backfill has not completed yet
    pub pending_catch_up: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub feed_type: FeedType,
    pub realtime_enabled: bool,
    pub ipv6_enabled: bool,
    pub poll_interval: Duration,
}

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct Scheduler {
    feed: Arc<dyn FeedSource>,
    writer: Arc<BatchWriter>,
    range_store: Option<Arc<RangeStore>>,
    watermarks: WatermarkStore,
    settings: SchedulerSettings,
    clock: Clock,
    state: SyncState,
}

impl Scheduler {
    pub fn new(
        feed: Arc<dyn FeedSource>,
        writer: Arc<BatchWriter>,
        watermarks: WatermarkStore,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            feed,
            writer,
            range_store: None,
            watermarks,
            settings,
            clock: Arc::new(Utc::now),
            state: SyncState::default(),
        }
    }

    /// Rebuild `range_store` from the IPv6 companion feed when IPv6 sync is on
    pub fn with_range_store(mut self, range_store: Arc<RangeStore>) -> Self {
        self.range_store = Some(range_store);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    /// Restore persisted watermarks and seed the stores when nothing was
    /// ingested before.
    ///
    /// Failing to fetch or ingest the first snapshot is fatal; a failed
    /// realtime backfill or IPv6 build is logged and retried by later ticks.
    pub async fn bootstrap(&mut self, cancel: &CancellationToken) -> Result<(), SyncError> {
        info!(feed_type = %self.settings.feed_type, "bootstrapping sync state");

        self.state.snapshot = self.watermarks.load_snapshot().await.unwrap_or_else(|e| {
            warn!(error = %e, "could not read stored snapshot watermark");
            None
        });
        self.state.realtime = self.watermarks.load_realtime().await.unwrap_or_else(|e| {
            warn!(error = %e, "could not read stored realtime watermark");
            None
        });

        let seeded = self
            .state
            .snapshot
            .as_ref()
            .is_some_and(|watermark| !watermark.date.is_empty());
        if !seeded {
            info!("no initial data found, downloading latest snapshot");
            let latest = self
                .feed
                .latest_snapshot_info(self.settings.feed_type)
                .await?;
            let date = latest.date.clone();
            self.sync_snapshot(latest, cancel).await?;

            if self.settings.realtime_enabled {
                self.backfill(date, cancel).await?;
            }
        }

        match self.sync_ipv6(cancel).await {
            Ok(_) => Ok(()),
            Err(SyncError::Cancelled) => Err(SyncError::Cancelled),
            Err(e) => {
                error!(error = %e, "initial IPv6 sync failed");
                Ok(())
            }
        }
    }

    /// One polling step.
    pub async fn tick(&mut self, cancel: &CancellationToken) -> Result<TickOutcome, SyncError> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        match self.sync_ipv6(cancel).await {
            Ok(_) => {}
            Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
            Err(e) => error!(error = %e, "IPv6 sync failed"),
        }

        let feed_type = self.settings.feed_type;
        debug!(%feed_type, "checking for new snapshot");
        let latest = self.feed.latest_snapshot_info(feed_type).await?;
        if self.state.snapshot.as_ref() != Some(&latest) {
            let date = latest.date.clone();
            let written = self.sync_snapshot(latest, cancel).await?;

            // The backfill also covers the latest realtime file
            let catch_up = if self.settings.realtime_enabled {
                self.backfill(date, cancel).await?
            } else {
                None
            };
            return Ok(TickOutcome::SnapshotSynced { written, catch_up });
        }

        if !self.settings.realtime_enabled {
            return Ok(TickOutcome::Idle);
        }

        // Merging only the latest file would leave the missed windows out
        if let Some(date) = self.state.pending_catch_up.clone() {
            info!(date = %date, "retrying interrupted realtime catch-up");
            let report = self.catch_up(&date, cancel).await?;
            self.state.pending_catch_up = None;
            return Ok(TickOutcome::CatchUpResumed(report));
        }

        debug!(%feed_type, "checking for new realtime data");
        let latest = self.feed.latest_realtime_info(feed_type).await?;
        if self.state.realtime.as_ref() == Some(&latest) {
            return Ok(TickOutcome::Idle);
        }

        info!(date = %latest.date.to_rfc3339(), "new realtime data found");
        let stream = self.feed.latest_realtime(feed_type).await?;
        let outcome = self.writer.ingest(stream, WriteMode::Merge, cancel).await?;
        if outcome.cancelled {
            return Err(SyncError::Cancelled);
        }

        self.watermarks.save_realtime(&latest).await?;
        self.state.realtime = Some(latest);
        info!(count = outcome.written, "realtime data merged");

        Ok(TickOutcome::RealtimeSynced {
            written: outcome.written,
        })
    }

    /// Bootstrap, then tick every poll interval until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), SyncError> {
        match self.bootstrap(&cancel).await {
            Err(SyncError::Cancelled) => {
                info!("scheduler cancelled during bootstrap");
                return Ok(());
            }
            other => other?,
        }

        let period = self.settings.poll_interval.max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("scheduler stopping");
                    return Ok(());
                }
                _ = interval.tick() => {
                    match self.tick(&cancel).await {
                        Ok(outcome) => debug!(?outcome, "tick finished"),
                        Err(SyncError::Cancelled) => {
                            info!("scheduler stopping");
                            return Ok(());
                        }
                        Err(e) => error!(error = %e, "sync tick failed"),
                    }
                }
            }
        }
    }

    /// Replay every realtime window from the snapshot day until now.
    ///
    /// Stops at the first failing window and leaves the realtime watermark
    /// untouched. On success the watermark moves to the provider's latest.
    pub async fn catch_up(
        &mut self,
        snapshot_date: &str,
        cancel: &CancellationToken,
    ) -> Result<CatchUpReport, SyncError> {
        let feed_type = self.settings.feed_type;
        let plan = CatchUpPlan::new(snapshot_date, (self.clock)())?;
        let mut report = CatchUpReport::default();

        for window in plan {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            debug!(window = %window.to_rfc3339(), "processing realtime window");

            let written = match self.ingest_window(feed_type, window, cancel).await {
                Ok(written) => written,
                Err(e) => {
                    error!(
                        window = %window.to_rfc3339(),
                        completed = report.windows,
                        error = %e,
                        "aborting realtime catch-up"
                    );
                    return Err(e);
                }
            };
            report.windows += 1;
            report.records += written;
        }

        match self.feed.latest_realtime_info(feed_type).await {
            Ok(latest) => match self.watermarks.save_realtime(&latest).await {
                Ok(()) => self.state.realtime = Some(latest),
                Err(e) => warn!(error = %e, "could not store realtime watermark after catch-up"),
            },
            Err(e) => warn!(error = %e, "could not refresh realtime watermark after catch-up"),
        }

        info!(
            windows = report.windows,
            count = report.records,
            "reprocessed historical realtime data"
        );
        Ok(report)
    }

    /// Catch up after ingesting the snapshot of `date`.
    ///
    /// A failure is logged and leaves the date pending, so later ticks retry
    /// the backfill from the same starting point.
    async fn backfill(
        &mut self,
        date: String,
        cancel: &CancellationToken,
    ) -> Result<Option<CatchUpReport>, SyncError> {
        self.state.pending_catch_up = Some(date.clone());
        match self.catch_up(&date, cancel).await {
            Ok(report) => {
                self.state.pending_catch_up = None;
                Ok(Some(report))
            }
            Err(SyncError::Cancelled) => Err(SyncError::Cancelled),
            Err(e) => {
                error!(date = %date, error = %e, "realtime catch-up failed, will retry");
                Ok(None)
            }
        }
    }

    async fn ingest_window(
        &self,
        feed_type: FeedType,
        window: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<u64, SyncError> {
        let stream = self.feed.realtime_window(feed_type, window).await?;
        let outcome = self.writer.ingest(stream, WriteMode::Merge, cancel).await?;
        if outcome.cancelled {
            return Err(SyncError::Cancelled);
        }
        Ok(outcome.written)
    }

    /// Overwrite-ingest the snapshot described by `latest`, then persist it.
    async fn sync_snapshot(
        &mut self,
        latest: SnapshotWatermark,
        cancel: &CancellationToken,
    ) -> Result<u64, SyncError> {
        info!(date = %latest.date, "downloading snapshot");
        let stream = self.feed.latest_snapshot(self.settings.feed_type).await?;
        let outcome = self
            .writer
            .ingest(stream, WriteMode::Overwrite, cancel)
            .await?;
        if outcome.cancelled {
            return Err(SyncError::Cancelled);
        }

        self.watermarks.save_snapshot(&latest).await?;
        info!(count = outcome.written, date = %latest.date, "snapshot ingested");
        self.state.snapshot = Some(latest);
        Ok(outcome.written)
    }

    /// Rebuild the range store when the IPv6 companion snapshot changed.
    ///
    /// Returns `Ok(None)` when IPv6 sync is off or nothing changed.
    async fn sync_ipv6(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<BuildSummary>, SyncError> {
        if !self.settings.ipv6_enabled {
            return Ok(None);
        }
        let Some(range_store) = self.range_store.clone() else {
            return Ok(None);
        };
        let feed_type = self
            .settings
            .feed_type
            .ipv6_companion()
            .ok_or(FeedError::NoIpv6Feed(self.settings.feed_type))?;

        let latest = self.feed.latest_snapshot_info(feed_type).await?;
        if self.state.ipv6_snapshot.as_ref() == Some(&latest) {
            return Ok(None);
        }

        info!(%feed_type, date = %latest.date, "building IPv6 range index");
        let stream = self.feed.latest_snapshot(feed_type).await?;
        let summary = match range_store.build_snapshot(stream, cancel).await {
            Ok(summary) => summary,
            Err(RangeStoreError::Cancelled) => return Err(SyncError::Cancelled),
            Err(e) => return Err(e.into()),
        };

        self.state.ipv6_snapshot = Some(latest);
        Ok(Some(summary))
    }
}
