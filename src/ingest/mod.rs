//! Concurrent ingestion of decoded feed lines into the key-value store
//!
//! A blocking decoder thread fills a bounded queue that a fixed pool of
//! workers drains. Workers write in chunks through [`KvStore::batch_exec`].
//!
//! The queue is not partitioned by key, so two workers in the same merge run
//! may hold records for the same key. Each merges against whatever it read,
//! and the final value depends on how their reads and writes interleave: a
//! worker that reads after the other's write folds both updates in, one that
//! reads before it overwrites that update with its own.

mod worker;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::feed::{spawn_line_producer, DecodeError};
use crate::storage::{KvStore, StoreError};

/// How decoded records reach the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Store every raw line as-is, replacing whatever the key held
    Overwrite,
    /// Combine every record with the stored value before writing it back
    Merge,
}

#[derive(Debug, Clone)]
pub struct WriterSettings {
    pub workers: usize,
    pub chunk_size: usize,
    /// Expiry applied to every written key
    pub ttl: Duration,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            chunk_size: 5000,
            ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Result of an ingest run that had no hard failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub written: u64,
    /// The run stopped early on cancellation; `written` is partial
    pub cancelled: bool,
}

#[derive(Debug)]
pub struct WorkerFailure {
    pub worker_id: usize,
    /// Records the worker had written before it stopped
    pub written: u64,
    pub error: StoreError,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(
        "{} worker(s) failed after {written} records were written: {}",
        .failures.len(),
        .failures.first().map(|f| f.error.to_string()).unwrap_or_default()
    )]
    Workers {
        written: u64,
        failures: Vec<WorkerFailure>,
    },
    #[error("feed decoding failed after {written} records were written: {source}")]
    Decode {
        written: u64,
        #[source]
        source: DecodeError,
    },
}

impl IngestError {
    /// Records written before the run failed
    pub fn written(&self) -> u64 {
        match self {
            IngestError::Workers { written, .. } | IngestError::Decode { written, .. } => *written,
        }
    }
}

pub(crate) type SharedQueue = Arc<Mutex<mpsc::Receiver<Vec<u8>>>>;

pub struct BatchWriter {
    store: Arc<dyn KvStore>,
    settings: WriterSettings,
}

impl BatchWriter {
    pub fn new(store: Arc<dyn KvStore>, settings: WriterSettings) -> Self {
        let settings = WriterSettings {
            workers: settings.workers.max(1),
            chunk_size: settings.chunk_size.max(1),
            ttl: settings.ttl,
        };
        Self { store, settings }
    }

    pub fn settings(&self) -> &WriterSettings {
        &self.settings
    }

    /// Decode `stream` and write every record in `mode`.
    ///
    /// Malformed lines are skipped. A worker that hits a store failure stops
    /// on its own; the others keep draining the queue. Chunks that were
    /// already flushed stay written.
    pub async fn ingest<R>(
        &self,
        stream: R,
        mode: WriteMode,
        cancel: &CancellationToken,
    ) -> Result<IngestOutcome, IngestError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let capacity = self.settings.workers * self.settings.chunk_size;
        let (tx, rx) = mpsc::channel(capacity);
        let producer = spawn_line_producer(stream, tx, cancel.clone());
        let queue: SharedQueue = Arc::new(Mutex::new(rx));

        let handles: Vec<_> = (0..self.settings.workers)
            .map(|worker_id| {
                let queue = Arc::clone(&queue);
                let store = Arc::clone(&self.store);
                let settings = self.settings.clone();
                tokio::spawn(async move {
                    match mode {
                        WriteMode::Overwrite => {
                            worker::overwrite(worker_id, queue, store, settings).await
                        }
                        WriteMode::Merge => worker::merge(worker_id, queue, store, settings).await,
                    }
                })
            })
            .collect();
        // Only workers may keep the receiver alive, so the producer stops
        // once all of them are gone.
        drop(queue);

        let mut written = 0u64;
        let mut failures = Vec::new();
        for (worker_id, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(Ok(count)) => written += count,
                Ok(Err(abort)) => {
                    error!(worker_id, written = abort.written, error = %abort.error, "ingest worker failed");
                    written += abort.written;
                    failures.push(WorkerFailure {
                        worker_id,
                        written: abort.written,
                        error: abort.error,
                    });
                }
                Err(join_error) => {
                    error!(worker_id, error = %join_error, "ingest worker panicked");
                    failures.push(WorkerFailure {
                        worker_id,
                        written: 0,
                        error: StoreError::Other(anyhow::anyhow!("worker task failed: {join_error}")),
                    });
                }
            }
        }

        let summary = match producer.await {
            Ok(result) => result,
            Err(join_error) => Err(DecodeError::Io(std::io::Error::other(join_error))),
        };

        if !failures.is_empty() {
            return Err(IngestError::Workers { written, failures });
        }

        let summary = summary.map_err(|source| IngestError::Decode { written, source })?;
        info!(
            mode = ?mode,
            lines = summary.lines,
            written,
            cancelled = summary.cancelled,
            "ingest finished"
        );

        Ok(IngestOutcome {
            written,
            cancelled: summary.cancelled,
        })
    }
}
