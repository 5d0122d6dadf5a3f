use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{SharedQueue, WriterSettings};
use crate::merge::merge as merge_records;
use crate::models::IPContext;
use crate::storage::{KvStore, SetOp, StoreError};

/// Why a worker stopped early, with what it managed to write first.
#[derive(Debug)]
pub(super) struct WorkerAbort {
    pub written: u64,
    pub error: StoreError,
}

async fn next_line(queue: &SharedQueue) -> Option<Vec<u8>> {
    queue.lock().await.recv().await
}

/// Parse a raw line, returning its text and record; `None` for malformed lines
fn parse_record(worker_id: usize, line: Vec<u8>) -> Option<(String, IPContext)> {
    let raw = match String::from_utf8(line) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(worker_id, error = %e, "skipping line that is not valid UTF-8");
            return None;
        }
    };

    let record: IPContext = match serde_json::from_str(&raw) {
        Ok(record) => record,
        Err(e) => {
            warn!(worker_id, error = %e, "skipping malformed record");
            return None;
        }
    };

    if record.ip.is_empty() {
        warn!(worker_id, "skipping record without an ip");
        return None;
    }

    Some((raw, record))
}

/// Flush one chunk, adding every applied operation to `written`.
///
/// All per-operation results are counted before the first failure is
/// returned.
async fn flush(store: &dyn KvStore, ops: Vec<SetOp>, written: &mut u64) -> Result<(), StoreError> {
    if ops.is_empty() {
        return Ok(());
    }

    let mut first_error = None;
    for result in store.batch_exec(ops).await? {
        match result {
            Ok(()) => *written += 1,
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

pub(super) async fn overwrite(
    worker_id: usize,
    queue: SharedQueue,
    store: Arc<dyn KvStore>,
    settings: WriterSettings,
) -> Result<u64, WorkerAbort> {
    let mut written = 0u64;
    let mut chunk = Vec::with_capacity(settings.chunk_size);

    while let Some(line) = next_line(&queue).await {
        let Some((raw, record)) = parse_record(worker_id, line) else {
            continue;
        };
        chunk.push(SetOp::new(record.ip, raw, Some(settings.ttl)));

        if chunk.len() >= settings.chunk_size {
            let ops = std::mem::replace(&mut chunk, Vec::with_capacity(settings.chunk_size));
            if let Err(error) = flush(store.as_ref(), ops, &mut written).await {
                return Err(WorkerAbort { written, error });
            }
            debug!(worker_id, count = written, "flushed chunk");
        }
    }

    if let Err(error) = flush(store.as_ref(), chunk, &mut written).await {
        return Err(WorkerAbort { written, error });
    }

    debug!(worker_id, count = written, "overwrite worker finished");
    Ok(written)
}

pub(super) async fn merge(
    worker_id: usize,
    queue: SharedQueue,
    store: Arc<dyn KvStore>,
    settings: WriterSettings,
) -> Result<u64, WorkerAbort> {
    let mut records: Vec<IPContext> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    while let Some(line) = next_line(&queue).await {
        let Some((_, record)) = parse_record(worker_id, line) else {
            continue;
        };
        match positions.get(&record.ip) {
            Some(&position) => records[position] = record,
            None => {
                positions.insert(record.ip.clone(), records.len());
                records.push(record);
            }
        }
    }

    if records.is_empty() {
        return Ok(0);
    }

    let keys: Vec<String> = records.iter().map(|record| record.ip.clone()).collect();
    let existing = store
        .multi_get(&keys)
        .await
        .map_err(|error| WorkerAbort { written: 0, error })?;

    let mut written = 0u64;
    let mut chunk = Vec::with_capacity(settings.chunk_size);
    for (partial, stored) in records.into_iter().zip(existing) {
        let current = stored
            .as_deref()
            .map(|raw| serde_json::from_str::<IPContext>(raw));
        let merged = match current {
            Some(Ok(current)) => merge_records(&current, &partial),
            Some(Err(e)) => {
                warn!(worker_id, ip = %partial.ip, error = %e, "stored record is unreadable, replacing it");
                partial
            }
            None => partial,
        };

        let value = serde_json::to_string(&merged).map_err(|e| WorkerAbort {
            written,
            error: e.into(),
        })?;
        chunk.push(SetOp::new(merged.ip, value, Some(settings.ttl)));

        if chunk.len() >= settings.chunk_size {
            let ops = std::mem::replace(&mut chunk, Vec::with_capacity(settings.chunk_size));
            if let Err(error) = flush(store.as_ref(), ops, &mut written).await {
                return Err(WorkerAbort { written, error });
            }
        }
    }

    if let Err(error) = flush(store.as_ref(), chunk, &mut written).await {
        return Err(WorkerAbort { written, error });
    }

    debug!(worker_id, count = written, "merge worker finished");
    Ok(written)
}
