//! Streaming decode of gzip-compressed, newline-delimited feed files

use flate2::read::MultiGzDecoder;
use std::io::{self, BufRead, BufReader, Read};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("failed to decompress feed stream: {0}")]
    Io(#[from] io::Error),
}

/// Lazy iterator over the raw lines of a gzip-compressed feed.
///
/// Line terminators are stripped and blank lines are skipped. Iteration ends
/// after the first read error.
pub struct LineDecoder<R: Read> {
    reader: BufReader<MultiGzDecoder<R>>,
    finished: bool,
}

/// Start decoding `reader`; every call starts a fresh single pass.
pub fn decode_lines<R: Read>(reader: R) -> LineDecoder<R> {
    LineDecoder {
        reader: BufReader::new(MultiGzDecoder::new(reader)),
        finished: false,
    }
}

impl<R: Read> Iterator for LineDecoder<R> {
    type Item = Result<Vec<u8>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            let mut line = Vec::new();
            match self.reader.read_until(b'\n', &mut line) {
                Ok(0) => {
                    self.finished = true;
                    return None;
                }
                Ok(_) => {
                    while matches!(line.last(), Some(b'\n' | b'\r')) {
                        line.pop();
                    }
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    return Some(Ok(line));
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e.into()));
                }
            }
        }
    }
}

/// Outcome of a producer run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeSummary {
    /// Lines handed to the queue
    pub lines: u64,
    /// Decoding stopped early because cancellation was requested
    pub cancelled: bool,
}

/// Decode `stream` on a blocking thread and push each line into `queue`.
///
/// The queue is bounded, so the producer waits while consumers are behind.
/// Cancellation is checked before every line. When every consumer has gone
/// away the producer stops quietly.
pub fn spawn_line_producer<R>(
    stream: R,
    queue: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) -> JoinHandle<Result<DecodeSummary, DecodeError>>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let reader = SyncIoBridge::new(stream);
    tokio::task::spawn_blocking(move || {
        let mut summary = DecodeSummary::default();
        for line in decode_lines(reader) {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let line = line?;
            if queue.blocking_send(line).is_err() {
                debug!(lines = summary.lines, "line consumers stopped, ending decode");
                break;
            }
            summary.lines += 1;
        }
        Ok(summary)
    })
}
