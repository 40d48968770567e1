// SPDX-License-Identifier: Apache-2.0

//! Line batching: aggregates records into bounded payloads flushed by size,
//! by time, or when the input closes.

use std::time::Duration;

use bytes::Bytes;
use tracing::warn;

use crate::bounded_channel::{BoundedReceiver, BoundedSender};
use crate::tail::LineRecord;

/// Maximum payload size. The ingestion API rejects payloads over 1 MB; this
/// leaves ~10 KB of headroom for headers.
pub const MAX_PAYLOAD_BYTES: usize = 990_000;

/// Default flush period when the buffer has content but is not full.
pub const DEFAULT_BATCH_PERIOD: Duration = Duration::from_secs(3);

/// Capacity of the batcher-to-forwarder channel.
pub(crate) const BATCH_CHANNEL_CAPACITY: usize = 8;

/// One flushed payload plus the provenance the forwarder commits on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Filename of the last line in the payload.
    pub filename: String,
    /// Newline-terminated lines, concatenated.
    pub payload: Bytes,
    /// Byte offset just past the last line in the payload. Zero for
    /// sources that do not track positions.
    pub tail_position: u64,
}

struct Buffer {
    capacity: usize,
    bytes: Vec<u8>,
    filename: String,
    tail_position: u64,
}

impl Buffer {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            bytes: Vec::with_capacity(capacity),
            filename: String::new(),
            tail_position: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn fits(&self, line: &LineRecord) -> bool {
        self.bytes.len() + line.bytes.len() + 1 <= self.capacity
    }

    fn push(&mut self, line: LineRecord) {
        self.bytes.extend_from_slice(&line.bytes);
        self.bytes.push(b'\n');
        self.filename = line.filename;
        self.tail_position = line.position;
    }

    fn take(&mut self) -> Batch {
        Batch {
            filename: std::mem::take(&mut self.filename),
            payload: Bytes::from(std::mem::take(&mut self.bytes)),
            tail_position: std::mem::replace(&mut self.tail_position, 0),
        }
    }
}

/// Consume lines until the input closes, emitting batches downstream.
///
/// Flush triggers, in order of precedence:
///   - size: a line that would overflow the buffer flushes it first;
///   - time: every `period`, a non-empty buffer is flushed;
///   - close: when the input ends, the remainder is flushed and the output
///     closed.
///
/// A single line that cannot fit in an empty buffer is dropped with a
/// warning. Splitting it across batches would corrupt downstream parsing,
/// and blocking on it would deadlock the pipeline.
pub async fn run(
    mut lines: BoundedReceiver<LineRecord>,
    batches: BoundedSender<Batch>,
    period: Duration,
) {
    run_with_capacity(&mut lines, &batches, period, MAX_PAYLOAD_BYTES).await
}

async fn run_with_capacity(
    lines: &mut BoundedReceiver<LineRecord>,
    batches: &BoundedSender<Batch>,
    period: Duration,
    capacity: usize,
) {
    let mut buf = Buffer::new(capacity);
    let start = tokio::time::Instant::now() + period;
    let mut flush_tick = tokio::time::interval_at(start, period);
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            line = lines.next() => match line {
                Some(line) => {
                    if line.bytes.len() + 1 > capacity {
                        warn!(
                            file = %line.filename,
                            bytes = line.bytes.len(),
                            "Ignoring log line greater than the max payload size"
                        );
                        continue;
                    }

                    if !buf.fits(&line) {
                        if batches.send(buf.take()).await.is_err() {
                            return;
                        }
                    }

                    buf.push(line);
                }
                None => {
                    // Input closed: flush the remainder and close the output.
                    if !buf.is_empty() && batches.send(buf.take()).await.is_err() {
                        return;
                    }
                    return;
                }
            },
            _ = flush_tick.tick() => {
                if !buf.is_empty() && batches.send(buf.take()).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_channel::bounded;

    fn line(filename: &str, bytes: &[u8], position: u64) -> LineRecord {
        LineRecord {
            filename: filename.to_string(),
            bytes: bytes.to_vec(),
            position,
        }
    }

    #[tokio::test]
    async fn flushes_remainder_on_input_close() {
        let (line_tx, line_rx) = bounded(8);
        let (batch_tx, mut batch_rx) = bounded(8);

        let batcher = tokio::spawn(run(line_rx, batch_tx, Duration::from_secs(60)));

        line_tx.send(line("a.log", b"one", 4)).await.unwrap();
        line_tx.send(line("a.log", b"two", 8)).await.unwrap();
        drop(line_tx);

        let batch = batch_rx.next().await.unwrap();
        assert_eq!(batch.payload.as_ref(), b"one\ntwo\n");
        assert_eq!(batch.filename, "a.log");
        assert_eq!(batch.tail_position, 8);

        assert!(batch_rx.next().await.is_none());
        batcher.await.unwrap();
    }

    #[tokio::test]
    async fn flushes_on_timer() {
        let (line_tx, line_rx) = bounded(8);
        let (batch_tx, mut batch_rx) = bounded(8);

        tokio::spawn(run(line_rx, batch_tx, Duration::from_millis(20)));

        line_tx.send(line("a.log", b"tick", 5)).await.unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(5), batch_rx.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.payload.as_ref(), b"tick\n");
        assert_eq!(batch.tail_position, 5);
    }

    #[tokio::test]
    async fn empty_buffer_is_never_flushed_by_timer() {
        let (line_tx, line_rx) = bounded::<LineRecord>(8);
        let (batch_tx, batch_rx) = bounded(8);

        tokio::spawn(run(line_rx, batch_tx, Duration::from_millis(5)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(batch_rx.try_recv().is_none());
        drop(line_tx);
    }

    #[tokio::test]
    async fn size_flush_keeps_lines_whole() {
        let (line_tx, mut line_rx) = bounded(8);
        let (batch_tx, mut batch_rx) = bounded(8);

        // Small capacity so the test stays readable: two 4-byte lines fit
        // (5 bytes each with newline), a third does not.
        let batcher = tokio::spawn(async move {
            run_with_capacity(&mut line_rx, &batch_tx, Duration::from_secs(60), 12).await
        });

        line_tx.send(line("a.log", b"aaaa", 5)).await.unwrap();
        line_tx.send(line("a.log", b"bbbb", 10)).await.unwrap();
        line_tx.send(line("a.log", b"cccc", 15)).await.unwrap();
        drop(line_tx);

        let first = batch_rx.next().await.unwrap();
        assert_eq!(first.payload.as_ref(), b"aaaa\nbbbb\n");
        assert_eq!(first.tail_position, 10);

        let second = batch_rx.next().await.unwrap();
        assert_eq!(second.payload.as_ref(), b"cccc\n");
        assert_eq!(second.tail_position, 15);

        batcher.await.unwrap();
    }

    #[tokio::test]
    async fn oversize_line_is_dropped() {
        let (line_tx, mut line_rx) = bounded(8);
        let (batch_tx, mut batch_rx) = bounded(8);

        let batcher = tokio::spawn(async move {
            run_with_capacity(&mut line_rx, &batch_tx, Duration::from_secs(60), 10).await
        });

        // Exactly at capacity with its newline: too large.
        line_tx.send(line("a.log", b"xxxxxxxxxx", 11)).await.unwrap();
        line_tx.send(line("a.log", b"ok", 14)).await.unwrap();
        drop(line_tx);

        let batch = batch_rx.next().await.unwrap();
        assert_eq!(batch.payload.as_ref(), b"ok\n");
        assert_eq!(batch.tail_position, 14);

        assert!(batch_rx.next().await.is_none());
        batcher.await.unwrap();
    }

    #[tokio::test]
    async fn provenance_tracks_last_line() {
        let (line_tx, line_rx) = bounded(8);
        let (batch_tx, mut batch_rx) = bounded(8);

        tokio::spawn(run(line_rx, batch_tx, Duration::from_secs(60)));

        line_tx.send(line("a.log", b"first", 6)).await.unwrap();
        line_tx.send(line("a.log", b"second", 13)).await.unwrap();
        drop(line_tx);

        let batch = batch_rx.next().await.unwrap();
        assert_eq!(batch.filename, "a.log");
        assert_eq!(batch.tail_position, 13);
    }
}
