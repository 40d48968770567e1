// SPDX-License-Identifier: Apache-2.0

//! Reader tailer: newline-delimited records from an arbitrary byte stream.
//!
//! Used for the stdin capture mode. No offsets are tracked and no checksum
//! is computed; the stream is finite and closes the output on EOF or when
//! the process-wide quit signal fires.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::bounded_channel::{bounded, BoundedReceiver};
use crate::tail::{LineRecord, Tailer, LINE_CHANNEL_CAPACITY, STDIN_SOURCE};

pub struct ReaderTailer {
    lines: Option<BoundedReceiver<LineRecord>>,
}

impl ReaderTailer {
    pub fn spawn<R>(source: R, quit: CancellationToken) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        info!("Creating reader tailer");

        let (tx, rx) = bounded::<LineRecord>(LINE_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut reader = BufReader::new(source);
            let mut buf = Vec::with_capacity(1024);

            loop {
                buf.clear();
                tokio::select! {
                    _ = quit.cancelled() => break,
                    read = reader.read_until(b'\n', &mut buf) => match read {
                        Ok(0) => break, // EOF
                        Ok(_) => {
                            if buf.last() == Some(&b'\n') {
                                buf.pop();
                            }
                            let record = LineRecord {
                                filename: STDIN_SOURCE.to_string(),
                                bytes: buf.clone(),
                                position: 0,
                            };
                            if tx.send(record).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Error reading stdin");
                            break;
                        }
                    }
                }
            }
            // Dropping the sender closes the output.
        });

        Self { lines: Some(rx) }
    }
}

impl Tailer for ReaderTailer {
    fn take_lines(&mut self) -> BoundedReceiver<LineRecord> {
        self.lines.take().expect("tailer lines already taken")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn emits_lines_and_closes_on_eof() {
        let input: &[u8] = b"test log line\nanother line\n";
        let mut tailer = ReaderTailer::spawn(input, CancellationToken::new());
        let mut lines = tailer.take_lines();

        let first = lines.next().await.unwrap();
        assert_eq!(first.filename, STDIN_SOURCE);
        assert_eq!(first.bytes, b"test log line");
        assert_eq!(first.position, 0);

        let second = lines.next().await.unwrap();
        assert_eq!(second.bytes, b"another line");

        assert!(lines.next().await.is_none());
    }

    #[tokio::test]
    async fn final_line_without_newline_is_still_emitted() {
        let input: &[u8] = b"complete\ntrailing";
        let mut tailer = ReaderTailer::spawn(input, CancellationToken::new());
        let mut lines = tailer.take_lines();

        assert_eq!(lines.next().await.unwrap().bytes, b"complete");
        assert_eq!(lines.next().await.unwrap().bytes, b"trailing");
        assert!(lines.next().await.is_none());
    }

    #[tokio::test]
    async fn quit_closes_the_output() {
        // A pipe that never produces EOF on its own.
        let (_tx, rx) = tokio::io::duplex(64);
        let quit = CancellationToken::new();
        let mut tailer = ReaderTailer::spawn(rx, quit.clone());
        let mut lines = tailer.take_lines();

        quit.cancel();
        let next = tokio::time::timeout(Duration::from_secs(5), lines.next())
            .await
            .unwrap();
        assert!(next.is_none());
    }
}
