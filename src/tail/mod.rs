// SPDX-License-Identifier: Apache-2.0

//! Tailers: lazy sequences of [`LineRecord`]s with a stop protocol.
//!
//! Two variants exist. [`file::FileTailer`] follows an append-only file,
//! owns the resume-offset decision, and reports the byte position of every
//! line it emits. [`reader::ReaderTailer`] wraps an arbitrary byte stream
//! (stdin in production) and tracks no positions.

pub mod file;
pub mod follower;
pub mod reader;

use crate::bounded_channel::BoundedReceiver;

/// Source name used for the stdin tailer.
pub const STDIN_SOURCE: &str = "stdin";

/// Capacity of the tailer-to-batcher line channel.
pub(crate) const LINE_CHANNEL_CAPACITY: usize = 64;

/// One log line read from a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineRecord {
    pub filename: String,
    /// Line content without its terminating newline.
    pub bytes: Vec<u8>,
    /// Byte offset just past this line in `filename`. Zero for sources
    /// that do not track positions (stdin).
    pub position: u64,
}

/// A tailer hands out the receiving end of its line stream exactly once;
/// the stream closes when the source ends or a stop signal is observed.
pub trait Tailer {
    fn take_lines(&mut self) -> BoundedReceiver<LineRecord>;
}
