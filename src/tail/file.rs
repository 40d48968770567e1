// SPDX-License-Identifier: Apache-2.0

//! File tailer: owns the resume-offset decision and drives a [`Follower`]
//! on a dedicated OS thread, emitting [`LineRecord`]s into the pipeline.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bounded_channel::{bounded, BoundedReceiver, BoundedSender};
use crate::checksum::head_checksum;
use crate::error::Result;
use crate::state::StateStore;
use crate::tail::follower::{Follower, WatchMode};
use crate::tail::{LineRecord, Tailer, LINE_CHANNEL_CAPACITY};

/// Upper bound on a single wait inside the driver loop, so stop signals are
/// observed promptly even when the source is idle.
const WAIT_TIMEOUT: Duration = Duration::from_millis(250);

/// Default poll cadence when the follower runs in polling mode.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct TailConfig {
    /// Where to start in a file we have never seen before: the beginning,
    /// or the current end.
    pub read_from_start_if_new: bool,
    pub mode: WatchMode,
    pub poll_interval: Duration,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            read_from_start_if_new: false,
            mode: WatchMode::Native,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

pub struct FileTailer {
    lines: Option<BoundedReceiver<LineRecord>>,
}

impl FileTailer {
    /// Decide the starting offset for `path`, record it in the state store,
    /// and spawn the follower thread. Open failures are per-source fatal:
    /// the caller logs them and leaves other sources running.
    ///
    /// Two independent signals end the tailer: `quit` (process shutdown,
    /// shared) and `stop` (this source only). Either closes the output.
    pub fn spawn(
        path: PathBuf,
        config: TailConfig,
        store: Arc<StateStore>,
        quit: CancellationToken,
        stop: CancellationToken,
    ) -> Result<Self> {
        let filename = path.to_string_lossy().to_string();
        info!(file = %filename, "Creating new file tailer");

        let offset = starting_offset(&path, &filename, config.read_from_start_if_new, &store)?;
        let follower = Follower::open(&path, offset, config.mode, config.poll_interval)?;

        let (tx, rx) = bounded::<LineRecord>(LINE_CHANNEL_CAPACITY);

        let thread_name = path
            .file_name()
            .map(|n| format!("tail-{}", n.to_string_lossy()))
            .unwrap_or_else(|| "tail".to_string());
        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || run(follower, filename, store, tx, quit, stop))?;

        Ok(Self { lines: Some(rx) })
    }
}

impl Tailer for FileTailer {
    fn take_lines(&mut self) -> BoundedReceiver<LineRecord> {
        self.lines.take().expect("tailer lines already taken")
    }
}

/// The startup decision tree: prior state plus the current content
/// fingerprint determine whether we resume, restart after rotation, or
/// treat the file as new. The decision is recorded before following begins
/// so a crash before the first delivery still lets the next run diagnose
/// rotation correctly.
fn starting_offset(
    path: &std::path::Path,
    filename: &str,
    read_from_start_if_new: bool,
    store: &StateStore,
) -> Result<u64> {
    let prior = store.load_state(filename);

    let current = match head_checksum(path) {
        Ok(sum) => Some(sum),
        Err(e) => {
            warn!(file = filename, error = %e, "Unable to checksum file, ignoring prior state");
            None
        }
    };

    let (checksum, offset) = match (prior, current) {
        (Some(state), Some(current)) if state.checksum == current => {
            info!(
                file = filename,
                offset = state.offset,
                "Prior state is accurate, resuming"
            );
            (current, state.offset)
        }
        (Some(_), Some(current)) => {
            info!(
                file = filename,
                "Prior state does not match, file has been rotated"
            );
            (current, 0)
        }
        (_, current) => {
            let offset = if read_from_start_if_new {
                0
            } else {
                std::fs::metadata(path)?.len()
            };
            (current.unwrap_or(0), offset)
        }
    };

    store.update_state(filename, checksum, offset);
    Ok(offset)
}

fn run(
    mut follower: Follower,
    filename: String,
    store: Arc<StateStore>,
    tx: BoundedSender<LineRecord>,
    quit: CancellationToken,
    stop: CancellationToken,
) {
    loop {
        if quit.is_cancelled() || stop.is_cancelled() {
            break;
        }

        match follower.read_line() {
            Ok(Some((bytes, position))) => {
                let record = LineRecord {
                    filename: filename.clone(),
                    bytes,
                    position,
                };
                // A send failure means the downstream stages are gone;
                // there is nobody left to deliver to.
                if tx.send_blocking(record).is_err() {
                    break;
                }
            }
            Ok(None) => {
                match follower.check_rotation() {
                    Ok(true) => {
                        // Same name, different file: re-fingerprint and reset
                        // the recorded offset so a restart resumes correctly,
                        // then read the new file without waiting.
                        match head_checksum(follower.path()) {
                            Ok(sum) => store.update_state(&filename, sum, 0),
                            Err(e) => {
                                warn!(file = %filename, error = %e, "Unable to checksum rotated file")
                            }
                        }
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => error!(file = %filename, error = %e, "Error checking for rotation"),
                }
                follower.wait_for_change(WAIT_TIMEOUT);
            }
            Err(e) => {
                error!(file = %filename, error = %e, "Error reading line");
                follower.wait_for_change(WAIT_TIMEOUT);
            }
        }
    }

    // The first 256 bytes may have changed since open (short file that
    // grew); refresh the fingerprint so the next run resumes correctly.
    match head_checksum(follower.path()) {
        Ok(sum) => {
            if let Err(e) = store.update_checksum(&filename, sum) {
                warn!(file = %filename, error = %e, "Unable to update checksum on stop");
            }
        }
        Err(e) => warn!(file = %filename, error = %e, "Unable to checksum file on stop"),
    }

    info!(
        file = %filename,
        offset = follower.offset(),
        "Stopped tailing"
    );
    // Dropping the sender closes the tailer's output.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tail::follower::WatchMode;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    fn test_config() -> TailConfig {
        TailConfig {
            read_from_start_if_new: true,
            mode: WatchMode::Poll,
            poll_interval: Duration::from_millis(10),
        }
    }

    fn spawn_tailer(
        path: &std::path::Path,
        config: TailConfig,
        store: &Arc<StateStore>,
    ) -> (FileTailer, CancellationToken, CancellationToken) {
        let quit = CancellationToken::new();
        let stop = CancellationToken::new();
        let tailer = FileTailer::spawn(
            path.to_path_buf(),
            config,
            store.clone(),
            quit.clone(),
            stop.clone(),
        )
        .unwrap();
        (tailer, quit, stop)
    }

    #[test]
    fn reads_existing_lines_from_start() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "alpha\nbeta\n").unwrap();

        let store = Arc::new(StateStore::in_memory().with_legacy_dir(dir.path()));
        let (mut tailer, quit, _stop) = spawn_tailer(&path, test_config(), &store);
        let lines = tailer.take_lines();

        let first = lines.recv_timeout(RECV_TIMEOUT).unwrap();
        assert_eq!(first.bytes, b"alpha");
        assert_eq!(first.position, 6);
        let second = lines.recv_timeout(RECV_TIMEOUT).unwrap();
        assert_eq!(second.bytes, b"beta");
        assert_eq!(second.position, 11);

        quit.cancel();
        assert!(lines.recv_timeout(RECV_TIMEOUT).is_none());
    }

    #[test]
    fn new_file_without_read_from_start_skips_existing_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "old content\n").unwrap();

        let store = Arc::new(StateStore::in_memory().with_legacy_dir(dir.path()));
        let config = TailConfig {
            read_from_start_if_new: false,
            ..test_config()
        };
        let (mut tailer, quit, _stop) = spawn_tailer(&path, config, &store);
        let lines = tailer.take_lines();

        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"fresh\n").unwrap();
        f.sync_all().unwrap();

        let record = lines.recv_timeout(RECV_TIMEOUT).unwrap();
        assert_eq!(record.bytes, b"fresh");
        assert_eq!(record.position, 18);

        quit.cancel();
    }

    #[test]
    fn resumes_from_recorded_offset_when_checksum_matches() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "line one\nline two\n").unwrap();

        let store = Arc::new(StateStore::in_memory().with_legacy_dir(dir.path()));
        let checksum = head_checksum(&path).unwrap();
        store.update_state(&path.to_string_lossy(), checksum, 9);

        let (mut tailer, quit, _stop) = spawn_tailer(&path, test_config(), &store);
        let lines = tailer.take_lines();

        let record = lines.recv_timeout(RECV_TIMEOUT).unwrap();
        assert_eq!(record.bytes, b"line two");
        assert_eq!(record.position, 18);

        quit.cancel();
    }

    #[test]
    fn checksum_mismatch_restarts_from_zero() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "replacement contents\n").unwrap();

        let store = Arc::new(StateStore::in_memory().with_legacy_dir(dir.path()));
        // Prior state from a file that no longer exists under this name.
        store.update_state(&path.to_string_lossy(), 0xdeadbeef, 9999);

        let (mut tailer, quit, _stop) = spawn_tailer(&path, test_config(), &store);
        let lines = tailer.take_lines();

        let record = lines.recv_timeout(RECV_TIMEOUT).unwrap();
        assert_eq!(record.bytes, b"replacement contents");
        assert_eq!(record.position, 21);

        quit.cancel();
    }

    #[test]
    fn records_state_before_following() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "content\n").unwrap();

        let store = Arc::new(StateStore::in_memory().with_legacy_dir(dir.path()));
        let (_tailer, quit, _stop) = spawn_tailer(&path, test_config(), &store);

        let state = store.get(&path.to_string_lossy()).unwrap();
        assert_eq!(state.checksum, head_checksum(&path).unwrap());
        assert_eq!(state.offset, 0);

        quit.cancel();
    }

    #[test]
    fn stop_signal_closes_output_for_this_source_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        fs::write(&path, "one\n").unwrap();

        let store = Arc::new(StateStore::in_memory().with_legacy_dir(dir.path()));
        let (mut tailer, _quit, stop) = spawn_tailer(&path, test_config(), &store);
        let lines = tailer.take_lines();

        assert_eq!(lines.recv_timeout(RECV_TIMEOUT).unwrap().bytes, b"one");

        stop.cancel();
        assert!(lines.recv_timeout(RECV_TIMEOUT).is_none());
    }

    #[test]
    fn missing_file_is_a_per_source_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.log");
        let store = Arc::new(StateStore::in_memory().with_legacy_dir(dir.path()));

        let result = FileTailer::spawn(
            path,
            test_config(),
            store,
            CancellationToken::new(),
            CancellationToken::new(),
        );
        assert!(result.is_err());
    }
}
