// SPDX-License-Identifier: Apache-2.0

//! Blocking file-following primitive.
//!
//! Follows appends to a single file, re-opening it when the path is renamed
//! or truncated underneath us, and reports the byte offset just past every
//! line it returns. Only complete, newline-terminated lines are emitted;
//! a partial trailing line stays unconsumed until its newline is written.
//!
//! Change detection is either native (inotify/kqueue/FSEvents through the
//! `notify` debouncer, watching the parent directory so rotation is still
//! observed) or pure polling for filesystems where native watching is
//! unreliable, chosen by the caller.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, Debouncer};
use tracing::{debug, info, warn};

/// How file changes are detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    Native,
    Poll,
}

/// Debounce window for the native watcher.
const DEBOUNCE_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    #[cfg(unix)]
    dev: u64,
    #[cfg(unix)]
    ino: u64,
}

impl FileIdentity {
    fn of(meta: &fs::Metadata) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            Self {
                dev: meta.dev(),
                ino: meta.ino(),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = meta;
            Self {}
        }
    }
}

enum Watch {
    Poll,
    Native {
        // Held to keep the watcher alive; events arrive on `rx`.
        _debouncer: Debouncer<notify::RecommendedWatcher>,
        rx: Receiver<Result<Vec<DebouncedEvent>, notify::Error>>,
    },
}

pub struct Follower {
    path: PathBuf,
    reader: BufReader<File>,
    offset: u64,
    identity: FileIdentity,
    watch: Watch,
    poll_interval: Duration,
    line: Vec<u8>,
}

impl Follower {
    /// Open `path` for following, starting at `start_offset`. The file must
    /// exist; a missing source is the caller's per-source fatal error.
    pub fn open(
        path: impl AsRef<Path>,
        start_offset: u64,
        mode: WatchMode,
        poll_interval: Duration,
    ) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let identity = FileIdentity::of(&file.metadata()?);

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(start_offset))?;

        let watch = match mode {
            WatchMode::Poll => Watch::Poll,
            WatchMode::Native => match native_watch(&path) {
                Ok(watch) => watch,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Native file watching unavailable, falling back to polling"
                    );
                    Watch::Poll
                }
            },
        };

        Ok(Self {
            path,
            reader,
            offset: start_offset,
            identity,
            watch,
            poll_interval,
            line: Vec::with_capacity(1024),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset of the next unread byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read the next complete line, without its newline, along with the
    /// offset just past it. `None` means no complete line is available yet.
    pub fn read_line(&mut self) -> io::Result<Option<(Vec<u8>, u64)>> {
        self.line.clear();
        let n = self.reader.read_until(b'\n', &mut self.line)?;
        if n == 0 {
            return Ok(None);
        }

        if self.line.last() != Some(&b'\n') {
            // Partial line: rewind so the bytes are re-read once the writer
            // finishes it.
            self.reader.seek(SeekFrom::Start(self.offset))?;
            return Ok(None);
        }

        self.offset += n as u64;
        self.line.pop();
        Ok(Some((self.line.clone(), self.offset)))
    }

    /// Detect rename/truncate of the path and re-open from offset zero when
    /// it happens. Returns true if the file was re-opened. A missing path is
    /// not rotation: the writer may be mid-rename, so we keep waiting.
    pub fn check_rotation(&mut self) -> io::Result<bool> {
        let meta = match fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(_) => return Ok(false),
        };

        let identity = FileIdentity::of(&meta);
        if identity == self.identity && meta.len() >= self.offset {
            return Ok(false);
        }

        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) => {
                // The replacement disappeared between stat and open; retry
                // on the next wakeup.
                debug!(path = %self.path.display(), error = %e, "Unable to reopen rotated file");
                return Ok(false);
            }
        };

        info!(path = %self.path.display(), "Re-opening rotated file from the beginning");
        self.identity = FileIdentity::of(&file.metadata()?);
        self.reader = BufReader::new(file);
        self.offset = 0;
        Ok(true)
    }

    /// Block until the source may have changed, or `timeout` elapses. The
    /// bound keeps stop signals observable from the calling thread's loop.
    pub fn wait_for_change(&mut self, timeout: Duration) {
        match &self.watch {
            Watch::Poll => std::thread::sleep(self.poll_interval.min(timeout)),
            Watch::Native { rx, .. } => {
                // Any event on the parent directory wakes us; the read loop
                // determines what actually changed.
                if rx.recv_timeout(timeout).is_ok() {
                    while rx.try_recv().is_ok() {}
                }
            }
        }
    }
}

fn native_watch(path: &Path) -> notify::Result<Watch> {
    let (tx, rx) = channel();

    let mut debouncer = new_debouncer(DEBOUNCE_INTERVAL, move |res| {
        let _ = tx.send(res);
    })?;

    // Watch the parent directory rather than the file itself so the watch
    // survives rename-based rotation.
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    debouncer.watcher().watch(dir, RecursiveMode::NonRecursive)?;

    Ok(Watch::Native {
        _debouncer: debouncer,
        rx,
    })
}
