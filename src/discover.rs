// SPDX-License-Identifier: Apache-2.0

//! Glob discovery: continually resolves a path pattern and announces each
//! newly matching file exactly once.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{debug, info, warn};

use crate::bounded_channel::BoundedSender;
use crate::error::{Error, Result};

/// How often each pattern is re-resolved.
pub const GLOB_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Capacity of the discovery channel feeding the pipeline sink.
pub(crate) const DISCOVERY_CHANNEL_CAPACITY: usize = 16;

/// A newly discovered source and the credential it ships with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    pub api_key: String,
}

/// One discoverer per configured glob pattern. Announced paths are never
/// forgotten here; if a file disappears, that is the tailer's event to
/// handle.
pub struct GlobDiscoverer {
    pattern: String,
    api_key: String,
    announced: HashSet<PathBuf>,
    checks: u64,
}

impl GlobDiscoverer {
    pub fn new(pattern: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            api_key: api_key.into(),
            announced: HashSet::new(),
            checks: 0,
        }
    }

    /// Resolve the pattern once, publishing paths not yet announced.
    pub async fn check(&mut self, sink: &BoundedSender<DiscoveredFile>) -> Result<()> {
        let entries = glob::glob(&self.pattern)
            .map_err(|e| Error::InvalidGlob(format!("{}: {}", self.pattern, e)))?;

        let mut paths = Vec::new();
        for entry in entries {
            match entry {
                Ok(path) => {
                    if !path.is_dir() {
                        paths.push(path);
                    }
                }
                Err(e) => debug!(pattern = %self.pattern, error = %e, "Unreadable glob entry"),
            }
        }

        if self.checks == 0 && self.announced.is_empty() && paths.is_empty() {
            warn!(
                pattern = %self.pattern,
                "File path did not return any files, the agent will continue checking \
                 indefinitely. Please ensure the file(s) exist and that the agent has \
                 permission to access them."
            );
        }

        for path in paths {
            if self.announced.insert(path.clone()) {
                info!(pattern = %self.pattern, path = %path.display(), "Discovered new file");
                let discovered = DiscoveredFile {
                    path,
                    api_key: self.api_key.clone(),
                };
                if sink.send(discovered).await.is_err() {
                    return Err(Error::ChannelClosed);
                }
            }
        }

        self.checks += 1;
        Ok(())
    }

    /// Check immediately, then on every tick until shutdown. A glob syntax
    /// error is fatal for this discoverer only.
    pub async fn run(
        mut self,
        sink: BoundedSender<DiscoveredFile>,
        quit: CancellationToken,
    ) -> std::result::Result<(), BoxError> {
        info!(pattern = %self.pattern, "Discovering files");

        match self.check(&sink).await {
            Ok(()) => {}
            Err(Error::ChannelClosed) => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let start = tokio::time::Instant::now() + GLOB_CHECK_INTERVAL;
        let mut tick = tokio::time::interval_at(start, GLOB_CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = quit.cancelled() => return Ok(()),
                _ = tick.tick() => {
                    match self.check(&sink).await {
                        Ok(()) => {}
                        // Shutdown closed the sink under us.
                        Err(Error::ChannelClosed) => return Ok(()),
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_channel::bounded;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn announces_each_matching_file_once() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("one.log"), "a").unwrap();
        fs::write(dir.path().join("two.log"), "b").unwrap();
        fs::write(dir.path().join("skip.txt"), "c").unwrap();

        let pattern = format!("{}/*.log", dir.path().display());
        let mut discoverer = GlobDiscoverer::new(&pattern, "key-1");
        let (tx, rx) = bounded(16);

        discoverer.check(&tx).await.unwrap();
        let mut found = vec![rx.try_recv().unwrap(), rx.try_recv().unwrap()];
        assert!(rx.try_recv().is_none());
        found.sort_by(|a, b| a.path.cmp(&b.path));
        assert!(found[0].path.ends_with("one.log"));
        assert!(found[1].path.ends_with("two.log"));
        assert_eq!(found[0].api_key, "key-1");

        // A second check announces nothing new.
        discoverer.check(&tx).await.unwrap();
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn discovers_files_created_after_start() {
        let dir = TempDir::new().unwrap();

        let pattern = format!("{}/*.log", dir.path().display());
        let mut discoverer = GlobDiscoverer::new(&pattern, "key");
        let (tx, rx) = bounded(16);

        // Nothing yet: warns once and keeps going.
        discoverer.check(&tx).await.unwrap();
        assert!(rx.try_recv().is_none());

        fs::write(dir.path().join("late.log"), "arrived").unwrap();

        discoverer.check(&tx).await.unwrap();
        let found = rx.try_recv().unwrap();
        assert!(found.path.ends_with("late.log"));
    }

    #[tokio::test]
    async fn directories_are_not_announced() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("subdir.log")).unwrap();
        fs::write(dir.path().join("real.log"), "x").unwrap();

        let pattern = format!("{}/*.log", dir.path().display());
        let mut discoverer = GlobDiscoverer::new(&pattern, "key");
        let (tx, rx) = bounded(16);

        discoverer.check(&tx).await.unwrap();
        let found = rx.try_recv().unwrap();
        assert!(found.path.ends_with("real.log"));
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn invalid_pattern_is_fatal_for_this_discoverer() {
        let mut discoverer = GlobDiscoverer::new("/var/log/[invalid", "key");
        let (tx, _rx) = bounded(16);

        let err = discoverer.check(&tx).await.unwrap_err();
        assert!(matches!(err, Error::InvalidGlob(_)));
    }
}
