// SPDX-License-Identifier: Apache-2.0

//! Durable resume state, one JSON document for the whole agent.
//!
//! The store maps each tailed filename to the checksum/offset pair the next
//! run needs to resume without re-sending delivered data. Entries are never
//! removed automatically: an orphaned entry is cheap and prevents an
//! accidental full re-tail if the file reappears.
//!
//! Persistence rewrites the file in place (truncate, write, fsync) on a
//! single handle. That is not crash-atomic; `open` tolerates a short or
//! unparseable document by starting from empty state, so the worst outcome
//! of a crash mid-rewrite is replaying from an earlier offset.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Cadence of the background flush ticker.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Resume state for a single tailed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileState {
    pub checksum: u32,
    pub offset: u64,
}

/// On-disk document shape. Both fields tolerate being absent or null so a
/// malformed-but-valid-JSON statefile cannot poison the in-memory state.
#[derive(Debug, Default, Deserialize)]
struct StateDocument {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    states: Option<HashMap<String, FileState>>,
}

#[derive(Serialize)]
struct StateDocumentRef<'a> {
    version: &'a str,
    states: &'a HashMap<String, FileState>,
}

/// Process-wide resume-state store.
///
/// Explicitly constructed and threaded through the pipeline constructors so
/// tests can instantiate their own. One reader/writer lock protects the map;
/// a separate mutex protects the file handle and serializes `persist`.
pub struct StateStore {
    states: RwLock<HashMap<String, FileState>>,
    version: RwLock<String>,
    file: Mutex<Option<File>>,
    legacy_dir: PathBuf,
}

impl StateStore {
    /// Open the statefile at `path`, creating it (and its parent
    /// directories) with valid empty state when absent. Errors here are
    /// fatal to the agent: without the statefile there is no durability.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let store = Self::in_memory();

        if path.exists() {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(|e| {
                    Error::State(format!("unable to open statefile {}: {}", path.display(), e))
                })?;

            let mut contents = String::new();
            file.read_to_string(&mut contents).map_err(|e| {
                Error::State(format!("unable to read statefile {}: {}", path.display(), e))
            })?;

            let mut rewrite = false;
            match serde_json::from_str::<StateDocument>(&contents) {
                Ok(doc) => {
                    // Absent or null fields keep their defaults; they will be
                    // overwritten on the next state update.
                    if let Some(version) = doc.version {
                        *store.version.write().unwrap() = version;
                    }
                    if let Some(states) = doc.states {
                        *store.states.write().unwrap() = states;
                    }
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Statefile is unreadable, starting from empty state"
                    );
                    rewrite = true;
                }
            }

            *store.file.lock().unwrap() = Some(file);
            if rewrite {
                store.persist()?;
            }
        } else {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).map_err(|e| {
                        Error::State(format!(
                            "unable to create statefile directory {}: {}",
                            parent.display(),
                            e
                        ))
                    })?;
                }
            }

            let file = File::create(path).map_err(|e| {
                Error::State(format!("unable to create statefile {}: {}", path.display(), e))
            })?;

            *store.file.lock().unwrap() = Some(file);
            store.persist()?;
        }

        Ok(store)
    }

    /// A store with no backing file. Used by tests and by `capture-stdin`,
    /// which has no offsets to record.
    pub fn in_memory() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            version: RwLock::new(crate::version()),
            file: Mutex::new(None),
            legacy_dir: PathBuf::from("."),
        }
    }

    /// Override where legacy per-file statefiles are looked up. Tests use
    /// this to avoid depending on the working directory.
    pub fn with_legacy_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.legacy_dir = dir.into();
        self
    }

    pub fn get(&self, filename: &str) -> Option<FileState> {
        self.states.read().unwrap().get(filename).copied()
    }

    /// Resume-state lookup used by tailers at startup. Consults the legacy
    /// per-file statefile format first so it can be imported and cleaned up.
    pub fn load_state(&self, filename: &str) -> Option<FileState> {
        let legacy_path = self.legacy_dir.join(legacy_state_filename(filename));
        match read_legacy_state(&legacy_path) {
            Ok(Some(state)) => {
                info!(
                    file = filename,
                    legacy = %legacy_path.display(),
                    "Migrating legacy statefile into global state"
                );
                self.update_state(filename, state.checksum, state.offset);
                if let Err(e) = fs::remove_file(&legacy_path) {
                    warn!(legacy = %legacy_path.display(), error = %e, "Unable to remove legacy statefile");
                }
                return Some(state);
            }
            Ok(None) => {}
            Err(e) => {
                debug!(file = filename, error = %e, "Unable to load legacy statefile");
            }
        }

        self.get(filename)
    }

    pub fn update_state(&self, filename: &str, checksum: u32, offset: u64) {
        self.states
            .write()
            .unwrap()
            .insert(filename.to_string(), FileState { checksum, offset });
    }

    pub fn update_checksum(&self, filename: &str, checksum: u32) -> Result<()> {
        let mut states = self.states.write().unwrap();
        match states.get_mut(filename) {
            Some(state) => {
                state.checksum = checksum;
                Ok(())
            }
            None => Err(Error::State(format!(
                "unable to read state for file {}",
                filename
            ))),
        }
    }

    pub fn update_offset(&self, filename: &str, offset: u64) -> Result<()> {
        let mut states = self.states.write().unwrap();
        match states.get_mut(filename) {
            Some(state) => {
                state.offset = offset;
                Ok(())
            }
            None => Err(Error::State(format!(
                "unable to read state for file {}",
                filename
            ))),
        }
    }

    pub fn delete(&self, filename: &str) {
        self.states.write().unwrap().remove(filename);
    }

    /// Write the current state to disk: truncate, write at offset zero,
    /// fsync. Serialized by the file-handle mutex.
    pub fn persist(&self) -> Result<()> {
        let mut guard = self.file.lock().unwrap();
        let file = match guard.as_mut() {
            Some(f) => f,
            None => return Ok(()), // in-memory store
        };

        let json = {
            let states = self.states.read().unwrap();
            let version = self.version.read().unwrap();
            serde_json::to_vec(&StateDocumentRef {
                version: &version,
                states: &states,
            })?
        };

        file.set_len(0)
            .and_then(|_| file.seek(SeekFrom::Start(0)))
            .and_then(|_| file.write_all(&json))
            .and_then(|_| file.sync_all())
            .map_err(|e| Error::State(format!("unable to write statefile: {}", e)))
    }

    /// Background flush loop: persist every second, and once more on
    /// shutdown. A persist failure is fatal — losing durable progress is
    /// worse than exiting.
    pub fn start_flush(
        self: &Arc<Self>,
        quit: CancellationToken,
    ) -> tokio::task::JoinHandle<std::result::Result<(), BoxError>> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(FLUSH_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = quit.cancelled() => {
                        store
                            .persist()
                            .map_err(|e| -> BoxError { format!("final statefile flush failed: {}", e).into() })?;
                        return Ok(());
                    }
                    _ = tick.tick() => {
                        if let Err(e) = store.persist() {
                            return Err(format!("statefile flush failed: {}", e).into());
                        }
                    }
                }
            }
        })
    }
}

/// Default statefile location, following filesystem-hierarchy conventions
/// for the supported operating systems.
pub fn default_statefile_path() -> &'static str {
    if cfg!(any(
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "macos"
    )) {
        "/var/db/timber-agent/statefile.json"
    } else {
        "/var/lib/timber-agent/statefile.json"
    }
}

/// Name of the legacy single-file statefile for a tailed path.
pub fn legacy_state_filename(filename: &str) -> String {
    let base = Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| filename.to_string());
    format!("{}-state.json", base)
}

fn read_legacy_state(path: &Path) -> Result<Option<FileState>> {
    let contents = match fs::read(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let state: FileState = serde_json::from_slice(&contents)?;
    Ok(Some(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn open_creates_valid_empty_statefile() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/statefile.json");

        let store = StateStore::open(&path).unwrap();
        assert!(store.get("/var/log/app.log").is_none());

        let contents = fs::read_to_string(&path).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert!(doc["states"].as_object().unwrap().is_empty());
        assert_eq!(doc["version"].as_str().unwrap(), crate::version());
    }

    #[test]
    fn roundtrip_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("statefile.json");

        {
            let store = StateStore::open(&path).unwrap();
            store.update_state("/var/log/app.log", 12345, 678);
            store.persist().unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        assert_eq!(
            store.get("/var/log/app.log"),
            Some(FileState {
                checksum: 12345,
                offset: 678
            })
        );
    }

    #[test]
    fn on_disk_field_names_are_stable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("statefile.json");

        let store = StateStore::open(&path).unwrap();
        store.update_state("/var/log/app.log", 42, 1024);
        store.persist().unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&contents).unwrap();
        let entry = &doc["states"]["/var/log/app.log"];
        assert_eq!(entry["Checksum"].as_u64().unwrap(), 42);
        assert_eq!(entry["Offset"].as_u64().unwrap(), 1024);
    }

    #[test]
    fn unparseable_statefile_becomes_empty_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("statefile.json");
        fs::write(&path, "{\"version\": \"0.1").unwrap(); // torn write

        let store = StateStore::open(&path).unwrap();
        assert!(store.get("/var/log/app.log").is_none());

        // The file on disk was rewritten as a valid empty document.
        let contents = fs::read_to_string(&path).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert!(doc["states"].as_object().unwrap().is_empty());
    }

    #[test]
    fn null_states_field_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("statefile.json");
        fs::write(&path, "{\"version\": \"0.5.0\", \"states\": null}").unwrap();

        let store = StateStore::open(&path).unwrap();
        assert!(store.get("/var/log/app.log").is_none());

        // Version from the document is preserved.
        store.persist().unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(doc["version"].as_str().unwrap(), "0.5.0");
    }

    #[test]
    fn update_offset_requires_existing_entry() {
        let store = StateStore::in_memory();
        assert!(store.update_offset("/var/log/app.log", 10).is_err());
        assert!(store.update_checksum("/var/log/app.log", 1).is_err());

        store.update_state("/var/log/app.log", 1, 0);
        store.update_offset("/var/log/app.log", 10).unwrap();
        store.update_checksum("/var/log/app.log", 2).unwrap();
        assert_eq!(
            store.get("/var/log/app.log"),
            Some(FileState {
                checksum: 2,
                offset: 10
            })
        );
    }

    #[test]
    fn delete_removes_entry() {
        let store = StateStore::in_memory();
        store.update_state("/var/log/app.log", 1, 2);
        store.delete("/var/log/app.log");
        assert!(store.get("/var/log/app.log").is_none());
    }

    #[test]
    fn legacy_statefile_is_imported_and_removed() {
        let dir = TempDir::new().unwrap();
        let legacy = dir.path().join("app.log-state.json");
        fs::write(&legacy, "{\"Checksum\": 99, \"Offset\": 4096}").unwrap();

        let store = StateStore::in_memory().with_legacy_dir(dir.path());
        let state = store.load_state("/var/log/app.log").unwrap();
        assert_eq!(state.checksum, 99);
        assert_eq!(state.offset, 4096);

        // Imported into the global map, legacy file gone.
        assert!(store.get("/var/log/app.log").is_some());
        assert!(!legacy.exists());
    }

    #[test]
    fn corrupt_legacy_statefile_is_ignored() {
        let dir = TempDir::new().unwrap();
        let legacy = dir.path().join("app.log-state.json");
        fs::write(&legacy, "not json").unwrap();

        let store = StateStore::in_memory().with_legacy_dir(dir.path());
        assert!(store.load_state("/var/log/app.log").is_none());
        // Unreadable legacy files are left in place for inspection.
        assert!(legacy.exists());
    }
}
