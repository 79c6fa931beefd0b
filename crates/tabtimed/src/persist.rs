//! Persistence of the tracker snapshot.
//!
//! The whole `TrackerSnapshot` is one JSON document. Writes go through a
//! dedicated task fed by an unbounded channel, so they are ordered and never
//! block the tracker actor. Queued snapshots are coalesced to the newest one
//! before each write.
//!
//! # Panic-Free Guarantees
//!
//! Write failures are logged and reported to `flush` callers. The in-memory
//! state stays authoritative.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tabtime_core::TrackerSnapshot;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt state file {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("last write failed: {0}")]
    WriteFailed(String),

    #[error("persister stopped")]
    ChannelClosed,
}

impl PersistError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

// ============================================================================
// State File
// ============================================================================

/// The on-disk snapshot document.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn corrupt_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".corrupt");
        PathBuf::from(name)
    }

    /// Reads the snapshot. A missing file yields `Ok(None)`.
    pub fn load(&self) -> Result<Option<TrackerSnapshot>, PersistError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PersistError::io(&self.path, e)),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| PersistError::Corrupt {
                path: self.path.clone(),
                source,
            })
    }

    /// Reads the snapshot, moving a corrupt file aside instead of failing.
    pub fn load_or_recover(&self) -> Result<Option<TrackerSnapshot>, PersistError> {
        match self.load() {
            Err(PersistError::Corrupt { path, source }) => {
                let aside = self.corrupt_path();
                warn!(
                    path = %path.display(),
                    moved_to = %aside.display(),
                    error = %source,
                    "State file is corrupt, starting from defaults"
                );
                std::fs::rename(&path, &aside).map_err(|e| PersistError::io(&path, e))?;
                Ok(None)
            }
            other => other,
        }
    }

    /// Writes the snapshot atomically (temp file, then rename).
    pub async fn save(&self, snapshot: &TrackerSnapshot) -> Result<(), PersistError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| PersistError::io(parent, e))?;
            }
        }

        let temp = self.temp_path();
        tokio::fs::write(&temp, &bytes)
            .await
            .map_err(|e| PersistError::io(&temp, e))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| PersistError::io(&self.path, e))?;

        debug!(path = %self.path.display(), bytes = bytes.len(), "Snapshot written");
        Ok(())
    }
}

// ============================================================================
// Persister Task
// ============================================================================

#[derive(Debug)]
pub enum PersistCommand {
    Save(Box<TrackerSnapshot>),
    /// Acknowledged once every earlier save has been written.
    Flush(oneshot::Sender<Result<(), String>>),
}

/// Cheap-to-clone sender for the persister task.
#[derive(Debug, Clone)]
pub struct PersistHandle {
    sender: mpsc::UnboundedSender<PersistCommand>,
}

impl PersistHandle {
    /// A handle whose writes go nowhere. `flush` reports `ChannelClosed`.
    pub fn disconnected() -> Self {
        let (sender, _) = mpsc::unbounded_channel();
        Self { sender }
    }

    /// Queues a snapshot for writing. Fire-and-forget.
    pub fn save(&self, snapshot: TrackerSnapshot) {
        if self
            .sender
            .send(PersistCommand::Save(Box::new(snapshot)))
            .is_err()
        {
            debug!("Persister stopped, snapshot dropped");
        }
    }

    /// Waits until every queued snapshot has been written.
    pub async fn flush(&self) -> Result<(), PersistError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PersistCommand::Flush(tx))
            .map_err(|_| PersistError::ChannelClosed)?;

        rx.await
            .map_err(|_| PersistError::ChannelClosed)?
            .map_err(PersistError::WriteFailed)
    }
}

/// Spawns the persister task for `file`.
///
/// The task exits once every `PersistHandle` is dropped.
pub fn spawn_persister(file: StateFile) -> (PersistHandle, JoinHandle<()>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_persister(file, receiver));
    (PersistHandle { sender }, task)
}

async fn run_persister(file: StateFile, mut receiver: mpsc::UnboundedReceiver<PersistCommand>) {
    info!(path = %file.path().display(), "Persister starting");
    let mut last_error: Option<String> = None;

    while let Some(first) = receiver.recv().await {
        let mut pending: Option<Box<TrackerSnapshot>> = None;
        let mut flushes = Vec::new();
        let mut coalesced = 0_usize;

        let mut next = Some(first);
        while let Some(command) = next {
            match command {
                PersistCommand::Save(snapshot) => {
                    if pending.replace(snapshot).is_some() {
                        coalesced += 1;
                    }
                }
                PersistCommand::Flush(respond_to) => flushes.push(respond_to),
            }
            next = receiver.try_recv().ok();
        }

        if let Some(snapshot) = pending {
            if coalesced > 0 {
                debug!(coalesced, "Coalesced queued snapshots");
            }
            match file.save(&snapshot).await {
                Ok(()) => last_error = None,
                Err(e) => {
                    warn!(error = %e, "Failed to persist snapshot");
                    last_error = Some(e.to_string());
                }
            }
        }

        for respond_to in flushes {
            let _ = respond_to.send(last_error.clone().map_or(Ok(()), Err));
        }
    }

    info!("Persister stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tabtime_core::{ExtensionOptions, SessionTracker};
    use tempfile::TempDir;

    fn snapshot_with_localhost(track: bool) -> TrackerSnapshot {
        let tracker = SessionTracker::new(Utc, Utc::now());
        tracker.snapshot(&ExtensionOptions::default().with_localhost(track))
    }

    #[test]
    fn test_missing_file_loads_none() {
        let dir = TempDir::new().unwrap();
        let file = StateFile::new(dir.path().join("state.json"));
        assert!(file.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let file = StateFile::new(dir.path().join("nested").join("state.json"));
        let snapshot = snapshot_with_localhost(true);

        file.save(&snapshot).await.unwrap();

        assert_eq!(file.load().unwrap(), Some(snapshot));
        assert!(!file.temp_path().exists());
    }

    #[test]
    fn test_corrupt_file_is_moved_aside() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let file = StateFile::new(&path);

        assert!(matches!(file.load(), Err(PersistError::Corrupt { .. })));
        assert!(file.load_or_recover().unwrap().is_none());
        assert!(!path.exists());
        assert!(dir.path().join("state.json.corrupt").exists());
    }

    #[tokio::test]
    async fn test_persister_writes_newest_snapshot() {
        let dir = TempDir::new().unwrap();
        let file = StateFile::new(dir.path().join("state.json"));
        let (handle, task) = spawn_persister(file.clone());

        handle.save(snapshot_with_localhost(false));
        handle.save(snapshot_with_localhost(true));
        handle.flush().await.unwrap();

        let loaded = file.load().unwrap().unwrap();
        assert_eq!(
            loaded.ext_options,
            Some(ExtensionOptions::default().with_localhost(true))
        );

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_reports_write_failure() {
        let dir = TempDir::new().unwrap();
        // A directory where the file should be makes the rename fail.
        let path = dir.path().join("state.json");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupant"), b"x").unwrap();

        let (handle, _task) = spawn_persister(StateFile::new(&path));
        handle.save(snapshot_with_localhost(false));

        assert!(matches!(
            handle.flush().await,
            Err(PersistError::WriteFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnected_handle() {
        let handle = PersistHandle::disconnected();
        handle.save(snapshot_with_localhost(false));
        assert!(matches!(
            handle.flush().await,
            Err(PersistError::ChannelClosed)
        ));
    }
}
