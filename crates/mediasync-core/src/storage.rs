//! Storage handler interface and the value types that flow across it:
//! [`File`], [`StorageEvent`], [`StorageObject`].
//!
//! The handler itself is an external collaborator — concrete implementations
//! (SMB, object store) live outside this crate.
//! [`crate::local_fs::LocalFsHandler`] is a reference implementation kept
//! here only to make the daemon binary and integration tests runnable.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, oneshot};

use crate::error::SyncError;

/// Metadata exposed by a [`File`]; deliberately minimal — the contract only
/// needs `size` for the size-based skip in the watch-folder generator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileProperties {
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// A file within a storage. Identity is `name`, a path unique within its
/// storage. Immutable once observed — a later size/mtime change is modelled
/// as a fresh `File` value, never a mutation of this one.
#[derive(Debug, Clone, PartialEq)]
pub struct File {
    pub name: String,
    pub properties: FileProperties,
}

impl File {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            properties: FileProperties {
                size,
                modified: None,
            },
        }
    }
}

impl fmt::Display for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.name, self.properties.size)
    }
}

/// Discriminant for [`StorageEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageEventKind {
    Add,
    Change,
    Delete,
}

/// An event raised by a storage handler. `file` is present on `Add`/`Change`
/// and absent on `Delete` — callers address the deleted file purely by
/// `path`, since the handler may no longer be able to stat it.
#[derive(Debug, Clone)]
pub struct StorageEvent {
    pub kind: StorageEventKind,
    pub path: String,
    pub file: Option<File>,
}

impl StorageEvent {
    pub fn add(file: File) -> Self {
        Self {
            kind: StorageEventKind::Add,
            path: file.name.clone(),
            file: Some(file),
        }
    }

    pub fn change(file: File) -> Self {
        Self {
            kind: StorageEventKind::Change,
            path: file.name.clone(),
            file: Some(file),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            kind: StorageEventKind::Delete,
            path: path.into(),
            file: None,
        }
    }
}

/// Progress callback passed into [`StorageHandler::put_file`]. Workers clamp
/// and debounce before calling this; handlers just invoke it as bytes move.
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// A single registered cancel callback, per the "single-slot abort handler"
/// design note: one per in-flight step, safe to invoke from any thread.
pub type AbortCallback = Arc<dyn Fn() + Send + Sync>;

/// Handle returned by `put_file`. `cancel()` is safe to call concurrently
/// with the transfer settling; a cancel raced against completion is not an
/// error on either side. `wait()` resolves once the transfer finishes,
/// successfully or not.
pub struct PutHandle {
    cancel_fn: AbortCallback,
    result_rx: oneshot::Receiver<Result<(), SyncError>>,
}

impl PutHandle {
    pub fn new(cancel_fn: AbortCallback, result_rx: oneshot::Receiver<Result<(), SyncError>>) -> Self {
        Self {
            cancel_fn,
            result_rx,
        }
    }

    pub fn cancel_callback(&self) -> AbortCallback {
        Arc::clone(&self.cancel_fn)
    }

    pub fn cancel(&self) {
        (self.cancel_fn)();
    }

    pub async fn wait(self) -> Result<(), SyncError> {
        match self.result_rx.await {
            Ok(result) => result,
            Err(_) => Err(SyncError::fatal("put_file worker dropped without a result")),
        }
    }
}

/// Abstracts one storage endpoint: enumerate, fetch, put with progress,
/// delete, emit events. Implementations must be safe under concurrent
/// invocation for *different* files.
#[async_trait]
pub trait StorageHandler: Send + Sync {
    fn id(&self) -> &str;

    async fn get_all_files(&self) -> Result<Vec<File>, SyncError>;

    /// Fails (rather than returning `Ok(None)`) if the file is absent — the
    /// watch-folder generator relies on this to coerce "target missing"
    /// into "copy it".
    async fn get_file(&self, name: &str) -> Result<File, SyncError>;

    async fn put_file(&self, file: &File, on_progress: ProgressCallback) -> Result<PutHandle, SyncError>;

    async fn delete_file(&self, file: &File) -> Result<(), SyncError>;

    /// Subscribe to this handler's add/change/delete events. Re-entrant:
    /// multiple subscribers may be registered concurrently.
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;
}

/// Per-storage options; currently just the scanner path prefix.
#[derive(Debug, Clone, Default)]
pub struct StorageOptions {
    pub media_path: Option<String>,
}

/// A configured storage endpoint: its handler plus watch-folder policy
/// flags. `watch_folder_target_id`, when `watch_folder` is true, must
/// resolve to another `StorageObject` in the same configured set.
#[derive(Clone)]
pub struct StorageObject {
    pub id: String,
    pub handler: Arc<dyn StorageHandler>,
    pub watch_folder: bool,
    pub watch_folder_target_id: Option<String>,
    pub options: StorageOptions,
}

impl fmt::Debug for StorageObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageObject")
            .field("id", &self.id)
            .field("watch_folder", &self.watch_folder)
            .field("watch_folder_target_id", &self.watch_folder_target_id)
            .finish()
    }
}
