//! Reference [`StorageHandler`] over a local directory. Not part of the
//! abstract contract — concrete handlers are external collaborators — but
//! provided so the daemon binary and integration tests have something
//! runnable.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, oneshot};
use walkdir::WalkDir;

use crate::error::SyncError;
use crate::storage::{File, FileProperties, ProgressCallback, PutHandle, StorageEvent, StorageHandler};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const COPY_CHUNK_BYTES: usize = 1 << 16;

/// Local-directory handler. `root` is treated as the storage's entire
/// namespace: file names are paths relative to it, always using `/`.
pub struct LocalFsHandler {
    id: String,
    root: PathBuf,
    /// Where this handler pulls bytes from when acting as a copy target.
    /// A real target handler (SMB, object store) knows how to fetch a named
    /// file from whatever upstream it mirrors; this reference handler models
    /// that as a second local directory fixed at construction time.
    pull_from: Option<PathBuf>,
    events: broadcast::Sender<StorageEvent>,
}

impl LocalFsHandler {
    pub fn new(id: impl Into<String>, root: PathBuf) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            id: id.into(),
            root,
            pull_from: None,
            events,
        }
    }

    /// Construct a handler that mirrors `pull_from` into `root`: `put_file`
    /// reads each file's bytes from `pull_from` rather than `root` itself.
    pub fn with_source(id: impl Into<String>, root: PathBuf, pull_from: PathBuf) -> Self {
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            id: id.into(),
            root,
            pull_from: Some(pull_from),
            events,
        }
    }

    fn absolute(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Test/daemon hook: inject a filesystem change as a `StorageEvent`, as a
    /// real handler's watcher thread would. Silently drops the event if
    /// there are no subscribers.
    pub fn notify(&self, event: StorageEvent) {
        let _ = self.events.send(event);
    }
}

async fn properties_for(path: &std::path::Path) -> Result<FileProperties, SyncError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|err| SyncError::retryable(format!("stat {} failed: {err}", path.display())))?;
    let modified: Option<DateTime<Utc>> = meta.modified().ok().map(DateTime::<Utc>::from);
    Ok(FileProperties {
        size: meta.len(),
        modified,
    })
}

#[async_trait]
impl StorageHandler for LocalFsHandler {
    fn id(&self) -> &str {
        &self.id
    }

    async fn get_all_files(&self) -> Result<Vec<File>, SyncError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            for entry in WalkDir::new(&root).follow_links(false).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = match entry.path().strip_prefix(&root) {
                    Ok(rel) => rel,
                    Err(_) => continue,
                };
                let name = rel.to_string_lossy().replace('\\', "/");
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                files.push(File::new(name, size));
            }
            files
        })
        .await
        .map_err(|err| SyncError::fatal(format!("enumeration task panicked: {err}")))
    }

    async fn get_file(&self, name: &str) -> Result<File, SyncError> {
        let path = self.absolute(name);
        if !path.is_file() {
            return Err(SyncError::no_retry(format!("{name} does not exist in storage {}", self.id)));
        }
        let properties = properties_for(&path).await?;
        Ok(File {
            name: name.to_string(),
            properties,
        })
    }

    async fn put_file(&self, file: &File, on_progress: ProgressCallback) -> Result<PutHandle, SyncError> {
        let source = self.pull_from.as_ref().map(|root| root.join(&file.name));
        self.put_file_from(file, source, on_progress).await
    }

    async fn delete_file(&self, file: &File) -> Result<(), SyncError> {
        let path = self.absolute(&file.name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(SyncError::no_retry(format!("{} already absent from storage {}", file.name, self.id)))
            }
            Err(err) => Err(SyncError::retryable(format!("delete {} failed: {err}", path.display()))),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}

impl LocalFsHandler {
    /// Copy `file` in from `source_path` (defaulting to `self.pull_from`
    /// joined with `file.name`, or `self.root` joined with `file.name` if
    /// neither is set), reporting progress in `[0, 1]` and honouring
    /// cancellation.
    pub async fn put_file_from(
        &self,
        file: &File,
        source_path: Option<PathBuf>,
        on_progress: ProgressCallback,
    ) -> Result<PutHandle, SyncError> {
        let source = source_path.unwrap_or_else(|| self.root.join(&file.name));
        let dest = self.absolute(&file.name);
        let cancelled = Arc::new(AtomicBool::new(false));
        let cancel_flag = Arc::clone(&cancelled);

        let (result_tx, result_rx) = oneshot::channel();
        let total = file.properties.size.max(1);

        tokio::spawn(async move {
            let result = copy_with_progress(&source, &dest, total, &cancelled, on_progress).await;
            let _ = result_tx.send(result);
        });

        let cancel_fn: crate::storage::AbortCallback = Arc::new(move || {
            cancel_flag.store(true, Ordering::SeqCst);
        });

        Ok(PutHandle::new(cancel_fn, result_rx))
    }
}

async fn copy_with_progress(
    source: &std::path::Path,
    dest: &std::path::Path,
    total: u64,
    cancelled: &AtomicBool,
    on_progress: ProgressCallback,
) -> Result<(), SyncError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| SyncError::retryable(format!("create_dir_all {} failed: {err}", parent.display())))?;
    }

    let mut src = tokio::fs::File::open(source)
        .await
        .map_err(|err| SyncError::retryable(format!("open {} failed: {err}", source.display())))?;
    let mut dst = tokio::fs::File::create(dest)
        .await
        .map_err(|err| SyncError::retryable(format!("create {} failed: {err}", dest.display())))?;

    let mut buf = vec![0u8; COPY_CHUNK_BYTES];
    let mut copied: u64 = 0;

    loop {
        if cancelled.load(Ordering::SeqCst) {
            drop(dst);
            let _ = tokio::fs::remove_file(dest).await;
            return Err(SyncError::no_retry("copy cancelled"));
        }

        let n = src
            .read(&mut buf)
            .await
            .map_err(|err| SyncError::retryable(format!("read {} failed: {err}", source.display())))?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n])
            .await
            .map_err(|err| SyncError::retryable(format!("write {} failed: {err}", dest.display())))?;

        copied += n as u64;
        on_progress(copied as f64 / total as f64);
    }

    dst.flush()
        .await
        .map_err(|err| SyncError::retryable(format!("flush {} failed: {err}", dest.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn get_all_files_lists_nested_entries_with_forward_slashes() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.mov"), b"hello").unwrap();
        std::fs::write(dir.path().join("sub").join("b.mov"), b"world").unwrap();

        let handler = LocalFsHandler::new("src", dir.path().to_path_buf());
        let mut files = handler.get_all_files().await.unwrap();
        files.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "a.mov");
        assert_eq!(files[1].name, "sub/b.mov");
    }

    #[tokio::test]
    async fn get_file_fails_rather_than_returning_none_for_missing_file() {
        let dir = tempdir().unwrap();
        let handler = LocalFsHandler::new("src", dir.path().to_path_buf());
        let err = handler.get_file("missing.mov").await.unwrap_err();
        assert!(err.is_already_satisfied());
    }

    #[tokio::test]
    async fn put_file_from_copies_bytes_and_reports_full_progress() {
        let src_dir = tempdir().unwrap();
        let dest_dir = tempdir().unwrap();
        let src_path = src_dir.path().join("a.mov");
        std::fs::write(&src_path, vec![7u8; 1 << 17]).unwrap();

        let handler = LocalFsHandler::new("dest", dest_dir.path().to_path_buf());
        let file = File::new("a.mov", 1 << 17);
        let seen_final = Arc::new(AtomicBool::new(false));
        let seen_final_clone = Arc::clone(&seen_final);
        let on_progress: ProgressCallback = Arc::new(move |v| {
            if v >= 1.0 {
                seen_final_clone.store(true, Ordering::SeqCst);
            }
        });

        let handle = handler.put_file_from(&file, Some(src_path), on_progress).await.unwrap();
        handle.wait().await.unwrap();

        assert!(seen_final.load(Ordering::SeqCst));
        let copied = std::fs::read(dest_dir.path().join("a.mov")).unwrap();
        assert_eq!(copied.len(), 1 << 17);
    }

    #[tokio::test]
    async fn cancel_during_copy_removes_partial_file() {
        let src_dir = tempdir().unwrap();
        let dest_dir = tempdir().unwrap();
        let src_path = src_dir.path().join("big.mov");
        std::fs::write(&src_path, vec![1u8; 8 * (1 << 16)]).unwrap();

        let handler = LocalFsHandler::new("dest", dest_dir.path().to_path_buf());
        let file = File::new("big.mov", 8 * (1 << 16));
        let on_progress: ProgressCallback = Arc::new(|_| {});

        let handle = handler.put_file_from(&file, Some(src_path), on_progress).await.unwrap();
        handle.cancel();
        let result = handle.wait().await;
        assert!(result.is_err());
        assert!(!dest_dir.path().join("big.mov").exists());
    }

    #[tokio::test]
    async fn delete_missing_file_is_no_retry() {
        let dir = tempdir().unwrap();
        let handler = LocalFsHandler::new("dest", dir.path().to_path_buf());
        let file = File::new("missing.mov", 0);
        let err = handler.delete_file(&file).await.unwrap_err();
        assert!(err.is_already_satisfied());
    }
}
