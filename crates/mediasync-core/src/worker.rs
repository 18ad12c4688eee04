//! Worker and its single-slot cancel handler.
//!
//! Executes one [`WorkStep`] at a time: copy (with cancel + progress),
//! delete, and scanner operations over polling HTTP, mutating the
//! tracked-media index along the way.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::SyncError;
use crate::scanner::{scanner_file_id, ScannerClient, ScannerOperation};
use crate::storage::{AbortCallback, File, ProgressCallback, StorageObject};
use crate::tracked_media::TrackedMediaIndex;
use crate::workflow::{WorkResult, WorkStep, WorkStepAction, WorkStepStatus};

struct Inner {
    busy: bool,
    warming_up: bool,
    last_begin_step: Option<WorkStepAction>,
    progress: f64,
    abort_handler: Option<AbortCallback>,
    waiters: Vec<oneshot::Sender<WorkResult>>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            busy: false,
            warming_up: false,
            last_begin_step: None,
            progress: 0.0,
            abort_handler: None,
            waiters: Vec::new(),
        }
    }
}

/// Clamp to `[0, 1]` and persist only if strictly greater than the stored
/// value; no-op when the worker is not busy. Shared between `Worker::
/// report_progress` and the `'static` progress callback handed to
/// `put_file`, which only holds an `Arc<Mutex<Inner>>`, not `&Worker`.
fn apply_progress(inner: &Mutex<Inner>, value: f64) {
    let clamped = value.clamp(0.0, 1.0);
    let mut guard = inner.lock();
    if !guard.busy {
        return;
    }
    if clamped > guard.progress {
        guard.progress = clamped;
    }
}

/// Executes work steps one at a time. `busy`/`last_begin_step` are the only
/// fields a dispatcher may read; everything else is private worker state.
pub struct Worker {
    pub id: usize,
    index: Arc<dyn TrackedMediaIndex>,
    scanner: Arc<ScannerClient>,
    inner: Arc<Mutex<Inner>>,
}

impl Worker {
    pub fn new(id: usize, index: Arc<dyn TrackedMediaIndex>, scanner: Arc<ScannerClient>) -> Self {
        Self {
            id,
            index,
            scanner,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// `busy := busy || warming_up`, the externally observed flag.
    pub fn is_busy(&self) -> bool {
        let inner = self.inner.lock();
        inner.busy || inner.warming_up
    }

    /// Only meaningful while `is_busy()` is backed by an in-flight step —
    /// cleared once `do_work` settles.
    pub fn last_begin_step(&self) -> Option<WorkStepAction> {
        self.inner.lock().last_begin_step
    }

    /// idle -> warming_up. Fatal if the worker is already warming or busy —
    /// both are contract violations per the worker's state diagram.
    pub fn warmup(&self) {
        let mut inner = self.inner.lock();
        if inner.warming_up {
            panic!("worker {}: warmup() called on an already-warming worker", self.id);
        }
        if inner.busy {
            panic!("worker {}: warmup() called on a busy worker", self.id);
        }
        inner.warming_up = true;
    }

    /// warming_up -> idle. Safe to call when not warming (no-op).
    pub fn cooldown(&self) {
        self.inner.lock().warming_up = false;
    }

    /// Fires the worker's current abort handler, if any. No return value —
    /// callers observe completion through `wait_until_finished`.
    pub fn try_to_abort(&self) {
        let handler = {
            let inner = self.inner.lock();
            if inner.busy {
                inner.abort_handler.clone()
            } else {
                None
            }
        };
        if let Some(handler) = handler {
            handler();
        }
    }

    /// Clamped to `[0, 1]`; persisted only if strictly greater than the
    /// currently stored value. No-ops when the worker is not busy.
    pub fn report_progress(&self, value: f64) {
        apply_progress(&self.inner, value);
    }

    pub fn progress(&self) -> f64 {
        self.inner.lock().progress
    }

    /// Resolves once the step currently in flight settles, successfully or
    /// not. Multiple concurrent callers are all resolved with the same
    /// result.
    pub async fn wait_until_finished(&self) -> WorkResult {
        let rx = {
            let mut inner = self.inner.lock();
            let (tx, rx) = oneshot::channel();
            inner.waiters.push(tx);
            rx
        };
        rx.await
            .unwrap_or_else(|_| WorkResult::error("worker shut down before the step finished"))
    }

    /// `warming_up -> busy -> idle`. Fatal if the worker is busy, or if
    /// `warmup()` was never called first.
    pub async fn do_work(&self, step: WorkStep) -> WorkResult {
        {
            let mut inner = self.inner.lock();
            if inner.busy {
                panic!("worker {}: do_work() called while busy", self.id);
            }
            if !inner.warming_up {
                panic!("worker {}: do_work() called without a prior warmup()", self.id);
            }
            inner.warming_up = false;
            inner.busy = true;
            inner.last_begin_step = Some(step.action);
            inner.progress = 0.0;
            inner.abort_handler = None;
        }

        let result = self.execute(step).await.unwrap_or_else(|err| WorkResult::error(err.to_string()));

        let waiters = {
            let mut inner = self.inner.lock();
            inner.busy = false;
            inner.last_begin_step = None;
            inner.abort_handler = None;
            std::mem::take(&mut inner.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }

        result
    }

    fn set_abort_handler(&self, handler: Option<AbortCallback>) {
        self.inner.lock().abort_handler = handler;
    }

    async fn execute(&self, step: WorkStep) -> Result<WorkResult, SyncError> {
        match step.action {
            WorkStepAction::Copy => {
                let copy_result = self.do_copy(&step.file, &step.target).await?;
                if !copy_result.is_success() {
                    // Failed copy short-circuits; metadata phase is not invoked.
                    return Ok(copy_result);
                }
                // Cancellation is scoped to the copy phase only.
                self.set_abort_handler(None);
                self.do_generate_metadata(&step.file, &step.target).await
            }
            WorkStepAction::Delete => self.do_delete(&step.file, &step.target).await,
            WorkStepAction::Scan => self.do_generate_metadata(&step.file, &step.target).await,
            WorkStepAction::GenerateMetadata => self.do_generate_advanced_metadata(&step.file, &step.target).await,
            WorkStepAction::GeneratePreview => self.do_generate_preview(&step.file, &step.target).await,
            WorkStepAction::GenerateThumbnail => self.do_generate_thumbnail(&step.file, &step.target).await,
        }
    }

    /// `target.handler.put_file(file, report_progress)`, registering the
    /// returned handle's cancel callback as this worker's single abort
    /// handler. Succeeds by upserting `target.id` into the TMI's
    /// `target_storage_ids` — a no-op if no TMI exists yet (Open Question
    /// #2, preserved as-is).
    async fn do_copy(&self, file: &File, target: &StorageObject) -> Result<WorkResult, SyncError> {
        let worker_id = self.id;
        let inner = Arc::clone(&self.inner);
        let progress_cb: ProgressCallback = Arc::new(move |value: f64| {
            log::debug!("worker {worker_id}: progress {value:.2}");
            apply_progress(&inner, value);
        });

        let handle = match target.handler.put_file(file, progress_cb).await {
            Ok(handle) => handle,
            Err(err) => return Ok(WorkResult::error(err.to_string())),
        };
        self.set_abort_handler(Some(handle.cancel_callback()));

        let put_result = handle.wait().await;
        self.set_abort_handler(None);

        if let Err(err) = put_result {
            return Ok(WorkResult::error(err.to_string()));
        }

        let target_id = target.id.clone();
        self.index
            .upsert(
                &file.name,
                Box::new(move |existing| {
                    existing.map(|mut tmi| {
                        tmi.target_storage_ids.insert(target_id);
                        tmi
                    })
                }),
            )
            .await?;

        Ok(WorkResult::done())
    }

    /// `target.handler.delete_file(file)`, then removes `target.id` from the
    /// TMI's `target_storage_ids`. A 404-equivalent ("already absent")
    /// upsert outcome is treated as success, matching `on_delete` having
    /// already removed the TMI.
    async fn do_delete(&self, file: &File, target: &StorageObject) -> Result<WorkResult, SyncError> {
        if let Err(err) = target.handler.delete_file(file).await {
            if err.is_already_satisfied() {
                return Ok(WorkResult::done());
            }
            return Ok(WorkResult::error(err.to_string()));
        }

        let target_id = target.id.clone();
        let file_name = file.name.clone();
        let worker_id = self.id;
        let upsert_result = self
            .index
            .upsert(
                &file.name,
                Box::new(move |existing| {
                    existing.map(|mut tmi| {
                        if !tmi.target_storage_ids.remove(&target_id) {
                            log::warn!(
                                "worker {worker_id}: delete of {file_name} completed but {target_id} was not tracked"
                            );
                        }
                        tmi
                    })
                }),
            )
            .await;

        match upsert_result {
            Ok(_) => Ok(WorkResult::done()),
            Err(err) if err.is_already_satisfied() => Ok(WorkResult::done()),
            Err(err) => Ok(WorkResult::error(err.to_string())),
        }
    }

    /// `SCAN` work steps and the second phase of a composite `COPY` call
    /// into the `media/scanAsync` endpoint.
    async fn do_generate_metadata(&self, file: &File, target: &StorageObject) -> Result<WorkResult, SyncError> {
        let file_id = scanner_file_id(ScannerOperation::Scan, target.options.media_path.as_deref(), &file.name);
        self.scanner.generate(ScannerOperation::Scan, &file_id).await
    }

    /// `GENERATE_METADATA` work steps call into the dedicated
    /// `metadata/generateAsync` endpoint.
    async fn do_generate_advanced_metadata(&self, file: &File, target: &StorageObject) -> Result<WorkResult, SyncError> {
        let file_id = scanner_file_id(ScannerOperation::Metadata, target.options.media_path.as_deref(), &file.name);
        self.scanner.generate(ScannerOperation::Metadata, &file_id).await
    }

    async fn do_generate_preview(&self, file: &File, target: &StorageObject) -> Result<WorkResult, SyncError> {
        let file_id = scanner_file_id(ScannerOperation::Preview, target.options.media_path.as_deref(), &file.name);
        self.scanner.generate(ScannerOperation::Preview, &file_id).await
    }

    /// Does not gate on `media_scanner.host` being configured before this
    /// call — `ScannerClient::generate` itself handles the unset-host case
    /// uniformly, so the documented inconsistency in the original source
    /// (Open Question #3) has no observable effect here; preserved as a
    /// comment rather than special-cased code.
    async fn do_generate_thumbnail(&self, file: &File, target: &StorageObject) -> Result<WorkResult, SyncError> {
        let file_id = scanner_file_id(ScannerOperation::Thumbnail, target.options.media_path.as_deref(), &file.name);
        self.scanner.generate(ScannerOperation::Thumbnail, &file_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_fs::LocalFsHandler;
    use crate::tracked_media::{InMemoryTrackedMediaIndex, TrackedMediaItem};
    use chrono::Utc;
    use tempfile::tempdir;

    fn target_storage(id: &str, handler: Arc<dyn crate::storage::StorageHandler>) -> StorageObject {
        StorageObject {
            id: id.to_string(),
            handler,
            watch_folder: false,
            watch_folder_target_id: None,
            options: Default::default(),
        }
    }

    #[test]
    #[should_panic(expected = "without a prior warmup")]
    fn do_work_without_warmup_panics() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let index = Arc::new(InMemoryTrackedMediaIndex::spawn(None));
            let scanner = Arc::new(ScannerClient::new(None));
            let worker = Worker::new(0, index, scanner);
            let dest = tempdir().unwrap();
            let handler: Arc<dyn crate::storage::StorageHandler> =
                Arc::new(LocalFsHandler::new("dest", dest.path().to_path_buf()));
            let target = target_storage("dest", handler);
            let step = WorkStep::new(WorkStepAction::Delete, File::new("a.mov", 10), target, 1);
            worker.do_work(step).await;
        });
    }

    #[tokio::test]
    async fn progress_reports_are_monotone() {
        let index = Arc::new(InMemoryTrackedMediaIndex::spawn(None));
        let scanner = Arc::new(ScannerClient::new(None));
        let worker = Worker::new(0, index, scanner);
        worker.warmup();
        {
            let mut inner = worker.inner.lock();
            inner.warming_up = false;
            inner.busy = true;
        }
        worker.report_progress(0.5);
        worker.report_progress(0.2);
        worker.report_progress(0.7);
        assert_eq!(worker.progress(), 0.7);
    }

    #[tokio::test]
    async fn delete_upsert_not_found_is_treated_as_done() {
        let index = Arc::new(InMemoryTrackedMediaIndex::spawn(None));
        let scanner = Arc::new(ScannerClient::new(None));
        let worker = Worker::new(0, Arc::clone(&index) as Arc<dyn TrackedMediaIndex>, scanner);

        let dest = tempdir().unwrap();
        let dest_path = dest.path().join("a.mov");
        std::fs::write(&dest_path, b"hello").unwrap();
        let handler: Arc<dyn crate::storage::StorageHandler> =
            Arc::new(LocalFsHandler::new("dest", dest.path().to_path_buf()));
        let target = target_storage("dest", handler);

        // No TMI tracked for this file at all — the upsert closure returns
        // `None` (untouched) which the worker must still treat as Done.
        let file = File::new("a.mov", 5);
        worker.warmup();
        let result = worker.do_work(WorkStep::new(WorkStepAction::Delete, file, target, 1)).await;
        assert_eq!(result.status, WorkStepStatus::Done);
        assert!(index.get_by_id("a.mov").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn try_to_abort_during_copy_cancels_and_clears_handler_after() {
        let index = Arc::new(InMemoryTrackedMediaIndex::spawn(None));
        let scanner = Arc::new(ScannerClient::new(None));
        let worker = Arc::new(Worker::new(0, index, scanner));

        let src = tempdir().unwrap();
        let src_path = src.path().join("big.mov");
        let size = 64usize * (1 << 16);
        std::fs::write(&src_path, vec![1u8; size]).unwrap();
        let dest = tempdir().unwrap();
        let dest_handler: Arc<dyn crate::storage::StorageHandler> =
            Arc::new(LocalFsHandler::with_source("dest", dest.path().to_path_buf(), src.path().to_path_buf()));
        let target = target_storage("dest", dest_handler);

        let file = File::new("big.mov", size as u64);
        worker.warmup();

        let worker_clone = Arc::clone(&worker);
        let join = tokio::spawn(async move {
            worker_clone.do_work(WorkStep::new(WorkStepAction::Copy, file, target, 1)).await
        });
        tokio::task::yield_now().await;
        worker.try_to_abort();

        let result = join.await.unwrap();
        assert_eq!(result.status, WorkStepStatus::Error);
        assert!(!dest.path().join("big.mov").exists());

        // do_work clears the abort handler once the step settles; a stray
        // abort afterwards is a no-op and leaves the slot empty.
        worker.try_to_abort();
        assert!(worker.inner.lock().abort_handler.is_none());
    }

    #[tokio::test]
    async fn abort_handler_cleared_before_metadata_phase_is_invoked() {
        let index = Arc::new(InMemoryTrackedMediaIndex::spawn(None));
        index.put(TrackedMediaItem::new("a.mov", "src", Utc::now())).await.unwrap();
        let scanner = Arc::new(ScannerClient::new(None));
        let worker = Worker::new(0, Arc::clone(&index) as Arc<dyn TrackedMediaIndex>, scanner);

        let src = tempdir().unwrap();
        std::fs::write(src.path().join("a.mov"), vec![0u8; 10]).unwrap();
        let dest = tempdir().unwrap();
        let dest_handler: Arc<dyn crate::storage::StorageHandler> =
            Arc::new(LocalFsHandler::with_source("dest", dest.path().to_path_buf(), src.path().to_path_buf()));
        let target = target_storage("dest", dest_handler);

        let file = File::new("a.mov", 10);
        worker.warmup();
        let result = worker.do_work(WorkStep::new(WorkStepAction::Copy, file, target, 1)).await;

        // Copy succeeded and handed off to the metadata phase; scanner is
        // unconfigured so that phase reports Skipped rather than Done.
        assert_eq!(result.status, WorkStepStatus::Skipped);

        // The abort handler is cleared before the metadata phase runs, so an
        // abort fired once the step has settled is a safe no-op.
        worker.try_to_abort();
        assert!(worker.inner.lock().abort_handler.is_none());
    }

    #[tokio::test]
    async fn successful_copy_appends_target_to_existing_tmi() {
        let index = Arc::new(InMemoryTrackedMediaIndex::spawn(None));
        index
            .put(TrackedMediaItem::new("a.mov", "src", Utc::now()))
            .await
            .unwrap();
        let scanner = Arc::new(ScannerClient::new(None));
        let worker = Worker::new(0, Arc::clone(&index) as Arc<dyn TrackedMediaIndex>, scanner);

        let src = tempdir().unwrap();
        std::fs::write(src.path().join("a.mov"), vec![0u8; 10]).unwrap();
        let dest = tempdir().unwrap();
        let dest_handler: Arc<dyn crate::storage::StorageHandler> =
            Arc::new(LocalFsHandler::with_source("dest", dest.path().to_path_buf(), src.path().to_path_buf()));
        let target = target_storage("dest", dest_handler);

        let file = File::new("a.mov", 10);
        worker.warmup();
        let result = worker.do_work(WorkStep::new(WorkStepAction::Copy, file, target, 1)).await;
        assert_eq!(result.status, WorkStepStatus::Skipped); // metadata phase skipped: no scanner configured
        let tmi = index.get_by_id("a.mov").await.unwrap().unwrap();
        assert!(tmi.target_storage_ids.contains("dest"));
    }
}
