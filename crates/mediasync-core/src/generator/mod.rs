//! Generator base: routes storage events to a policy's add/change/delete
//! hooks and drives the initial-scan reconciliation. A struct holding a
//! policy object, composition in place of an inheritance chain.

pub mod watch_folder;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::storage::{StorageEvent, StorageEventKind, StorageObject};
use crate::tracked_media::{TrackedMediaIndex, TrackedMediaItem};
use crate::workflow::WorkFlow;

/// Emitted upward: a produced work-flow, or an observability log line.
#[derive(Debug, Clone)]
pub enum GeneratorEvent {
    NewWorkflow(WorkFlow),
    Debug(String),
    Warn(String),
    Error(String),
}

/// Shared context handed to every policy hook: the tracked-media index, the
/// upward event sink, and a lookup of every configured storage by id (so a
/// policy can resolve a `watchFolderTargetId` or a TMI's `targetStorageIds`
/// without holding its own copy of the full storage set).
pub struct GeneratorContext {
    pub tracked_media: Arc<dyn TrackedMediaIndex>,
    events: mpsc::UnboundedSender<GeneratorEvent>,
    storages: HashMap<String, StorageObject>,
}

impl GeneratorContext {
    pub fn resolve(&self, storage_id: &str) -> Option<&StorageObject> {
        self.storages.get(storage_id)
    }

    pub fn emit_workflow(&self, flow: WorkFlow) {
        let _ = self.events.send(GeneratorEvent::NewWorkflow(flow));
    }

    pub fn debug(&self, message: impl Into<String>) {
        let _ = self.events.send(GeneratorEvent::Debug(message.into()));
    }

    pub fn warn(&self, message: impl Into<String>) {
        let _ = self.events.send(GeneratorEvent::Warn(message.into()));
    }

    pub fn error(&self, message: impl Into<String>) {
        let _ = self.events.send(GeneratorEvent::Error(message.into()));
    }

    /// `registerFile`: create and persist a TMI for a freshly observed file.
    pub async fn register_file(&self, file_name: &str, source_storage_id: &str) -> Result<(), crate::error::SyncError> {
        let tmi = TrackedMediaItem::new(file_name, source_storage_id, Utc::now());
        self.tracked_media.put(tmi).await
    }
}

/// The four hooks a concrete reconciliation policy implements.
/// `initial_scan` is true only for events synthesised by `initial_check`.
#[async_trait]
pub trait GeneratorPolicy: Send + Sync {
    async fn on_add(&self, ctx: &GeneratorContext, storage: &StorageObject, event: StorageEvent, initial_scan: bool);
    async fn on_change(&self, ctx: &GeneratorContext, storage: &StorageObject, event: StorageEvent, initial_scan: bool);
    async fn on_delete(&self, ctx: &GeneratorContext, storage: &StorageObject, event: StorageEvent);
}

/// Drives one or more watched storages through a [`GeneratorPolicy`].
pub struct Generator {
    ctx: Arc<GeneratorContext>,
    policy: Arc<dyn GeneratorPolicy>,
    watched: Vec<StorageObject>,
    tasks: Vec<JoinHandle<()>>,
}

impl Generator {
    pub fn new(
        all_storages: Vec<StorageObject>,
        tracked_media: Arc<dyn TrackedMediaIndex>,
        policy: Arc<dyn GeneratorPolicy>,
    ) -> (Self, mpsc::UnboundedReceiver<GeneratorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let storages = all_storages.iter().map(|s| (s.id.clone(), s.clone())).collect();
        let ctx = Arc::new(GeneratorContext {
            tracked_media,
            events,
            storages,
        });
        let generator = Self {
            ctx,
            policy,
            watched: all_storages.into_iter().filter(|s| s.watch_folder).collect(),
            tasks: Vec::new(),
        };
        (generator, rx)
    }

    /// `init()`: select the configured watch-folder storages and register
    /// each. Consumes the generator's watched-storage list.
    pub async fn init(&mut self) {
        let watched = std::mem::take(&mut self.watched);
        for storage in watched {
            self.register_storage(storage).await;
        }
    }

    pub fn destroy(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    /// Exposes the shared context for tests that exercise a policy hook
    /// directly without going through `init()`'s subscription loop.
    #[doc(hidden)]
    pub fn ctx_for_test(&self) -> Arc<GeneratorContext> {
        Arc::clone(&self.ctx)
    }

    /// Subscribe to `storage`'s events, spawn the routing loop, then run
    /// the initial reconciliation scan.
    async fn register_storage(&mut self, storage: StorageObject) {
        let mut subscription = storage.handler.subscribe();
        let ctx = Arc::clone(&self.ctx);
        let policy = Arc::clone(&self.policy);
        let storage_for_loop = storage.clone();

        let task = tokio::spawn(async move {
            loop {
                match subscription.recv().await {
                    Ok(event) => route_event(&ctx, &policy, &storage_for_loop, event, false).await,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        ctx.warn(format!("storage {} event subscription lagged by {n}", storage_for_loop.id));
                    }
                }
            }
        });
        self.tasks.push(task);

        initial_check(&self.ctx, &self.policy, &storage).await;
    }
}

async fn route_event(
    ctx: &Arc<GeneratorContext>,
    policy: &Arc<dyn GeneratorPolicy>,
    storage: &StorageObject,
    event: StorageEvent,
    initial_scan: bool,
) {
    match event.kind {
        StorageEventKind::Add => policy.on_add(ctx, storage, event, initial_scan).await,
        StorageEventKind::Change => policy.on_change(ctx, storage, event, initial_scan).await,
        StorageEventKind::Delete => policy.on_delete(ctx, storage, event).await,
    }
}

/// Full reconciliation at start-up. `initial_scan_time` is captured once,
/// before enumeration, so that a slow per-file persist cannot make its own
/// TMI look stale to the sweep that follows.
async fn initial_check(ctx: &Arc<GeneratorContext>, policy: &Arc<dyn GeneratorPolicy>, storage: &StorageObject) {
    let initial_scan_time = Utc::now();

    let Some(target_id) = storage.watch_folder_target_id.clone() else {
        ctx.error(format!("storage {} is a watch folder with no target configured", storage.id));
        return;
    };
    if ctx.resolve(&target_id).is_none() {
        ctx.error(format!("storage {} targets unknown storage {target_id}", storage.id));
        return;
    }

    let files = match storage.handler.get_all_files().await {
        Ok(files) => files,
        Err(err) => {
            ctx.error(format!("initial scan of {} failed to enumerate: {err}", storage.id));
            return;
        }
    };

    let per_file = files.into_iter().map(|file| {
        let ctx = Arc::clone(ctx);
        let policy = Arc::clone(policy);
        let storage = storage.clone();
        async move {
            reconcile_one_file(&ctx, &policy, &storage, file, initial_scan_time).await;
        }
    });
    join_all(per_file).await;

    let stale = match ctx
        .tracked_media
        .get_all_from_storage_stale(&storage.id, initial_scan_time)
        .await
    {
        Ok(stale) => stale,
        Err(err) => {
            ctx.error(format!("stale sweep for {} failed: {err}", storage.id));
            return;
        }
    };
    for tmi in stale {
        let event = StorageEvent::delete(tmi.name.clone());
        policy.on_delete(ctx, storage, event).await;
    }
}

async fn reconcile_one_file(
    ctx: &Arc<GeneratorContext>,
    policy: &Arc<dyn GeneratorPolicy>,
    storage: &StorageObject,
    file: crate::storage::File,
    initial_scan_time: chrono::DateTime<Utc>,
) {
    let existing = ctx.tracked_media.get_by_id(&file.name).await;
    match existing {
        Ok(Some(tmi)) if tmi.source_storage_id == storage.id => {
            let target_id = storage.watch_folder_target_id.clone();
            let tmi_name = tmi.name.clone();
            let _ = ctx
                .tracked_media
                .upsert(
                    &tmi_name,
                    Box::new(move |existing| {
                        existing.map(|mut tmi| {
                            tmi.last_seen = initial_scan_time;
                            tmi
                        })
                    }),
                )
                .await;

            if let Some(target_id) = target_id {
                if let Some(target) = ctx.resolve(&target_id) {
                    if let Err(err) = target.handler.get_file(&tmi_name).await {
                        ctx.warn(format!("initial scan: mirror missing for {tmi_name} on {target_id}: {err}"));
                    }
                }
            }
        }
        Ok(Some(_)) => {
            // Tracked from a different source storage; not this generator's concern.
        }
        Ok(None) => {
            let event = StorageEvent::add(file);
            policy.on_add(ctx, storage, event, true).await;
        }
        Err(err) => {
            ctx.error(format!("initial scan: TMI lookup for {} failed: {err}", file.name));
        }
    }
}
