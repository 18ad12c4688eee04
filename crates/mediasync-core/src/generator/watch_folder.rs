//! Watch-folder generator: the concrete reconciliation policy that makes a
//! target storage mirror a watched source.

use async_trait::async_trait;

use super::{GeneratorContext, GeneratorPolicy};
use crate::storage::{File, StorageEvent, StorageObject};
use crate::workflow::WorkFlow;

pub struct WatchFolderPolicy;

impl WatchFolderPolicy {
    pub fn new() -> Self {
        Self
    }

    /// Add and change are handled identically.
    async fn handle_add_or_change(&self, ctx: &GeneratorContext, storage: &StorageObject, event: StorageEvent) {
        let Some(target_id) = storage.watch_folder_target_id.as_deref() else {
            ctx.error(format!("storage {} is a watch folder with no target configured", storage.id));
            return;
        };
        let Some(target) = ctx.resolve(target_id) else {
            ctx.error(format!("storage {} targets unknown storage {target_id}", storage.id));
            return;
        };

        let Some(local_file) = event.file else {
            ctx.error(format!("add/change event for {} carried no file", event.path));
            return;
        };

        match ctx.tracked_media.get_by_id(&event.path).await {
            Ok(Some(_)) => ctx.debug(format!("{} already tracked", event.path)),
            Ok(None) => {
                if let Err(err) = ctx.register_file(&local_file.name, &storage.id).await {
                    ctx.error(format!("failed to register {}: {err}", local_file.name));
                    return;
                }
            }
            Err(err) => {
                ctx.error(format!("TMI lookup for {} failed: {err}", event.path));
                return;
            }
        }

        let should_copy = match target.handler.get_file(&local_file.name).await {
            Err(_) => true,
            Ok(remote_file) => remote_file.properties.size != local_file.properties.size,
        };

        if should_copy {
            let flow = WorkFlow::copy(local_file, target.clone());
            ctx.emit_workflow(flow);
        }
    }
}

impl Default for WatchFolderPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GeneratorPolicy for WatchFolderPolicy {
    async fn on_add(&self, ctx: &GeneratorContext, storage: &StorageObject, event: StorageEvent, _initial_scan: bool) {
        self.handle_add_or_change(ctx, storage, event).await;
    }

    async fn on_change(&self, ctx: &GeneratorContext, storage: &StorageObject, event: StorageEvent, _initial_scan: bool) {
        self.handle_add_or_change(ctx, storage, event).await;
    }

    async fn on_delete(&self, ctx: &GeneratorContext, storage: &StorageObject, event: StorageEvent) {
        let tmi = match ctx.tracked_media.get_by_id(&event.path).await {
            Ok(Some(tmi)) => tmi,
            Ok(None) => {
                ctx.debug(format!("untracked file deleted: {}", event.path));
                return;
            }
            Err(err) => {
                ctx.error(format!("TMI lookup for {} failed: {err}", event.path));
                return;
            }
        };

        if tmi.source_storage_id != storage.id {
            // Event came from a non-source storage; sibling target mutations are
            // ignored. TODO: regenerate from the true source (unimplemented, per
            // the originating system).
            return;
        }

        for target_id in &tmi.target_storage_ids {
            let Some(target) = ctx.resolve(target_id) else {
                ctx.warn(format!("delete sweep: unknown target storage {target_id} for {}", tmi.name));
                continue;
            };
            match target.handler.get_file(&tmi.name).await {
                Ok(file) => {
                    let flow = WorkFlow::delete(file, target.clone());
                    ctx.emit_workflow(flow);
                }
                Err(err) => {
                    ctx.warn(format!("delete sweep: could not resolve {} on {target_id}: {err}", tmi.name));
                }
            }
        }

        if let Err(err) = ctx.tracked_media.remove(&tmi).await {
            ctx.error(format!("failed to remove TMI for {}: {err}", tmi.name));
        }
    }
}
