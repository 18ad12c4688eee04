//! Tracked-media index: the persistent map from file name to replication
//! state. The index itself (a document store with per-key upsert semantics)
//! is an external collaborator; [`InMemoryTrackedMediaIndex`] is a reference
//! implementation, a single-writer actor task backed by a JSON side-car.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::SyncError;

/// The index record for one file across source and targets. Identity is
/// `name`. Invariants (enforced by the generator/worker, not this type):
/// a TMI exists iff the file has been accepted for replication from a
/// source; `source_storage_id` is never a member of `target_storage_ids`;
/// `target_storage_ids` holds exactly the storages where replication has
/// *succeeded*; `last_seen` is monotonically non-decreasing across scans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedMediaItem {
    pub name: String,
    pub source_storage_id: String,
    pub target_storage_ids: HashSet<String>,
    pub last_seen: DateTime<Utc>,
}

impl TrackedMediaItem {
    pub fn new(name: impl Into<String>, source_storage_id: impl Into<String>, last_seen: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            source_storage_id: source_storage_id.into(),
            target_storage_ids: HashSet::new(),
            last_seen,
        }
    }
}

/// A read-modify-write closure passed to [`TrackedMediaIndex::upsert`].
/// Boxed rather than generic so the trait stays object-safe across the
/// actor-channel boundary.
pub type UpsertFn = Box<dyn FnOnce(Option<TrackedMediaItem>) -> Option<TrackedMediaItem> + Send>;

/// `upsert` must be serialisable per-key: concurrent copy completions for
/// the same file must both observe and produce a consistent
/// `target_storage_ids` set.
#[async_trait]
pub trait TrackedMediaIndex: Send + Sync {
    async fn get_by_id(&self, name: &str) -> Result<Option<TrackedMediaItem>, SyncError>;

    async fn put(&self, tmi: TrackedMediaItem) -> Result<(), SyncError>;

    /// Atomic read-modify-write. If `f` returns `None`, no write occurs and
    /// `Ok(None)` is returned.
    async fn upsert(&self, name: &str, f: UpsertFn) -> Result<Option<TrackedMediaItem>, SyncError>;

    async fn remove(&self, tmi: &TrackedMediaItem) -> Result<(), SyncError>;

    /// TMIs tracked from `storage_id` whose `last_seen` is strictly before
    /// `before` — the initial-scan stale-sweep query.
    async fn get_all_from_storage_stale(
        &self,
        storage_id: &str,
        before: DateTime<Utc>,
    ) -> Result<Vec<TrackedMediaItem>, SyncError>;
}

enum IndexCommand {
    GetById {
        name: String,
        reply: oneshot::Sender<Option<TrackedMediaItem>>,
    },
    Put {
        tmi: TrackedMediaItem,
        reply: oneshot::Sender<()>,
    },
    Upsert {
        name: String,
        f: UpsertFn,
        reply: oneshot::Sender<Option<TrackedMediaItem>>,
    },
    Remove {
        name: String,
        reply: oneshot::Sender<()>,
    },
    StaleFromStorage {
        storage_id: String,
        before: DateTime<Utc>,
        reply: oneshot::Sender<Vec<TrackedMediaItem>>,
    },
}

/// In-process tracked-media index. All mutations funnel through a single
/// actor task reading from an `mpsc` channel, which gives the per-key
/// serialisable-upsert property for free — no lock striping or per-key
/// mutex map is needed because there is exactly one writer.
#[derive(Clone)]
pub struct InMemoryTrackedMediaIndex {
    tx: mpsc::UnboundedSender<IndexCommand>,
}

impl InMemoryTrackedMediaIndex {
    /// Spawn the actor. `persist_path`, if set, is a JSON side-car loaded at
    /// start-up and rewritten after every mutation — mirroring
    /// `ChangeTracker::load`/`persist`. Pass `None` for a pure in-memory
    /// index (the common case in tests).
    pub fn spawn(persist_path: Option<PathBuf>) -> Self {
        let initial = match &persist_path {
            Some(path) => load_from_disk(path).unwrap_or_default(),
            None => HashMap::new(),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_actor(initial, persist_path, rx));
        Self { tx }
    }

    fn send(&self, cmd: IndexCommand) -> Result<(), SyncError> {
        self.tx
            .send(cmd)
            .map_err(|_| SyncError::fatal("tracked-media index actor has shut down"))
    }
}

async fn run_actor(
    mut records: HashMap<String, TrackedMediaItem>,
    persist_path: Option<PathBuf>,
    mut rx: mpsc::UnboundedReceiver<IndexCommand>,
) {
    while let Some(cmd) = rx.recv().await {
        let mut dirty = false;
        match cmd {
            IndexCommand::GetById { name, reply } => {
                let _ = reply.send(records.get(&name).cloned());
            }
            IndexCommand::Put { tmi, reply } => {
                records.insert(tmi.name.clone(), tmi);
                dirty = true;
                let _ = reply.send(());
            }
            IndexCommand::Upsert { name, f, reply } => {
                let current = records.get(&name).cloned();
                let updated = f(current);
                match updated.clone() {
                    Some(tmi) => {
                        records.insert(name, tmi);
                        dirty = true;
                    }
                    None => {}
                }
                let _ = reply.send(updated);
            }
            IndexCommand::Remove { name, reply } => {
                if records.remove(&name).is_some() {
                    dirty = true;
                }
                let _ = reply.send(());
            }
            IndexCommand::StaleFromStorage {
                storage_id,
                before,
                reply,
            } => {
                let stale = records
                    .values()
                    .filter(|tmi| tmi.source_storage_id == storage_id && tmi.last_seen < before)
                    .cloned()
                    .collect();
                let _ = reply.send(stale);
            }
        }

        if dirty {
            if let Some(path) = &persist_path {
                if let Err(err) = persist_to_disk(path, &records) {
                    log::warn!("tracked-media index: failed to persist {}: {err}", path.display());
                }
            }
        }
    }
}

fn load_from_disk(path: &std::path::Path) -> Option<HashMap<String, TrackedMediaItem>> {
    let data = std::fs::read(path).ok()?;
    match serde_json::from_slice(&data) {
        Ok(records) => Some(records),
        Err(err) => {
            log::warn!(
                "tracked-media index: failed to parse {} ({err}); starting fresh",
                path.display()
            );
            None
        }
    }
}

fn persist_to_disk(path: &std::path::Path, records: &HashMap<String, TrackedMediaItem>) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec_pretty(records)?;
    std::fs::write(path, data)
}

#[async_trait]
impl TrackedMediaIndex for InMemoryTrackedMediaIndex {
    async fn get_by_id(&self, name: &str) -> Result<Option<TrackedMediaItem>, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(IndexCommand::GetById {
            name: name.to_string(),
            reply,
        })?;
        rx.await
            .map_err(|_| SyncError::fatal("tracked-media index actor dropped reply"))
    }

    async fn put(&self, tmi: TrackedMediaItem) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(IndexCommand::Put { tmi, reply })?;
        rx.await
            .map_err(|_| SyncError::fatal("tracked-media index actor dropped reply"))
    }

    async fn upsert(&self, name: &str, f: UpsertFn) -> Result<Option<TrackedMediaItem>, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(IndexCommand::Upsert {
            name: name.to_string(),
            f,
            reply,
        })?;
        rx.await
            .map_err(|_| SyncError::fatal("tracked-media index actor dropped reply"))
    }

    async fn remove(&self, tmi: &TrackedMediaItem) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(IndexCommand::Remove {
            name: tmi.name.clone(),
            reply,
        })?;
        rx.await
            .map_err(|_| SyncError::fatal("tracked-media index actor dropped reply"))
    }

    async fn get_all_from_storage_stale(
        &self,
        storage_id: &str,
        before: DateTime<Utc>,
    ) -> Result<Vec<TrackedMediaItem>, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(IndexCommand::StaleFromStorage {
            storage_id: storage_id.to_string(),
            before,
            reply,
        })?;
        rx.await
            .map_err(|_| SyncError::fatal("tracked-media index actor dropped reply"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_creates_when_absent_if_fn_returns_some() {
        let index = InMemoryTrackedMediaIndex::spawn(None);
        let now = Utc::now();
        let result = index
            .upsert(
                "a.mov",
                Box::new(move |existing| {
                    assert!(existing.is_none());
                    Some(TrackedMediaItem::new("a.mov", "src", now))
                }),
            )
            .await
            .unwrap();
        assert!(result.is_some());
        assert_eq!(index.get_by_id("a.mov").await.unwrap().unwrap().name, "a.mov");
    }

    #[tokio::test]
    async fn upsert_no_op_leaves_index_untouched() {
        let index = InMemoryTrackedMediaIndex::spawn(None);
        let result = index.upsert("missing.mov", Box::new(|existing| existing)).await.unwrap();
        assert!(result.is_none());
        assert!(index.get_by_id("missing.mov").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_target_appends_do_not_lose_updates() {
        let index = InMemoryTrackedMediaIndex::spawn(None);
        let now = Utc::now();
        index.put(TrackedMediaItem::new("a.mov", "src", now)).await.unwrap();

        let idx_a = index.clone();
        let idx_b = index.clone();
        let h1 = tokio::spawn(async move {
            idx_a
                .upsert(
                    "a.mov",
                    Box::new(|tmi| {
                        let mut tmi = tmi.unwrap();
                        tmi.target_storage_ids.insert("t1".into());
                        Some(tmi)
                    }),
                )
                .await
                .unwrap();
        });
        let h2 = tokio::spawn(async move {
            idx_b
                .upsert(
                    "a.mov",
                    Box::new(|tmi| {
                        let mut tmi = tmi.unwrap();
                        tmi.target_storage_ids.insert("t2".into());
                        Some(tmi)
                    }),
                )
                .await
                .unwrap();
        });
        h1.await.unwrap();
        h2.await.unwrap();

        let tmi = index.get_by_id("a.mov").await.unwrap().unwrap();
        assert_eq!(tmi.target_storage_ids.len(), 2);
    }

    #[tokio::test]
    async fn stale_query_filters_by_storage_and_last_seen() {
        let index = InMemoryTrackedMediaIndex::spawn(None);
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(10);

        index.put(TrackedMediaItem::new("old.mov", "src", t0)).await.unwrap();
        index.put(TrackedMediaItem::new("fresh.mov", "src", t1)).await.unwrap();
        index.put(TrackedMediaItem::new("other.mov", "other-src", t0)).await.unwrap();

        let stale = index.get_all_from_storage_stale("src", t1).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].name, "old.mov");
    }
}
