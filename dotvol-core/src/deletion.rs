//! Deletion lifecycle
//!
//! ```text
//! Live -> SoftDeleted -> Draining -> Reclaimed
//! ```
//!
//! - `Live -> SoftDeleted` is synchronous: a marker `deleted/{id}` is written,
//!   the record is flagged and the name index is released, so the name can be
//!   reused immediately.
//! - `SoftDeleted -> Draining` runs in the background on the deleting node:
//!   all branch, commit and dirty records go in one prefix delete, then the
//!   registry record, then the local snapshots are reclaimed, retrying until
//!   the engine confirms.
//! - `Draining -> Reclaimed`: once the metadata-drain timeout has passed the
//!   marker is removed.
//!
//! Every node watches `deleted/` and reclaims its own copy of the dot's
//! snapshots. A lagging node may still hold old snapshots for a while; it
//! can never serve them under the old name because the new dot has a new id.

use crate::config::{DebugFlag, DebugFlags};
use crate::error::{DotError, Result};
use crate::name::VolumeName;
use crate::registry::{DotRecord, DotState, Registry};
use crate::snapshot::SnapshotEngine;
use crate::store::{keys, list_json, read_json, write_json, CasOutcome, Expect, WatchEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Progress of a deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionState {
    SoftDeleted,
    Draining,
    Reclaimed,
}

/// Marker stored under `deleted/{id}` while a deletion is in flight
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionMarker {
    pub id: Uuid,
    pub name: VolumeName,
    pub state: DeletionState,
    /// Unix milliseconds
    pub deleted_at_ms: i64,
    pub node: String,
}

/// Drives dots from soft deletion to reclamation
pub struct DeletionManager {
    registry: Arc<Registry>,
    engine: Arc<dyn SnapshotEngine>,
    flags: Arc<DebugFlags>,
    node: String,
    metadata_timeout: Duration,
    retry: Duration,
    /// Markers this node has started reclaiming; cleared when the marker goes
    reclaiming: Mutex<HashSet<Uuid>>,
}

impl DeletionManager {
    pub fn new(
        registry: Arc<Registry>,
        engine: Arc<dyn SnapshotEngine>,
        flags: Arc<DebugFlags>,
        node: &str,
        metadata_timeout: Duration,
        retry: Duration,
    ) -> Self {
        Self {
            registry,
            engine,
            flags,
            node: node.to_string(),
            metadata_timeout,
            retry,
            reclaiming: Mutex::new(HashSet::new()),
        }
    }

    /// Mark a live dot deleted and release its name
    ///
    /// Preconditions (existence, ownership, attachments) are the caller's
    /// business and must be checked inside the dot's exclusive section.
    pub async fn soft_delete(&self, mut record: DotRecord, revision: u64) -> Result<DeletionMarker> {
        let marker = DeletionMarker {
            id: record.id,
            name: record.name.clone(),
            state: DeletionState::SoftDeleted,
            deleted_at_ms: chrono::Utc::now().timestamp_millis(),
            node: self.node.clone(),
        };
        let store = self.registry.store();
        match write_json(store, &keys::deleted(&record.id), Expect::Absent, &marker).await? {
            CasOutcome::Applied(_) => {}
            CasOutcome::Conflict(_) => return Err(DotError::NoSuchDot(record.name.to_string())),
        }

        record.state = DotState::SoftDeleted;
        if let Err(e) = self.registry.update(&record, revision).await {
            store.delete(&keys::deleted(&record.id), Expect::Any).await?;
            return Err(e);
        }
        self.registry.release_name(&record).await?;

        tracing::info!("Deleted dot {} ({}), draining in background", record.name, record.id);
        Ok(marker)
    }

    /// Run the drain of `marker` in the background
    pub fn spawn_drain(self: &Arc<Self>, marker: DeletionMarker) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let name = marker.name.clone();
            if let Err(e) = manager.drain(marker).await {
                tracing::error!("Drain of {} stopped: {}", name, e);
            }
        })
    }

    /// Drain a deleted dot to completion
    pub async fn drain(&self, mut marker: DeletionMarker) -> Result<()> {
        let store = self.registry.store();
        let marker_key = keys::deleted(&marker.id);

        if marker.state == DeletionState::SoftDeleted {
            marker.state = DeletionState::Draining;
            write_json(store, &marker_key, Expect::Any, &marker).await?;
            if let Some((mut record, rev)) = self.registry.get(&marker.id).await? {
                record.state = DotState::Draining;
                let key = keys::registry(&record.id);
                if let CasOutcome::Conflict(_) = write_json(store, &key, Expect::Revision(rev), &record).await? {
                    tracing::debug!("Record of {} changed under the drain; leaving it to the prefix delete", marker.name);
                }
            }
        }

        if marker.state == DeletionState::Draining {
            let removed = store.delete_prefix(&keys::dot_data(&marker.id)).await?;
            store.delete(&keys::registry(&marker.id), Expect::Any).await?;
            tracing::debug!("Dropped {} metadata records of {}", removed, marker.name);

            self.reclaim_until_done(&marker.id).await;

            marker.state = DeletionState::Reclaimed;
            write_json(store, &marker_key, Expect::Any, &marker).await?;
        }

        let elapsed = chrono::Utc::now().timestamp_millis() - marker.deleted_at_ms;
        let remaining = self.metadata_timeout.as_millis() as i64 - elapsed;
        if remaining > 0 {
            tokio::time::sleep(Duration::from_millis(remaining as u64)).await;
        }
        store.delete(&marker_key, Expect::Any).await?;
        tracing::info!("Reclaimed dot {} ({})", marker.name, marker.id);
        Ok(())
    }

    async fn reclaim(&self, id: &Uuid) -> Result<()> {
        if self.flags.is_set(DebugFlag::FailDrainReclaim) {
            return Err(DotError::InjectedFault(format!("reclaim of {} refused", id)));
        }
        self.engine.destroy_dot(id).await
    }

    async fn reclaim_until_done(&self, id: &Uuid) {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.reclaim(id).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!("Reclaiming snapshots of {} failed (attempt {}): {}", id, attempt, e);
                    tokio::time::sleep(self.retry).await;
                }
            }
        }
    }

    /// Resume drains left unfinished by a previous run of this node
    pub async fn resume_pending(self: &Arc<Self>) -> Result<usize> {
        let markers = list_json::<DeletionMarker>(self.registry.store(), keys::DELETED).await?;
        let mut resumed = 0;
        for (_, marker, _) in markers {
            if marker.node == self.node {
                tracing::info!("Resuming drain of {} ({:?})", marker.name, marker.state);
                self.spawn_drain(marker);
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    /// Reclaim local snapshots of every dot deleted anywhere in the cluster
    ///
    /// Each marker gets its own reclaim task, started once however often
    /// the marker is rewritten.
    pub fn spawn_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut watcher = manager.registry.store().watch(keys::DELETED);
        tokio::spawn(async move {
            while let Some(event) = watcher.next().await {
                match event {
                    WatchEvent::Put { key, .. } => {
                        match read_json::<DeletionMarker>(manager.registry.store(), &key).await {
                            Ok(Some((marker, _))) => manager.spawn_reclaim(marker).await,
                            Ok(None) => {}
                            Err(e) => tracing::warn!("Unreadable deletion marker {}: {}", key, e),
                        }
                    }
                    WatchEvent::Resync => {
                        match list_json::<DeletionMarker>(manager.registry.store(), keys::DELETED).await {
                            Ok(markers) => {
                                for (_, marker, _) in markers {
                                    manager.spawn_reclaim(marker).await;
                                }
                            }
                            Err(e) => tracing::warn!("Rescan of deletion markers failed: {}", e),
                        }
                    }
                    WatchEvent::Delete { key } => {
                        if let Some(id) = key.strip_prefix(keys::DELETED).and_then(|id| Uuid::parse_str(id).ok()) {
                            manager.reclaiming.lock().await.remove(&id);
                        }
                    }
                }
            }
            tracing::debug!("Deletion watcher on {} stopped", manager.node);
        })
    }

    async fn spawn_reclaim(self: &Arc<Self>, marker: DeletionMarker) {
        // The deleting node reclaims as part of its drain
        if marker.node == self.node {
            return;
        }
        if !self.reclaiming.lock().await.insert(marker.id) {
            return;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.reclaim_until_done(&marker.id).await;
            tracing::debug!("Reclaimed local snapshots of deleted dot {}", marker.name);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NewDot;
    use crate::snapshot::{FilesystemId, MemorySnapshotEngine, SnapshotDelta, SnapshotRef};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct Fixture {
        registry: Arc<Registry>,
        engine: Arc<MemorySnapshotEngine>,
        flags: Arc<DebugFlags>,
        manager: Arc<DeletionManager>,
    }

    fn fixture(timeout_ms: u64) -> Fixture {
        let registry = Arc::new(Registry::new(Arc::new(MemoryStore::new())));
        let engine = Arc::new(MemorySnapshotEngine::new());
        let flags = Arc::new(DebugFlags::new());
        let manager = Arc::new(DeletionManager::new(
            registry.clone(),
            engine.clone(),
            flags.clone(),
            "node-0",
            Duration::from_millis(timeout_ms),
            Duration::from_millis(10),
        ));
        Fixture {
            registry,
            engine,
            flags,
            manager,
        }
    }

    async fn create(f: &Fixture, name: &str) -> DotRecord {
        let name = VolumeName::new("admin", name).unwrap();
        f.registry
            .create(
                NewDot {
                    name: &name,
                    default_branch: "master",
                    default_subdot: "__default__",
                    node: "node-0",
                },
                f.engine.as_ref(),
                &f.flags,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_soft_delete_releases_name_at_once() {
        let f = fixture(50);
        let record = create(&f, "apples").await;
        let (record, rev) = f.registry.require(&record.name).await.unwrap();

        f.manager.soft_delete(record.clone(), rev).await.unwrap();
        assert!(f.registry.lookup(&record.name).await.unwrap().is_none());

        let again = create(&f, "apples").await;
        assert_ne!(again.id, record.id);
    }

    #[tokio::test]
    async fn test_drain_removes_metadata_and_snapshots() {
        let f = fixture(30);
        let record = create(&f, "apples").await;
        let (record, rev) = f.registry.require(&record.name).await.unwrap();

        let marker = f.manager.soft_delete(record.clone(), rev).await.unwrap();
        f.manager.drain(marker).await.unwrap();

        assert!(f.registry.get(&record.id).await.unwrap().is_none());
        assert!(f.registry.branches(&record.id).await.unwrap().is_empty());
        assert!(!f.engine.holds_dot(&record.id).await);
        let markers = list_json::<DeletionMarker>(f.registry.store(), keys::DELETED).await.unwrap();
        assert!(markers.is_empty());
    }

    #[tokio::test]
    async fn test_drain_retries_reclaim() {
        let f = fixture(0);
        let record = create(&f, "apples").await;
        let (record, rev) = f.registry.require(&record.name).await.unwrap();

        f.flags.set(DebugFlag::FailDrainReclaim, true);
        let marker = f.manager.soft_delete(record.clone(), rev).await.unwrap();
        let handle = f.manager.spawn_drain(marker);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(f.engine.holds_dot(&record.id).await);
        // Metadata is already gone while reclamation keeps retrying
        assert!(f.registry.branches(&record.id).await.unwrap().is_empty());

        f.flags.set(DebugFlag::FailDrainReclaim, false);
        handle.await.unwrap();
        assert!(!f
            .engine
            .filesystem_exists(&FilesystemId::new(record.id, "master"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_resume_pending_finishes_interrupted_drain() {
        let f = fixture(0);
        let record = create(&f, "apples").await;
        let (record, rev) = f.registry.require(&record.name).await.unwrap();
        f.manager.soft_delete(record.clone(), rev).await.unwrap();

        assert_eq!(f.manager.resume_pending().await.unwrap(), 1);
        for _ in 0..50 {
            if !f.engine.holds_dot(&record.id).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!f.engine.holds_dot(&record.id).await);
    }

    /// Memory engine that refuses to destroy one dot and counts destroys
    struct StuckEngine {
        inner: MemorySnapshotEngine,
        stuck: Mutex<Option<Uuid>>,
        destroys: Mutex<HashMap<Uuid, u32>>,
    }

    #[async_trait]
    impl SnapshotEngine for StuckEngine {
        async fn create_filesystem(&self, fs: &FilesystemId) -> Result<()> {
            self.inner.create_filesystem(fs).await
        }
        async fn clone_snapshot(&self, fs: &FilesystemId, origin: Option<SnapshotRef>) -> Result<()> {
            self.inner.clone_snapshot(fs, origin).await
        }
        async fn create_snapshot(&self, fs: &FilesystemId, snapshot: SnapshotRef) -> Result<()> {
            self.inner.create_snapshot(fs, snapshot).await
        }
        async fn destroy_snapshot(&self, dot: &Uuid, snapshot: SnapshotRef) -> Result<()> {
            self.inner.destroy_snapshot(dot, snapshot).await
        }
        async fn destroy_filesystem(&self, fs: &FilesystemId) -> Result<()> {
            self.inner.destroy_filesystem(fs).await
        }
        async fn destroy_dot(&self, dot: &Uuid) -> Result<()> {
            *self.destroys.lock().await.entry(*dot).or_default() += 1;
            if *self.stuck.lock().await == Some(*dot) {
                return Err(DotError::internal("device busy"));
            }
            self.inner.destroy_dot(dot).await
        }
        async fn filesystem_exists(&self, fs: &FilesystemId) -> Result<bool> {
            self.inner.filesystem_exists(fs).await
        }
        async fn has_snapshot(&self, dot: &Uuid, snapshot: SnapshotRef) -> Result<bool> {
            self.inner.has_snapshot(dot, snapshot).await
        }
        async fn dirty_byte_count(&self, fs: &FilesystemId) -> Result<u64> {
            self.inner.dirty_byte_count(fs).await
        }
        async fn rollback_to(&self, fs: &FilesystemId, snapshot: SnapshotRef) -> Result<()> {
            self.inner.rollback_to(fs, snapshot).await
        }
        async fn list_files(&self, fs: &FilesystemId, dir: &str) -> Result<Vec<String>> {
            self.inner.list_files(fs, dir).await
        }
        async fn send_snapshot(&self, dot: &Uuid, from: Option<SnapshotRef>, to: SnapshotRef) -> Result<SnapshotDelta> {
            self.inner.send_snapshot(dot, from, to).await
        }
        async fn receive_snapshot(&self, fs: &FilesystemId, delta: &SnapshotDelta) -> Result<()> {
            self.inner.receive_snapshot(fs, delta).await
        }
    }

    fn foreign_marker(record: &DotRecord, state: DeletionState) -> DeletionMarker {
        DeletionMarker {
            id: record.id,
            name: record.name.clone(),
            state,
            deleted_at_ms: chrono::Utc::now().timestamp_millis(),
            node: "node-9".to_string(),
        }
    }

    #[tokio::test]
    async fn test_watcher_reclaims_markers_independently() {
        let registry = Arc::new(Registry::new(Arc::new(MemoryStore::new())));
        let engine = Arc::new(StuckEngine {
            inner: MemorySnapshotEngine::new(),
            stuck: Mutex::new(None),
            destroys: Mutex::new(HashMap::new()),
        });
        let flags = Arc::new(DebugFlags::new());
        let manager = Arc::new(DeletionManager::new(
            registry.clone(),
            engine.clone(),
            flags.clone(),
            "node-0",
            Duration::from_millis(0),
            Duration::from_millis(10),
        ));
        let _watcher = manager.spawn_watcher();

        let mut records = Vec::new();
        for name in ["stuck", "free"] {
            let name = VolumeName::new("admin", name).unwrap();
            let new = NewDot {
                name: &name,
                default_branch: "master",
                default_subdot: "__default__",
                node: "node-9",
            };
            records.push(registry.create(new, engine.as_ref(), &flags).await.unwrap());
        }
        let (stuck, free) = (&records[0], &records[1]);
        *engine.stuck.lock().await = Some(stuck.id);

        let store = registry.store();
        write_json(store, &keys::deleted(&stuck.id), Expect::Any, &foreign_marker(stuck, DeletionState::SoftDeleted))
            .await
            .unwrap();
        // Every state change of the deleting node rewrites the marker
        for state in [DeletionState::SoftDeleted, DeletionState::Draining, DeletionState::Reclaimed] {
            write_json(store, &keys::deleted(&free.id), Expect::Any, &foreign_marker(free, state))
                .await
                .unwrap();
        }

        for _ in 0..50 {
            if !engine.inner.holds_dot(&free.id).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!engine.inner.holds_dot(&free.id).await);
        assert!(engine.inner.holds_dot(&stuck.id).await);
        let destroys = engine.destroys.lock().await;
        assert_eq!(destroys.get(&free.id), Some(&1));
        assert!(destroys.get(&stuck.id).copied().unwrap_or(0) > 1);
    }
}
