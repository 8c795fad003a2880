//! Snapshot engine adapter
//!
//! The control plane never touches file contents itself. It drives a
//! [`SnapshotEngine`] that owns one writable filesystem per `(dot, branch)`
//! and an immutable snapshot per commit. Snapshots are named by commit id,
//! which is globally unique, so a delta produced on one cluster can be
//! replayed on another regardless of the local dot ids.
//!
//! All engine operations are fallible and safe to retry.

use crate::error::{DotError, Result};
use crate::graph::CommitId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Snapshots are named after the commit that produced them
pub type SnapshotRef = CommitId;

/// Writable filesystem backing one branch of a dot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilesystemId {
    pub dot: Uuid,
    pub branch: String,
}

impl FilesystemId {
    pub fn new(dot: Uuid, branch: &str) -> Self {
        Self {
            dot,
            branch: branch.to_string(),
        }
    }
}

impl fmt::Display for FilesystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.dot, self.branch)
    }
}

/// A single file-level change inside a delta
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileChange {
    Upsert { path: String, data: Vec<u8> },
    Remove { path: String },
}

/// Incremental difference between two snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDelta {
    /// Base snapshot; `None` means an empty filesystem
    pub from: Option<SnapshotRef>,
    pub to: SnapshotRef,
    pub changes: Vec<FileChange>,
    /// Hex SHA-256 over the changes
    pub content_hash: String,
}

impl SnapshotDelta {
    pub fn new(from: Option<SnapshotRef>, to: SnapshotRef, changes: Vec<FileChange>) -> Self {
        let content_hash = Self::compute_content_hash(&changes);
        Self {
            from,
            to,
            changes,
            content_hash,
        }
    }

    /// Compute a content hash over all changes in this delta.
    pub fn compute_content_hash(changes: &[FileChange]) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        for change in changes {
            match change {
                FileChange::Upsert { path, data } => {
                    hasher.update([0x01u8]);
                    hasher.update((path.len() as u64).to_le_bytes());
                    hasher.update(path.as_bytes());
                    hasher.update((data.len() as u64).to_le_bytes());
                    hasher.update(data);
                }
                FileChange::Remove { path } => {
                    hasher.update([0x02u8]);
                    hasher.update((path.len() as u64).to_le_bytes());
                    hasher.update(path.as_bytes());
                }
            }
        }
        hex::encode(hasher.finalize())
    }

    /// Verify the content hash.
    pub fn verify_content_hash(&self) -> bool {
        Self::compute_content_hash(&self.changes) == self.content_hash
    }

    /// Payload size in bytes
    pub fn byte_len(&self) -> u64 {
        self.changes
            .iter()
            .map(|c| match c {
                FileChange::Upsert { path, data } => (path.len() + data.len()) as u64,
                FileChange::Remove { path } => path.len() as u64,
            })
            .sum()
    }
}

/// Storage backend for dot filesystems and their snapshots
#[async_trait]
pub trait SnapshotEngine: Send + Sync {
    /// Create an empty filesystem; no-op if it exists
    async fn create_filesystem(&self, fs: &FilesystemId) -> Result<()>;

    /// Create `fs` as a writable clone of `origin` (empty when `None`)
    async fn clone_snapshot(&self, fs: &FilesystemId, origin: Option<SnapshotRef>) -> Result<()>;

    /// Freeze the current state of `fs` as `snapshot`
    async fn create_snapshot(&self, fs: &FilesystemId, snapshot: SnapshotRef) -> Result<()>;

    async fn destroy_snapshot(&self, dot: &Uuid, snapshot: SnapshotRef) -> Result<()>;

    async fn destroy_filesystem(&self, fs: &FilesystemId) -> Result<()>;

    /// Remove every filesystem and snapshot of a dot
    async fn destroy_dot(&self, dot: &Uuid) -> Result<()>;

    async fn filesystem_exists(&self, fs: &FilesystemId) -> Result<bool>;

    async fn has_snapshot(&self, dot: &Uuid, snapshot: SnapshotRef) -> Result<bool>;

    /// Bytes written to `fs` since its last snapshot
    async fn dirty_byte_count(&self, fs: &FilesystemId) -> Result<u64>;

    /// Discard changes and reset `fs` to `snapshot`
    async fn rollback_to(&self, fs: &FilesystemId, snapshot: SnapshotRef) -> Result<()>;

    /// Files under `dir` (relative to it), sorted; `""` lists everything
    async fn list_files(&self, fs: &FilesystemId, dir: &str) -> Result<Vec<String>>;

    /// Produce the delta from `from` to `to`
    async fn send_snapshot(&self, dot: &Uuid, from: Option<SnapshotRef>, to: SnapshotRef) -> Result<SnapshotDelta>;

    /// Apply a delta, creating snapshot `delta.to` and moving `fs` onto it
    async fn receive_snapshot(&self, fs: &FilesystemId, delta: &SnapshotDelta) -> Result<()>;
}

type Files = BTreeMap<String, Vec<u8>>;

#[derive(Debug, Default)]
struct WorkingFs {
    files: Files,
    dirty: u64,
}

#[derive(Debug, Default)]
struct DotState {
    filesystems: HashMap<String, WorkingFs>,
    snapshots: HashMap<SnapshotRef, Files>,
}

/// In-memory engine used by tests and the development server
#[derive(Default)]
pub struct MemorySnapshotEngine {
    dots: RwLock<HashMap<Uuid, DotState>>,
}

fn no_such_filesystem(fs: &FilesystemId) -> DotError {
    DotError::internal(format!("filesystem {} does not exist", fs))
}

fn no_such_snapshot(snapshot: &SnapshotRef) -> DotError {
    DotError::internal(format!("snapshot {} does not exist", snapshot))
}

impl MemorySnapshotEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a file into a working filesystem
    pub async fn write_file(&self, fs: &FilesystemId, path: &str, data: &[u8]) -> Result<()> {
        let mut dots = self.dots.write().await;
        let working = dots
            .get_mut(&fs.dot)
            .and_then(|d| d.filesystems.get_mut(&fs.branch))
            .ok_or_else(|| no_such_filesystem(fs))?;
        working.files.insert(path.to_string(), data.to_vec());
        working.dirty += data.len().max(1) as u64;
        Ok(())
    }

    pub async fn remove_file(&self, fs: &FilesystemId, path: &str) -> Result<()> {
        let mut dots = self.dots.write().await;
        let working = dots
            .get_mut(&fs.dot)
            .and_then(|d| d.filesystems.get_mut(&fs.branch))
            .ok_or_else(|| no_such_filesystem(fs))?;
        if working.files.remove(path).is_some() {
            working.dirty += 1;
        }
        Ok(())
    }

    pub async fn read_file(&self, fs: &FilesystemId, path: &str) -> Result<Option<Vec<u8>>> {
        let dots = self.dots.read().await;
        let working = dots
            .get(&fs.dot)
            .and_then(|d| d.filesystems.get(&fs.branch))
            .ok_or_else(|| no_such_filesystem(fs))?;
        Ok(working.files.get(path).cloned())
    }

    /// Whether any state for the dot is still held
    pub async fn holds_dot(&self, dot: &Uuid) -> bool {
        self.dots.read().await.contains_key(dot)
    }
}

#[async_trait]
impl SnapshotEngine for MemorySnapshotEngine {
    async fn create_filesystem(&self, fs: &FilesystemId) -> Result<()> {
        let mut dots = self.dots.write().await;
        dots.entry(fs.dot)
            .or_default()
            .filesystems
            .entry(fs.branch.clone())
            .or_default();
        Ok(())
    }

    async fn clone_snapshot(&self, fs: &FilesystemId, origin: Option<SnapshotRef>) -> Result<()> {
        let mut dots = self.dots.write().await;
        let state = dots.entry(fs.dot).or_default();
        let files = match origin {
            Some(snapshot) => state
                .snapshots
                .get(&snapshot)
                .cloned()
                .ok_or_else(|| no_such_snapshot(&snapshot))?,
            None => Files::new(),
        };
        state
            .filesystems
            .insert(fs.branch.clone(), WorkingFs { files, dirty: 0 });
        Ok(())
    }

    async fn create_snapshot(&self, fs: &FilesystemId, snapshot: SnapshotRef) -> Result<()> {
        let mut dots = self.dots.write().await;
        let state = dots.get_mut(&fs.dot).ok_or_else(|| no_such_filesystem(fs))?;
        let working = state
            .filesystems
            .get_mut(&fs.branch)
            .ok_or_else(|| no_such_filesystem(fs))?;
        let files = working.files.clone();
        working.dirty = 0;
        state.snapshots.insert(snapshot, files);
        Ok(())
    }

    async fn destroy_snapshot(&self, dot: &Uuid, snapshot: SnapshotRef) -> Result<()> {
        if let Some(state) = self.dots.write().await.get_mut(dot) {
            state.snapshots.remove(&snapshot);
        }
        Ok(())
    }

    async fn destroy_filesystem(&self, fs: &FilesystemId) -> Result<()> {
        if let Some(state) = self.dots.write().await.get_mut(&fs.dot) {
            state.filesystems.remove(&fs.branch);
        }
        Ok(())
    }

    async fn destroy_dot(&self, dot: &Uuid) -> Result<()> {
        self.dots.write().await.remove(dot);
        Ok(())
    }

    async fn filesystem_exists(&self, fs: &FilesystemId) -> Result<bool> {
        let dots = self.dots.read().await;
        Ok(dots
            .get(&fs.dot)
            .map(|d| d.filesystems.contains_key(&fs.branch))
            .unwrap_or(false))
    }

    async fn has_snapshot(&self, dot: &Uuid, snapshot: SnapshotRef) -> Result<bool> {
        let dots = self.dots.read().await;
        Ok(dots
            .get(dot)
            .map(|d| d.snapshots.contains_key(&snapshot))
            .unwrap_or(false))
    }

    async fn dirty_byte_count(&self, fs: &FilesystemId) -> Result<u64> {
        let dots = self.dots.read().await;
        let working = dots
            .get(&fs.dot)
            .and_then(|d| d.filesystems.get(&fs.branch))
            .ok_or_else(|| no_such_filesystem(fs))?;
        Ok(working.dirty)
    }

    async fn rollback_to(&self, fs: &FilesystemId, snapshot: SnapshotRef) -> Result<()> {
        let mut dots = self.dots.write().await;
        let state = dots.get_mut(&fs.dot).ok_or_else(|| no_such_filesystem(fs))?;
        let files = state
            .snapshots
            .get(&snapshot)
            .cloned()
            .ok_or_else(|| no_such_snapshot(&snapshot))?;
        let working = state
            .filesystems
            .get_mut(&fs.branch)
            .ok_or_else(|| no_such_filesystem(fs))?;
        working.files = files;
        working.dirty = 0;
        Ok(())
    }

    async fn list_files(&self, fs: &FilesystemId, dir: &str) -> Result<Vec<String>> {
        let dots = self.dots.read().await;
        let working = dots
            .get(&fs.dot)
            .and_then(|d| d.filesystems.get(&fs.branch))
            .ok_or_else(|| no_such_filesystem(fs))?;
        if dir.is_empty() {
            return Ok(working.files.keys().cloned().collect());
        }
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        Ok(working
            .files
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    async fn send_snapshot(&self, dot: &Uuid, from: Option<SnapshotRef>, to: SnapshotRef) -> Result<SnapshotDelta> {
        let dots = self.dots.read().await;
        let state = dots
            .get(dot)
            .ok_or_else(|| DotError::internal(format!("no snapshots held for dot {}", dot)))?;
        let empty = Files::new();
        let base = match from {
            Some(snapshot) => state
                .snapshots
                .get(&snapshot)
                .ok_or_else(|| no_such_snapshot(&snapshot))?,
            None => &empty,
        };
        let target = state.snapshots.get(&to).ok_or_else(|| no_such_snapshot(&to))?;

        let mut changes = Vec::new();
        for path in base.keys() {
            if !target.contains_key(path) {
                changes.push(FileChange::Remove { path: path.clone() });
            }
        }
        for (path, data) in target {
            if base.get(path) != Some(data) {
                changes.push(FileChange::Upsert {
                    path: path.clone(),
                    data: data.clone(),
                });
            }
        }
        Ok(SnapshotDelta::new(from, to, changes))
    }

    async fn receive_snapshot(&self, fs: &FilesystemId, delta: &SnapshotDelta) -> Result<()> {
        if !delta.verify_content_hash() {
            return Err(DotError::internal(format!(
                "content hash mismatch in delta for snapshot {}",
                delta.to
            )));
        }

        let mut dots = self.dots.write().await;
        let state = dots.entry(fs.dot).or_default();
        let mut files = match delta.from {
            Some(snapshot) => state
                .snapshots
                .get(&snapshot)
                .cloned()
                .ok_or_else(|| no_such_snapshot(&snapshot))?,
            None => Files::new(),
        };
        for change in &delta.changes {
            match change {
                FileChange::Upsert { path, data } => {
                    files.insert(path.clone(), data.clone());
                }
                FileChange::Remove { path } => {
                    files.remove(path);
                }
            }
        }
        state.snapshots.insert(delta.to, files.clone());
        state
            .filesystems
            .insert(fs.branch.clone(), WorkingFs { files, dirty: 0 });
        Ok(())
    }
}
