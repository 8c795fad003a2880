//! Cluster metadata store
//!
//! Agreement on dot existence, ownership and history is delegated to a
//! strongly consistent key/value store. The control plane only needs a small
//! capability set:
//! - `get` / `list_prefix` reads returning per-key revisions
//! - `compare_and_set` against an expected revision (or absence)
//! - `delete` and an atomic `delete_prefix`
//! - `watch` for change notification
//!
//! Two implementations are provided: [`MemoryStore`], which several
//! in-process nodes can share as one cluster, and [`SledStore`] for a single
//! persistent node.

use crate::error::{DotError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::sync::{broadcast, Mutex};

/// A stored value and the revision at which it was last written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub revision: u64,
}

/// Precondition for a conditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// Unconditional
    Any,
    /// Key must not exist
    Absent,
    /// Key must exist at exactly this revision
    Revision(u64),
}

impl Expect {
    fn matches(&self, current: Option<&Versioned>) -> bool {
        match (self, current) {
            (Expect::Any, _) => true,
            (Expect::Absent, None) => true,
            (Expect::Revision(rev), Some(v)) => v.revision == *rev,
            _ => false,
        }
    }
}

/// Outcome of [`MetadataStore::compare_and_set`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// Written at the returned revision
    Applied(u64),
    /// Precondition failed; carries the current value
    Conflict(Option<Versioned>),
}

impl CasOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied(_))
    }
}

/// Change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put { key: String, revision: u64 },
    Delete { key: String },
    /// Events were dropped; consumers should rescan their prefix
    Resync,
}

impl WatchEvent {
    fn key(&self) -> Option<&str> {
        match self {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key } => Some(key),
            WatchEvent::Resync => None,
        }
    }
}

/// Stream of changes under a key prefix
pub struct Watcher {
    prefix: String,
    rx: broadcast::Receiver<WatchEvent>,
}

impl Watcher {
    fn new(prefix: &str, rx: broadcast::Receiver<WatchEvent>) -> Self {
        Self { prefix: prefix.to_string(), rx }
    }

    /// Next event under the prefix; `None` once the store is gone
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => match event.key() {
                    Some(key) if !key.starts_with(&self.prefix) => continue,
                    _ => return Some(event),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Watcher on {} lagged by {} events", self.prefix, skipped);
                    return Some(WatchEvent::Resync);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Strongly consistent metadata store
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Versioned>>;

    /// Write `value` if `expect` holds for the current state of `key`
    async fn compare_and_set(&self, key: &str, expect: Expect, value: Vec<u8>) -> Result<CasOutcome>;

    /// Remove `key` if `expect` holds; returns whether a value was removed
    async fn delete(&self, key: &str, expect: Expect) -> Result<bool>;

    /// Remove every key under `prefix` in one atomic step
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;

    /// All keys under `prefix`, in key order
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>>;

    /// Subscribe to changes under `prefix`
    fn watch(&self, prefix: &str) -> Watcher;
}

const WATCH_CAPACITY: usize = 1024;

// ─────────────────────────────────────────────────────
// In-memory store
// ─────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    entries: BTreeMap<String, Versioned>,
    revision: u64,
}

/// In-memory store; share one `Arc<MemoryStore>` between nodes of a cluster
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    events: broadcast::Sender<WatchEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            inner: Mutex::new(MemoryInner::default()),
            events,
        }
    }

    fn notify(&self, event: WatchEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        Ok(self.inner.lock().await.entries.get(key).cloned())
    }

    async fn compare_and_set(&self, key: &str, expect: Expect, value: Vec<u8>) -> Result<CasOutcome> {
        let mut inner = self.inner.lock().await;
        let current = inner.entries.get(key);
        if !expect.matches(current) {
            return Ok(CasOutcome::Conflict(current.cloned()));
        }
        inner.revision += 1;
        let revision = inner.revision;
        inner.entries.insert(key.to_string(), Versioned { value, revision });
        drop(inner);

        self.notify(WatchEvent::Put { key: key.to_string(), revision });
        Ok(CasOutcome::Applied(revision))
    }

    async fn delete(&self, key: &str, expect: Expect) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let current = inner.entries.get(key);
        if current.is_none() || !expect.matches(current) {
            return Ok(false);
        }
        inner.entries.remove(key);
        inner.revision += 1;
        drop(inner);

        self.notify(WatchEvent::Delete { key: key.to_string() });
        Ok(true)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let keys: Vec<String> = inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            inner.entries.remove(key);
        }
        if !keys.is_empty() {
            inner.revision += 1;
        }
        drop(inner);

        for key in &keys {
            self.notify(WatchEvent::Delete { key: key.clone() });
        }
        Ok(keys.len())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn watch(&self, prefix: &str) -> Watcher {
        Watcher::new(prefix, self.events.subscribe())
    }
}

// ─────────────────────────────────────────────────────
// Sled-backed store
// ─────────────────────────────────────────────────────

/// Persistent store on top of sled
///
/// Values are stored as `[revision: u64 BE][payload]`; revisions come from
/// sled's monotonic id generator so they survive restarts.
pub struct SledStore {
    db: sled::Db,
    events: broadcast::Sender<WatchEvent>,
}

impl SledStore {
    /// Open or create a store at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self::from_db(db))
    }

    /// Throwaway store removed on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self::from_db(db))
    }

    fn from_db(db: sled::Db) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self { db, events }
    }

    fn encode(revision: u64, value: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + value.len());
        buf.extend_from_slice(&revision.to_be_bytes());
        buf.extend_from_slice(value);
        buf
    }

    fn decode(raw: &[u8]) -> Result<Versioned> {
        if raw.len() < 8 {
            return Err(DotError::internal("corrupt metadata record: short header"));
        }
        let mut rev = [0u8; 8];
        rev.copy_from_slice(&raw[..8]);
        Ok(Versioned {
            revision: u64::from_be_bytes(rev),
            value: raw[8..].to_vec(),
        })
    }

    fn notify(&self, event: WatchEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl MetadataStore for SledStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        match self.db.get(key)? {
            Some(raw) => Ok(Some(Self::decode(&raw)?)),
            None => Ok(None),
        }
    }

    async fn compare_and_set(&self, key: &str, expect: Expect, value: Vec<u8>) -> Result<CasOutcome> {
        let current_raw = self.db.get(key)?;
        let current = match &current_raw {
            Some(raw) => Some(Self::decode(raw)?),
            None => None,
        };
        if !expect.matches(current.as_ref()) {
            return Ok(CasOutcome::Conflict(current));
        }

        let revision = self.db.generate_id()? + 1;
        let new_raw = Self::encode(revision, &value);
        match self.db.compare_and_swap(key, current_raw.as_deref(), Some(new_raw))? {
            Ok(()) => {
                self.notify(WatchEvent::Put { key: key.to_string(), revision });
                Ok(CasOutcome::Applied(revision))
            }
            Err(conflict) => {
                let current = match conflict.current {
                    Some(raw) => Some(Self::decode(&raw)?),
                    None => None,
                };
                Ok(CasOutcome::Conflict(current))
            }
        }
    }

    async fn delete(&self, key: &str, expect: Expect) -> Result<bool> {
        let current_raw = match self.db.get(key)? {
            Some(raw) => raw,
            None => return Ok(false),
        };
        let current = Self::decode(&current_raw)?;
        if !expect.matches(Some(&current)) {
            return Ok(false);
        }
        let swapped = self
            .db
            .compare_and_swap(key, Some(current_raw.as_ref()), None::<Vec<u8>>)?;
        if swapped.is_ok() {
            self.notify(WatchEvent::Delete { key: key.to_string() });
        }
        Ok(swapped.is_ok())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut batch = sled::Batch::default();
        let mut keys = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (key, _) = item?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
            batch.remove(key);
        }
        self.db.apply_batch(batch)?;

        for key in &keys {
            self.notify(WatchEvent::Delete { key: key.clone() });
        }
        Ok(keys.len())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (key, raw) = item?;
            out.push((String::from_utf8_lossy(&key).into_owned(), Self::decode(&raw)?));
        }
        Ok(out)
    }

    fn watch(&self, prefix: &str) -> Watcher {
        Watcher::new(prefix, self.events.subscribe())
    }
}

// ─────────────────────────────────────────────────────
// Typed helpers
// ─────────────────────────────────────────────────────

/// Read and decode a JSON record with its revision
pub async fn read_json<T: DeserializeOwned>(
    store: &dyn MetadataStore,
    key: &str,
) -> Result<Option<(T, u64)>> {
    match store.get(key).await? {
        Some(v) => Ok(Some((serde_json::from_slice(&v.value)?, v.revision))),
        None => Ok(None),
    }
}

/// Encode and conditionally write a JSON record
pub async fn write_json<T: Serialize>(
    store: &dyn MetadataStore,
    key: &str,
    expect: Expect,
    value: &T,
) -> Result<CasOutcome> {
    let data = serde_json::to_vec(value)?;
    store.compare_and_set(key, expect, data).await
}

/// Decode every JSON record under a prefix
pub async fn list_json<T: DeserializeOwned>(
    store: &dyn MetadataStore,
    prefix: &str,
) -> Result<Vec<(String, T, u64)>> {
    let mut out = Vec::new();
    for (key, v) in store.list_prefix(prefix).await? {
        let value: T = serde_json::from_slice(&v.value)?;
        out.push((key, value, v.revision));
    }
    Ok(out)
}

/// Key layout
///
/// Everything a dot owns besides its registry record and name index entry
/// lives under `dots/{id}/`, so a single prefix delete drops all branches,
/// commits and dirty markers at once.
pub mod keys {
    use crate::name::VolumeName;
    use uuid::Uuid;

    pub const REGISTRY: &str = "registry/";
    pub const DELETED: &str = "deleted/";
    pub const USERS: &str = "users/";

    pub fn registry(id: &Uuid) -> String {
        format!("registry/{}", id)
    }

    pub fn name_index(name: &VolumeName) -> String {
        format!("names/{}/{}", name.namespace, name.name)
    }

    pub fn dot_data(id: &Uuid) -> String {
        format!("dots/{}/", id)
    }

    pub fn branches(id: &Uuid) -> String {
        format!("dots/{}/branches/", id)
    }

    pub fn branch(id: &Uuid, branch: &str) -> String {
        format!("dots/{}/branches/{}", id, branch)
    }

    pub fn commits(id: &Uuid) -> String {
        format!("dots/{}/commits/", id)
    }

    pub fn commit(id: &Uuid, commit: &Uuid) -> String {
        format!("dots/{}/commits/{}", id, commit)
    }

    pub fn dirty(id: &Uuid, branch: &str) -> String {
        format!("dots/{}/dirty/{}", id, branch)
    }

    pub fn deleted(id: &Uuid) -> String {
        format!("deleted/{}", id)
    }

    pub fn user(name: &str) -> String {
        format!("users/{}", name)
    }
}
