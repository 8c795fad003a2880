//! Dot registry
//!
//! Dot records, branch pointers, commit metadata and recorded dirty state,
//! all kept in the [`MetadataStore`]. The name index entry
//! `names/{ns}/{name}` is the single point of agreement on which dot owns a
//! name; it is only ever written with compare-and-set.
//!
//! ## Creation
//!
//! Creation is two-phase so a crash never leaves a live-looking dot without
//! a filesystem behind it:
//!
//! ```text
//! Provisional record -> name index CAS -> engine filesystem
//!     -> master branch record -> record flipped to Live
//! ```
//!
//! Any failure reverts what was written. A provisional record found behind
//! the name index on a later attempt is a leftover from a crash and is
//! reverted before the new attempt proceeds.

use crate::config::{DebugFlag, DebugFlags};
use crate::error::{DotError, Result};
use crate::graph::{BranchRecord, CommitGraph, CommitRecord};
use crate::name::VolumeName;
use crate::snapshot::{FilesystemId, SnapshotEngine};
use crate::store::{keys, list_json, read_json, write_json, CasOutcome, Expect, MetadataStore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

/// Lifecycle state of a dot record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DotState {
    /// Creation in progress (or abandoned by a crash)
    Provisional,
    Live,
    /// Deleted; name already released, metadata not yet drained
    SoftDeleted,
    Draining,
}

/// Cluster-wide record of a dot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DotRecord {
    pub id: Uuid,
    pub name: VolumeName,
    pub owner: String,
    pub collaborators: BTreeSet<String>,
    pub default_subdot: String,
    /// Branch new unpinned mounts follow
    pub checked_out: String,
    /// Default upstream dot per remote name
    pub upstreams: BTreeMap<String, VolumeName>,
    pub state: DotState,
    /// Unix seconds
    pub created_at: i64,
    /// Node that created the dot
    pub created_by: String,
}

/// Parameters of a new dot
#[derive(Debug, Clone)]
pub struct NewDot<'a> {
    pub name: &'a VolumeName,
    pub default_branch: &'a str,
    pub default_subdot: &'a str,
    pub node: &'a str,
}

/// Store-backed registry of dots and their history
pub struct Registry {
    store: Arc<dyn MetadataStore>,
}

impl Registry {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &dyn MetadataStore {
        self.store.as_ref()
    }

    // ─────────────────────────────────────────────────────
    // Dot records
    // ─────────────────────────────────────────────────────

    pub async fn get(&self, id: &Uuid) -> Result<Option<(DotRecord, u64)>> {
        read_json(self.store(), &keys::registry(id)).await
    }

    /// Live dot currently holding `name`
    pub async fn lookup(&self, name: &VolumeName) -> Result<Option<(DotRecord, u64)>> {
        let id = match read_json::<Uuid>(self.store(), &keys::name_index(name)).await? {
            Some((id, _)) => id,
            None => return Ok(None),
        };
        match self.get(&id).await? {
            Some((record, rev)) if record.state == DotState::Live => Ok(Some((record, rev))),
            _ => Ok(None),
        }
    }

    /// Like [`Registry::lookup`], failing with "No such filesystem"
    pub async fn require(&self, name: &VolumeName) -> Result<(DotRecord, u64)> {
        self.lookup(name)
            .await?
            .ok_or_else(|| DotError::NoSuchDot(name.to_string()))
    }

    /// All live dots, ordered by name
    pub async fn list_live(&self) -> Result<Vec<DotRecord>> {
        let mut out: Vec<DotRecord> = list_json::<DotRecord>(self.store(), keys::REGISTRY)
            .await?
            .into_iter()
            .map(|(_, record, _)| record)
            .filter(|record| record.state == DotState::Live)
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Replace a record written at `revision`
    pub async fn update(&self, record: &DotRecord, revision: u64) -> Result<u64> {
        match write_json(self.store(), &keys::registry(&record.id), Expect::Revision(revision), record)
            .await?
        {
            CasOutcome::Applied(rev) => Ok(rev),
            CasOutcome::Conflict(_) => Err(DotError::internal(format!(
                "dot {} was modified concurrently",
                record.name
            ))),
        }
    }

    /// Create a dot; must run inside the creation section for `name`
    pub async fn create(
        &self,
        new: NewDot<'_>,
        engine: &dyn SnapshotEngine,
        flags: &DebugFlags,
    ) -> Result<DotRecord> {
        let index_key = keys::name_index(new.name);

        if let Some(existing) = self.store.get(&index_key).await? {
            let id: Uuid = serde_json::from_slice(&existing.value)?;
            match self.get(&id).await? {
                Some((record, _)) if record.state == DotState::Live => {
                    return Err(DotError::AlreadyExists(new.name.to_string()));
                }
                Some((record, _)) if record.state == DotState::Provisional => {
                    tracing::warn!(
                        "Reverting abandoned creation of {} ({})",
                        record.name,
                        record.id
                    );
                    self.revert(&record, engine).await?;
                }
                _ => {
                    // Index left pointing at a dot that is gone
                    self.store
                        .delete(&index_key, Expect::Revision(existing.revision))
                        .await?;
                }
            }
        }

        let mut record = DotRecord {
            id: Uuid::new_v4(),
            name: new.name.clone(),
            owner: new.name.namespace.clone(),
            collaborators: BTreeSet::new(),
            default_subdot: new.default_subdot.to_string(),
            checked_out: new.default_branch.to_string(),
            upstreams: BTreeMap::new(),
            state: DotState::Provisional,
            created_at: chrono::Utc::now().timestamp(),
            created_by: new.node.to_string(),
        };

        let record_key = keys::registry(&record.id);
        let revision = match write_json(self.store(), &record_key, Expect::Absent, &record).await? {
            CasOutcome::Applied(rev) => rev,
            CasOutcome::Conflict(_) => {
                return Err(DotError::internal(format!("dot id {} already in use", record.id)))
            }
        };

        if !write_json(self.store(), &index_key, Expect::Absent, &record.id)
            .await?
            .is_applied()
        {
            self.store.delete(&record_key, Expect::Any).await?;
            return Err(DotError::AlreadyExists(new.name.to_string()));
        }

        let fs = FilesystemId::new(record.id, &record.checked_out);
        if let Err(e) = engine.create_filesystem(&fs).await {
            return Err(self.abort_create(&record, engine, e).await);
        }

        if flags.is_set(DebugFlag::PartialFailCreateFilesystem) {
            // Leave the provisional record behind, as a crash at this point would
            tracing::warn!("Injected failure creating {}", record.name);
            return Err(DotError::InjectedFault(format!(
                "CreateFilesystem partially failed for {}",
                record.name
            )));
        }

        let master = BranchRecord::new(&record.checked_out, None);
        if let Err(e) = self.put_branch(&record.id, &master, Expect::Absent).await {
            return Err(self.abort_create(&record, engine, e).await);
        }

        record.state = DotState::Live;
        if let Err(e) = self.update(&record, revision).await {
            return Err(self.abort_create(&record, engine, e).await);
        }

        tracing::info!("Created dot {} ({})", record.name, record.id);
        Ok(record)
    }

    async fn abort_create(&self, record: &DotRecord, engine: &dyn SnapshotEngine, cause: DotError) -> DotError {
        tracing::warn!("Creation of {} failed, reverting: {}", record.name, cause);
        if let Err(e) = self.revert(record, engine).await {
            tracing::error!("Failed to revert {}: {}", record.name, e);
        }
        cause
    }

    /// Remove every trace of a dot that never became (or no longer is) live
    pub async fn revert(&self, record: &DotRecord, engine: &dyn SnapshotEngine) -> Result<()> {
        self.store.delete_prefix(&keys::dot_data(&record.id)).await?;
        self.release_name(record).await?;
        self.store.delete(&keys::registry(&record.id), Expect::Any).await?;
        engine.destroy_dot(&record.id).await
    }

    /// Release the name of a dot so it can be reused at once
    pub async fn release_name(&self, record: &DotRecord) -> Result<()> {
        let index_key = keys::name_index(&record.name);
        if let Some(current) = self.store.get(&index_key).await? {
            let owner: Uuid = serde_json::from_slice(&current.value)?;
            if owner == record.id {
                self.store
                    .delete(&index_key, Expect::Revision(current.revision))
                    .await?;
            }
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────
    // Branches
    // ─────────────────────────────────────────────────────

    pub async fn branch(&self, id: &Uuid, branch: &str) -> Result<Option<(BranchRecord, u64)>> {
        read_json(self.store(), &keys::branch(id, branch)).await
    }

    /// Like [`Registry::branch`], failing with `NoSuchBranch`
    pub async fn require_branch(&self, dot: &DotRecord, branch: &str) -> Result<(BranchRecord, u64)> {
        self.branch(&dot.id, branch)
            .await?
            .ok_or_else(|| DotError::NoSuchBranch {
                dot: dot.name.to_string(),
                branch: branch.to_string(),
            })
    }

    /// All branches of a dot, ordered by name
    pub async fn branches(&self, id: &Uuid) -> Result<Vec<BranchRecord>> {
        Ok(list_json::<BranchRecord>(self.store(), &keys::branches(id))
            .await?
            .into_iter()
            .map(|(_, record, _)| record)
            .collect())
    }

    pub async fn put_branch(&self, id: &Uuid, branch: &BranchRecord, expect: Expect) -> Result<u64> {
        match write_json(self.store(), &keys::branch(id, &branch.name), expect, branch).await? {
            CasOutcome::Applied(rev) => Ok(rev),
            CasOutcome::Conflict(Some(_)) if expect == Expect::Absent => {
                Err(DotError::AlreadyExists(format!("branch {}", branch.name)))
            }
            CasOutcome::Conflict(_) => Err(DotError::internal(format!(
                "branch {} moved concurrently",
                branch.name
            ))),
        }
    }

    // ─────────────────────────────────────────────────────
    // Commits
    // ─────────────────────────────────────────────────────

    /// Every commit known for a dot
    pub async fn graph(&self, id: &Uuid) -> Result<CommitGraph> {
        let records = list_json::<CommitRecord>(self.store(), &keys::commits(id)).await?;
        Ok(CommitGraph::from_records(records.into_iter().map(|(_, record, _)| record)))
    }

    /// Record commit metadata; re-recording an identical commit is a no-op
    pub async fn put_commit(&self, id: &Uuid, commit: &CommitRecord) -> Result<()> {
        match write_json(self.store(), &keys::commit(id, &commit.id), Expect::Absent, commit).await? {
            CasOutcome::Applied(_) => Ok(()),
            CasOutcome::Conflict(Some(existing)) => {
                let existing: CommitRecord = serde_json::from_slice(&existing.value)?;
                if existing == *commit {
                    Ok(())
                } else {
                    Err(DotError::internal(format!(
                        "conflicting metadata for commit {}",
                        commit.id
                    )))
                }
            }
            CasOutcome::Conflict(None) => Err(DotError::internal(format!(
                "could not record commit {}",
                commit.id
            ))),
        }
    }

    pub async fn delete_commit(&self, id: &Uuid, commit: &Uuid) -> Result<()> {
        self.store.delete(&keys::commit(id, commit), Expect::Any).await?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────
    // Dirty state
    // ─────────────────────────────────────────────────────

    /// Dirty bytes last recorded by the scanner
    pub async fn recorded_dirty(&self, id: &Uuid, branch: &str) -> Result<u64> {
        Ok(read_json::<u64>(self.store(), &keys::dirty(id, branch))
            .await?
            .map(|(bytes, _)| bytes)
            .unwrap_or(0))
    }

    /// Record dirty bytes; only writes when the value changed
    pub async fn record_dirty(&self, id: &Uuid, branch: &str, bytes: u64) -> Result<()> {
        let key = keys::dirty(id, branch);
        match read_json::<u64>(self.store(), &key).await? {
            Some((current, _)) if current == bytes => Ok(()),
            None if bytes == 0 => Ok(()),
            Some((_, rev)) => {
                // A lost race means the other writer saw fresher state
                write_json(self.store(), &key, Expect::Revision(rev), &bytes).await?;
                Ok(())
            }
            None => {
                write_json(self.store(), &key, Expect::Absent, &bytes).await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::MemorySnapshotEngine;
    use crate::store::MemoryStore;

    struct Fixture {
        registry: Registry,
        engine: MemorySnapshotEngine,
        flags: DebugFlags,
    }

    fn fixture() -> Fixture {
        Fixture {
            registry: Registry::new(Arc::new(MemoryStore::new())),
            engine: MemorySnapshotEngine::new(),
            flags: DebugFlags::new(),
        }
    }

    fn new_dot(name: &VolumeName) -> NewDot<'_> {
        NewDot {
            name,
            default_branch: "master",
            default_subdot: "__default__",
            node: "node-0",
        }
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let f = fixture();
        let name = VolumeName::new("admin", "apples").unwrap();
        let record = f.registry.create(new_dot(&name), &f.engine, &f.flags).await.unwrap();

        assert_eq!(record.state, DotState::Live);
        let (found, _) = f.registry.require(&name).await.unwrap();
        assert_eq!(found.id, record.id);
        let (master, _) = f.registry.require_branch(&record, "master").await.unwrap();
        assert_eq!(master.tip, None);
        assert!(f
            .engine
            .filesystem_exists(&FilesystemId::new(record.id, "master"))
            .await
            .unwrap());

        let err = f.registry.create(new_dot(&name), &f.engine, &f.flags).await.unwrap_err();
        assert_eq!(err.to_string(), "admin/apples exists already");
    }

    #[tokio::test]
    async fn test_partial_failure_is_recovered_on_retry() {
        let f = fixture();
        let name = VolumeName::new("admin", "crashy").unwrap();

        f.flags.set(DebugFlag::PartialFailCreateFilesystem, true);
        let err = f.registry.create(new_dot(&name), &f.engine, &f.flags).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InjectedFault);
        assert!(f.registry.lookup(&name).await.unwrap().is_none());
        assert!(f.registry.list_live().await.unwrap().is_empty());

        f.flags.set(DebugFlag::PartialFailCreateFilesystem, false);
        let record = f.registry.create(new_dot(&name), &f.engine, &f.flags).await.unwrap();
        assert_eq!(f.registry.list_live().await.unwrap().len(), 1);

        // Only the retried dot is left behind
        let all = list_json::<DotRecord>(f.registry.store(), keys::REGISTRY).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].1.id, record.id);
    }

    #[tokio::test]
    async fn test_put_commit_is_idempotent() {
        let f = fixture();
        let id = Uuid::new_v4();
        let commit = CommitRecord::new(None, "first", "admin");
        f.registry.put_commit(&id, &commit).await.unwrap();
        f.registry.put_commit(&id, &commit).await.unwrap();

        let mut other = commit.clone();
        other.message = "rewritten".to_string();
        assert!(f.registry.put_commit(&id, &other).await.is_err());
        assert_eq!(f.registry.graph(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_record_dirty() {
        let f = fixture();
        let id = Uuid::new_v4();
        assert_eq!(f.registry.recorded_dirty(&id, "master").await.unwrap(), 0);
        f.registry.record_dirty(&id, "master", 12).await.unwrap();
        assert_eq!(f.registry.recorded_dirty(&id, "master").await.unwrap(), 12);
        f.registry.record_dirty(&id, "master", 0).await.unwrap();
        assert_eq!(f.registry.recorded_dirty(&id, "master").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_branch_is_already_exists() {
        let f = fixture();
        let id = Uuid::new_v4();
        f.registry
            .put_branch(&id, &BranchRecord::new("dev", None), Expect::Absent)
            .await
            .unwrap();
        let err = f
            .registry
            .put_branch(&id, &BranchRecord::new("dev", None), Expect::Absent)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AlreadyExists);
    }
}
