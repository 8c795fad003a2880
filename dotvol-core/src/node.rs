//! Dot control plane node
//!
//! [`DotNode`] is the RPC surface of one node. It ties together:
//! - the registry and metadata store (cluster state)
//! - the node-local snapshot engine and workload runtime
//! - authentication, authorization and per-dot exclusive sections
//! - the background dirty scanner and deletion watcher
//!
//! Every call takes the caller's [`Session`]. Operations that mutate a dot
//! run inside that dot's exclusive section and re-read the record once
//! inside it. Transfers between clusters live in `transfer.rs`.

use crate::auth::{UserDirectory, UserInfo};
use crate::authz::{AccessLevel, AuthzProvider, OwnershipAuthz};
use crate::config::{DebugFlags, NodeConfig};
use crate::deletion::DeletionManager;
use crate::error::{DotError, Result};
use crate::graph::{BranchRecord, CommitId, CommitRecord};
use crate::locks::{DotGuard, DotLocks};
use crate::name::{validate_branch, VolumeName, VolumeRef};
use crate::registry::{DotRecord, DotState, NewDot, Registry};
use crate::replication::PeerConnector;
use crate::session::Session;
use crate::snapshot::{FilesystemId, SnapshotEngine};
use crate::store::{Expect, MetadataStore};
use crate::subdot::{resolve_subdot, subdot_dir, Attachment, QuiesceMode, QuiesceSaga, WorkloadRuntime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Where a volume-driver mount lands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPoint {
    pub dot: VolumeName,
    pub id: Uuid,
    pub fs: FilesystemId,
    /// Branch given in the compound name, if any
    pub pinned_branch: Option<String>,
    pub subdot: String,
    /// Directory of the subdot inside `fs` (`""` for the top level)
    pub dir: String,
    /// Whether the mount created the dot
    pub created: bool,
}

/// One row of `ListDots`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DotSummary {
    /// Name relative to the caller's namespace
    pub name: String,
    pub id: Uuid,
    pub branch: String,
    pub tip: Option<CommitId>,
    pub containers: Vec<String>,
    pub dirty_bytes: u64,
}

/// Branch as shown by `ShowDot`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchSummary {
    pub name: String,
    pub tip: Option<CommitId>,
    pub commits: usize,
    pub dirty_bytes: u64,
}

/// Result of `ShowDot`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DotDetails {
    pub name: VolumeName,
    pub id: Uuid,
    pub owner: String,
    pub collaborators: BTreeSet<String>,
    pub checked_out: String,
    pub default_subdot: String,
    pub branches: Vec<BranchSummary>,
    /// `defaultUpstreamDot` per remote
    pub upstreams: BTreeMap<String, VolumeName>,
    pub containers: Vec<String>,
    pub dirty_bytes: u64,
    pub created_at: i64,
}

/// One entry of `AllDotsAndBranches`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DotBranches {
    pub name: VolumeName,
    pub id: Uuid,
    pub branches: Vec<BranchRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub name: String,
    pub version: String,
}

pub(crate) fn dot_key(id: &Uuid) -> String {
    format!("dot:{}", id)
}

fn create_key(name: &VolumeName) -> String {
    format!("create:{}", name)
}

/// A control plane node
pub struct DotNode {
    pub(crate) config: NodeConfig,
    pub(crate) registry: Arc<Registry>,
    pub(crate) engine: Arc<dyn SnapshotEngine>,
    pub(crate) runtime: Arc<dyn WorkloadRuntime>,
    pub(crate) users: UserDirectory,
    pub(crate) authz: OwnershipAuthz,
    pub(crate) locks: DotLocks,
    pub(crate) flags: Arc<DebugFlags>,
    pub(crate) deletion: Arc<DeletionManager>,
    pub(crate) connector: Arc<dyn PeerConnector>,
}

impl DotNode {
    /// Build a node and bootstrap the admin identity
    pub async fn open(
        config: NodeConfig,
        store: Arc<dyn MetadataStore>,
        engine: Arc<dyn SnapshotEngine>,
        runtime: Arc<dyn WorkloadRuntime>,
        connector: Arc<dyn PeerConnector>,
    ) -> Result<Arc<Self>> {
        let registry = Arc::new(Registry::new(store.clone()));
        let users = UserDirectory::new(store, config.bcrypt_cost);
        users
            .ensure_admin(
                &config.admin_user,
                config.admin_password.as_deref(),
                config.admin_api_key.as_deref(),
            )
            .await?;

        let flags = Arc::new(DebugFlags::new());
        let deletion = Arc::new(DeletionManager::new(
            registry.clone(),
            engine.clone(),
            flags.clone(),
            &config.node_name,
            config.metadata_timeout(),
            config.drain_retry(),
        ));

        tracing::info!("Node {} ready (admin user {})", config.node_name, config.admin_user);
        Ok(Arc::new(Self {
            authz: OwnershipAuthz::new(&config.admin_user),
            config,
            registry,
            engine,
            runtime,
            users,
            locks: DotLocks::new(),
            flags,
            deletion,
            connector,
        }))
    }

    /// Start the deletion watcher and dirty scanner, resuming pending drains
    pub async fn start_background(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = vec![self.deletion.spawn_watcher()];
        let resumed = self.deletion.resume_pending().await?;
        if resumed > 0 {
            tracing::info!("Resumed {} pending deletions", resumed);
        }
        handles.push(self.spawn_dirty_scanner());
        Ok(handles)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn flags(&self) -> &DebugFlags {
        &self.flags
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Authenticate with an API key or password
    pub async fn authenticate(&self, user: &str, secret: &str) -> Result<Session> {
        Ok(Session::new(self.users.require(user, secret).await?))
    }

    pub fn version(&self) -> VersionInfo {
        VersionInfo {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    // ─────────────────────────────────────────────────────
    // Selection and locking
    // ─────────────────────────────────────────────────────

    pub(crate) fn is_admin(&self, session: &Session) -> bool {
        self.authz.is_admin(&session.user)
    }

    fn require_admin(&self, session: &Session, what: &str) -> Result<()> {
        if self.is_admin(session) {
            Ok(())
        } else {
            Err(DotError::Unauthorized(format!("{} is restricted to admin users", what)))
        }
    }

    /// Live dots the caller may read
    pub(crate) async fn visible_dots(&self, session: &Session) -> Result<Vec<DotRecord>> {
        Ok(self
            .registry
            .list_live()
            .await?
            .into_iter()
            .filter(|record| self.authz.can_read(&session.user, record))
            .collect())
    }

    /// Resolve the dot an operation applies to and check access
    ///
    /// An explicit name wins, then the session's selection; failing both,
    /// the caller's only visible dot is used.
    pub(crate) async fn resolve(
        &self,
        session: &Session,
        dot: Option<&str>,
        level: AccessLevel,
    ) -> Result<(DotRecord, u64)> {
        let name = match (dot, &session.current_dot) {
            (Some(name), _) => VolumeName::parse(name, session.namespace())?,
            (None, Some(current)) => current.clone(),
            (None, None) => {
                let mut visible = self.visible_dots(session).await?;
                if visible.len() != 1 {
                    return Err(DotError::NoSelection);
                }
                visible.remove(0).name
            }
        };
        let (record, revision) = self.registry.require(&name).await?;
        self.authz.require(&session.user, &record, level)?;
        Ok((record, revision))
    }

    /// Enter the exclusive section of `record` and re-read it
    pub(crate) async fn lock_dot(&self, record: &DotRecord) -> Result<(DotGuard, DotRecord, u64)> {
        let guard = self.locks.lock(&dot_key(&record.id)).await;
        match self.registry.get(&record.id).await? {
            Some((current, rev)) if current.state == DotState::Live => Ok((guard, current, rev)),
            _ => Err(DotError::NoSuchDot(record.name.to_string())),
        }
    }

    async fn locked(
        &self,
        session: &Session,
        dot: Option<&str>,
        level: AccessLevel,
    ) -> Result<(DotGuard, DotRecord, u64)> {
        let (record, _) = self.resolve(session, dot, level).await?;
        self.lock_dot(&record).await
    }

    /// Create a dot in the caller's name
    pub(crate) async fn create_dot(&self, session: &Session, name: &VolumeName) -> Result<DotRecord> {
        self.authz.require_create(&session.user, name)?;
        let _guard = self.locks.lock(&create_key(name)).await;
        self.registry
            .create(
                NewDot {
                    name,
                    default_branch: &self.config.default_branch,
                    default_subdot: &self.config.default_subdot,
                    node: &self.config.node_name,
                },
                self.engine.as_ref(),
                &self.flags,
            )
            .await
    }

    /// Make sure this node holds a working filesystem for `branch`
    pub(crate) async fn ensure_filesystem(&self, record: &DotRecord, branch: &BranchRecord) -> Result<FilesystemId> {
        let fs = FilesystemId::new(record.id, &branch.name);
        if self.engine.filesystem_exists(&fs).await? {
            return Ok(fs);
        }
        if let Some(tip) = branch.tip {
            if !self.engine.has_snapshot(&record.id, tip).await? {
                return Err(DotError::internal(format!(
                    "snapshot {} of {} is not held on node {}",
                    tip, record.name, self.config.node_name
                )));
            }
        }
        self.engine.clone_snapshot(&fs, branch.tip).await?;
        tracing::debug!("Materialized {}@{} on {}", record.name, branch.name, self.config.node_name);
        Ok(fs)
    }

    /// Containers currently mounting `fs`
    pub(crate) async fn attached_to(&self, fs: &FilesystemId) -> Result<Vec<Attachment>> {
        Ok(self
            .runtime
            .attachments(&fs.dot)
            .await?
            .into_iter()
            .filter(|a| a.fs == *fs)
            .collect())
    }

    // ─────────────────────────────────────────────────────
    // Dots
    // ─────────────────────────────────────────────────────

    /// Create an empty dot
    pub async fn init(&self, session: &Session, name: &str) -> Result<DotRecord> {
        let name = VolumeName::parse(name, session.namespace())?;
        self.create_dot(session, &name).await
    }

    /// Select the dot later calls default to
    pub async fn switch(&self, session: &mut Session, name: &str) -> Result<()> {
        let (record, _) = self.resolve(session, Some(name), AccessLevel::Read).await?;
        session.current_dot = Some(record.name);
        Ok(())
    }

    /// Resolve a compound volume name, creating the dot if it is missing
    pub async fn mount(&self, session: &Session, compound: &str) -> Result<MountPoint> {
        let volume = VolumeRef::parse(compound, session.namespace())?;
        let (record, created) = match self.registry.lookup(&volume.volume).await? {
            Some((record, _)) => (record, false),
            None => match self.create_dot(session, &volume.volume).await {
                Ok(record) => (record, true),
                // Lost a race with another creator
                Err(DotError::AlreadyExists(_)) => (self.registry.require(&volume.volume).await?.0, false),
                Err(e) => return Err(e),
            },
        };
        self.authz.require(&session.user, &record, AccessLevel::Write)?;

        let branch_name = volume.branch.clone().unwrap_or_else(|| record.checked_out.clone());
        let (branch, _) = self.registry.require_branch(&record, &branch_name).await?;
        let fs = self.ensure_filesystem(&record, &branch).await?;
        let subdot = resolve_subdot(volume.subdot.as_deref(), &record.default_subdot);

        Ok(MountPoint {
            dot: record.name,
            id: record.id,
            fs,
            pinned_branch: volume.branch,
            dir: subdot_dir(&subdot).to_string(),
            subdot,
            created,
        })
    }

    /// Mount a compound volume name into `container`
    pub async fn attach(&self, session: &Session, compound: &str, container: &str) -> Result<Attachment> {
        let mount = self.mount(session, compound).await?;
        let attachment = Attachment {
            container: container.to_string(),
            dot: mount.id,
            subdot: mount.subdot,
            pinned_branch: mount.pinned_branch,
            fs: mount.fs,
        };
        self.runtime.bind(attachment.clone()).await?;
        tracing::info!("Attached {} to {} ({})", container, mount.dot, attachment.fs);
        Ok(attachment)
    }

    /// Files visible through a compound volume name, in lexical order
    pub async fn list_files(&self, session: &Session, compound: &str) -> Result<Vec<String>> {
        let volume = VolumeRef::parse(compound, session.namespace())?;
        let (record, _) = self.registry.require(&volume.volume).await?;
        self.authz.require(&session.user, &record, AccessLevel::Read)?;

        let branch_name = volume.branch.unwrap_or_else(|| record.checked_out.clone());
        let (branch, _) = self.registry.require_branch(&record, &branch_name).await?;
        let fs = self.ensure_filesystem(&record, &branch).await?;
        let subdot = resolve_subdot(volume.subdot.as_deref(), &record.default_subdot);
        self.engine.list_files(&fs, subdot_dir(&subdot)).await
    }

    /// Delete a dot; its name is free again when this returns
    pub async fn delete_dot(&self, session: &Session, name: &str) -> Result<()> {
        let name = VolumeName::parse(name, session.namespace())?;
        let (record, _) = self.registry.require(&name).await?;
        let (_guard, record, revision) = self.lock_dot(&record).await?;
        self.authz.require(&session.user, &record, AccessLevel::Own)?;

        let containers: Vec<String> = self
            .runtime
            .attachments(&record.id)
            .await?
            .into_iter()
            .map(|a| a.container)
            .collect();
        if !containers.is_empty() {
            return Err(DotError::InUse {
                dot: record.name.to_string(),
                containers,
            });
        }

        let marker = self.deletion.soft_delete(record, revision).await?;
        self.deletion.spawn_drain(marker);
        Ok(())
    }

    // ─────────────────────────────────────────────────────
    // Commit graph
    // ─────────────────────────────────────────────────────

    /// Snapshot every subdot of a branch
    pub async fn commit(
        &self,
        session: &Session,
        dot: Option<&str>,
        branch: Option<&str>,
        message: &str,
    ) -> Result<CommitRecord> {
        let (_guard, record, _) = self.locked(session, dot, AccessLevel::Write).await?;
        let branch_name = branch.unwrap_or(&record.checked_out).to_string();
        let (branch, branch_rev) = self.registry.require_branch(&record, &branch_name).await?;
        let fs = self.ensure_filesystem(&record, &branch).await?;

        let targets = self.attached_to(&fs).await?;
        let mut saga = QuiesceSaga::new(
            self.runtime.as_ref(),
            QuiesceMode::Pause,
            self.config.quiesce_timeout(),
            targets,
        );
        saga.quiesce().await?;
        saga.begin_switch()?;

        let commit = CommitRecord::new(branch.tip, message, &session.user.name);
        if let Err(e) = self.record_commit(&record, &fs, branch, branch_rev, &commit).await {
            saga.abort().await;
            return Err(e);
        }
        saga.restore(|a| a.fs.clone()).await?;

        tracing::info!("Committed {} on {}@{}", commit.id, record.name, branch_name);
        Ok(commit)
    }

    async fn record_commit(
        &self,
        record: &DotRecord,
        fs: &FilesystemId,
        mut branch: BranchRecord,
        branch_rev: u64,
        commit: &CommitRecord,
    ) -> Result<()> {
        self.engine.create_snapshot(fs, commit.id).await?;

        let written = async {
            self.registry.put_commit(&record.id, commit).await?;
            branch.tip = Some(commit.id);
            self.registry
                .put_branch(&record.id, &branch, Expect::Revision(branch_rev))
                .await
        }
        .await;
        if let Err(e) = written {
            if let Err(undo) = self.registry.delete_commit(&record.id, &commit.id).await {
                tracing::error!("Failed to drop commit record {}: {}", commit.id, undo);
            }
            if let Err(undo) = self.engine.destroy_snapshot(&record.id, commit.id).await {
                tracing::error!("Failed to drop snapshot {}: {}", commit.id, undo);
            }
            return Err(e);
        }

        self.registry.record_dirty(&record.id, &branch.name, 0).await
    }

    /// Move the checked-out pointer, optionally creating the branch
    ///
    /// Containers that did not pin a branch are stopped and restarted on the
    /// new branch before this returns.
    pub async fn checkout(&self, session: &Session, dot: Option<&str>, branch: &str, create_new: bool) -> Result<()> {
        validate_branch(branch)?;
        let (_guard, mut record, revision) = self.locked(session, dot, AccessLevel::Write).await?;

        let target = if create_new {
            let (current, _) = self.registry.require_branch(&record, &record.checked_out).await?;
            let new = BranchRecord::new(branch, current.tip);
            self.registry.put_branch(&record.id, &new, Expect::Absent).await?;
            tracing::info!("Created branch {}@{} from {:?}", record.name, branch, current.tip);
            new
        } else {
            self.registry.require_branch(&record, branch).await?.0
        };
        if record.checked_out == branch {
            return Ok(());
        }
        let fs = self.ensure_filesystem(&record, &target).await?;

        let targets: Vec<Attachment> = self
            .runtime
            .attachments(&record.id)
            .await?
            .into_iter()
            .filter(|a| a.pinned_branch.is_none())
            .collect();
        let mut saga = QuiesceSaga::new(
            self.runtime.as_ref(),
            QuiesceMode::Stop,
            self.config.quiesce_timeout(),
            targets,
        );
        saga.quiesce().await?;
        saga.begin_switch()?;

        let previous = std::mem::replace(&mut record.checked_out, branch.to_string());
        if let Err(e) = self.registry.update(&record, revision).await {
            saga.abort().await;
            return Err(e);
        }
        saga.restore(|_| fs.clone()).await?;

        tracing::info!("Checked out {}@{} (was {})", record.name, branch, previous);
        Ok(())
    }

    /// Move the checked-out branch back to `target`
    ///
    /// A hard reset also rolls the filesystem back and restarts the
    /// containers mounting it. Later commits stay in the store.
    pub async fn reset(&self, session: &Session, dot: Option<&str>, target: &str, hard: bool) -> Result<CommitId> {
        let (_guard, record, _) = self.locked(session, dot, AccessLevel::Write).await?;
        let (mut branch, branch_rev) = self.registry.require_branch(&record, &record.checked_out).await?;
        let graph = self.registry.graph(&record.id).await?;
        let target_id = graph.resolve(branch.tip, target)?;
        branch.tip = Some(target_id);

        if !hard {
            self.registry
                .put_branch(&record.id, &branch, Expect::Revision(branch_rev))
                .await?;
            return Ok(target_id);
        }

        let fs = self.ensure_filesystem(&record, &branch).await?;
        let targets = self.attached_to(&fs).await?;
        let mut saga = QuiesceSaga::new(
            self.runtime.as_ref(),
            QuiesceMode::Stop,
            self.config.quiesce_timeout(),
            targets,
        );
        saga.quiesce().await?;
        saga.begin_switch()?;

        let switched = async {
            self.engine.rollback_to(&fs, target_id).await?;
            self.registry
                .put_branch(&record.id, &branch, Expect::Revision(branch_rev))
                .await?;
            self.registry.record_dirty(&record.id, &branch.name, 0).await
        }
        .await;
        if let Err(e) = switched {
            saga.abort().await;
            return Err(e);
        }
        saga.restore(|a| a.fs.clone()).await?;

        tracing::info!("Hard reset {}@{} to {}", record.name, branch.name, target_id);
        Ok(target_id)
    }

    /// History of a branch, newest first
    pub async fn log(&self, session: &Session, dot: Option<&str>, branch: Option<&str>) -> Result<Vec<CommitRecord>> {
        let (record, _) = self.resolve(session, dot, AccessLevel::Read).await?;
        let branch_name = branch.unwrap_or(&record.checked_out);
        let (branch, _) = self.registry.require_branch(&record, branch_name).await?;
        let graph = self.registry.graph(&record.id).await?;
        Ok(graph.log(branch.tip)?.into_iter().cloned().collect())
    }

    /// Branch names of a dot
    pub async fn branches(&self, session: &Session, dot: Option<&str>) -> Result<Vec<String>> {
        let (record, _) = self.resolve(session, dot, AccessLevel::Read).await?;
        Ok(self
            .registry
            .branches(&record.id)
            .await?
            .into_iter()
            .map(|b| b.name)
            .collect())
    }

    // ─────────────────────────────────────────────────────
    // Sharing
    // ─────────────────────────────────────────────────────

    pub async fn add_collaborator(&self, session: &Session, dot: Option<&str>, user: &str) -> Result<()> {
        let (_guard, mut record, revision) = self.locked(session, dot, AccessLevel::Own).await?;
        self.users.get(user).await?;
        if record.collaborators.insert(user.to_string()) {
            self.registry.update(&record, revision).await?;
            tracing::info!("Added {} as collaborator on {}", user, record.name);
        }
        Ok(())
    }

    /// Record `upstream` as the default dot on `remote`
    pub async fn set_upstream(&self, session: &Session, dot: Option<&str>, remote: &str, upstream: &str) -> Result<()> {
        let (_guard, mut record, revision) = self.locked(session, dot, AccessLevel::Write).await?;
        let upstream = VolumeName::parse(upstream, session.namespace())?;
        record.upstreams.insert(remote.to_string(), upstream);
        self.registry.update(&record, revision).await?;
        Ok(())
    }

    /// Save `upstream` for `remote` unless one is already recorded
    pub(crate) async fn remember_upstream(&self, record: &DotRecord, remote: &str, upstream: &VolumeName) -> Result<()> {
        let (_guard, mut record, revision) = self.lock_dot(record).await?;
        if record.upstreams.contains_key(remote) {
            return Ok(());
        }
        record.upstreams.insert(remote.to_string(), upstream.clone());
        self.registry.update(&record, revision).await?;
        tracing::debug!("Default upstream of {} on {} is {}", record.name, remote, upstream);
        Ok(())
    }

    // ─────────────────────────────────────────────────────
    // Listings
    // ─────────────────────────────────────────────────────

    async fn containers_of(&self, id: &Uuid) -> Result<Vec<String>> {
        let mut containers: Vec<String> = self
            .runtime
            .attachments(id)
            .await?
            .into_iter()
            .map(|a| a.container)
            .collect();
        containers.sort();
        Ok(containers)
    }

    pub async fn list_dots(&self, session: &Session) -> Result<Vec<DotSummary>> {
        let mut out = Vec::new();
        for record in self.visible_dots(session).await? {
            let tip = self
                .registry
                .branch(&record.id, &record.checked_out)
                .await?
                .and_then(|(b, _)| b.tip);
            out.push(DotSummary {
                name: record.name.display_relative(session.namespace()),
                id: record.id,
                tip,
                containers: self.containers_of(&record.id).await?,
                dirty_bytes: self.registry.recorded_dirty(&record.id, &record.checked_out).await?,
                branch: record.checked_out,
            });
        }
        Ok(out)
    }

    pub async fn show_dot(&self, session: &Session, dot: Option<&str>) -> Result<DotDetails> {
        let (record, _) = self.resolve(session, dot, AccessLevel::Read).await?;
        let graph = self.registry.graph(&record.id).await?;

        let mut branches = Vec::new();
        for branch in self.registry.branches(&record.id).await? {
            branches.push(BranchSummary {
                commits: graph.log(branch.tip)?.len(),
                dirty_bytes: self.registry.recorded_dirty(&record.id, &branch.name).await?,
                name: branch.name,
                tip: branch.tip,
            });
        }
        let dirty_bytes = branches
            .iter()
            .find(|b| b.name == record.checked_out)
            .map(|b| b.dirty_bytes)
            .unwrap_or(0);

        Ok(DotDetails {
            containers: self.containers_of(&record.id).await?,
            name: record.name,
            id: record.id,
            owner: record.owner,
            collaborators: record.collaborators,
            checked_out: record.checked_out,
            default_subdot: record.default_subdot,
            branches,
            upstreams: record.upstreams,
            dirty_bytes,
            created_at: record.created_at,
        })
    }

    pub async fn all_dots_and_branches(&self, session: &Session) -> Result<Vec<DotBranches>> {
        self.require_admin(session, "AllDotsAndBranches")?;
        let mut out = Vec::new();
        for record in self.registry.list_live().await? {
            out.push(DotBranches {
                branches: self.registry.branches(&record.id).await?,
                name: record.name,
                id: record.id,
            });
        }
        Ok(out)
    }

    // ─────────────────────────────────────────────────────
    // Users and debugging
    // ─────────────────────────────────────────────────────

    pub async fn register_user(&self, session: &Session, name: &str, email: &str, password: &str) -> Result<UserInfo> {
        self.require_admin(session, "registering users")?;
        let record = self.users.register(name, email, password, false).await?;
        Ok(UserInfo::from(&record))
    }

    pub async fn get_api_key(&self, session: &Session) -> Result<String> {
        self.users.get_api_key(&session.user).await
    }

    pub async fn reset_api_key(&self, session: &Session) -> Result<String> {
        self.users.reset_api_key(&session.user).await
    }

    pub async fn current_user(&self, session: &Session) -> Result<UserInfo> {
        self.users.current_user(&session.user).await
    }

    pub async fn set_debug_flag(&self, session: &Session, flag: &str, value: &str) -> Result<()> {
        self.require_admin(session, "SetDebugFlag")?;
        self.flags.set_named(flag, value)?;
        tracing::warn!("Debug flag {} set to {} on {}", flag, value, self.config.node_name);
        Ok(())
    }

    // ─────────────────────────────────────────────────────
    // Dirty scanner
    // ─────────────────────────────────────────────────────

    /// Record the dirty byte count of every branch held on this node
    pub async fn scan_dirty(&self) -> Result<()> {
        for record in self.registry.list_live().await? {
            let _guard = self.locks.lock(&dot_key(&record.id)).await;
            for branch in self.registry.branches(&record.id).await? {
                let fs = FilesystemId::new(record.id, &branch.name);
                if !self.engine.filesystem_exists(&fs).await? {
                    continue;
                }
                let bytes = self.engine.dirty_byte_count(&fs).await?;
                self.registry.record_dirty(&record.id, &branch.name, bytes).await?;
            }
        }
        Ok(())
    }

    fn spawn_dirty_scanner(self: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.config.dirty_poll());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = node.scan_dirty().await {
                    tracing::warn!("Dirty scan on {} failed: {}", node.config.node_name, e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::replication::LocalConnector;
    use crate::snapshot::MemorySnapshotEngine;
    use crate::store::MemoryStore;
    use crate::subdot::MemoryRuntime;

    struct Fixture {
        node: Arc<DotNode>,
        engine: Arc<MemorySnapshotEngine>,
        runtime: Arc<MemoryRuntime>,
        admin: Session,
    }

    async fn fixture() -> Fixture {
        let engine = Arc::new(MemorySnapshotEngine::new());
        let runtime = Arc::new(MemoryRuntime::new());
        let node = DotNode::open(
            NodeConfig::for_tests("node-0"),
            Arc::new(MemoryStore::new()),
            engine.clone(),
            runtime.clone(),
            Arc::new(LocalConnector::new()),
        )
        .await
        .unwrap();
        let admin = node.authenticate("admin", "admin-password").await.unwrap();
        Fixture {
            node,
            engine,
            runtime,
            admin,
        }
    }

    #[tokio::test]
    async fn test_commit_and_log() {
        let f = fixture().await;
        let record = f.node.init(&f.admin, "apples").await.unwrap();
        let fs = FilesystemId::new(record.id, "master");

        f.engine.write_file(&fs, "__default__/a", b"1").await.unwrap();
        let first = f.node.commit(&f.admin, None, None, "first").await.unwrap();
        f.engine.write_file(&fs, "__default__/b", b"2").await.unwrap();
        let second = f.node.commit(&f.admin, None, None, "second").await.unwrap();

        let log = f.node.log(&f.admin, Some("apples"), None).await.unwrap();
        let ids: Vec<_> = log.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
        assert_eq!(log[0].author, "admin");
    }

    #[tokio::test]
    async fn test_commit_needs_a_selection() {
        let f = fixture().await;
        let err = f.node.commit(&f.admin, None, None, "nothing").await.unwrap_err();
        assert_eq!(err.to_string(), "No current dot is selected");

        f.node.init(&f.admin, "one").await.unwrap();
        f.node.init(&f.admin, "two").await.unwrap();
        let err = f.node.commit(&f.admin, None, None, "ambiguous").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSelection);

        let mut session = f.admin.clone();
        f.node.switch(&mut session, "two").await.unwrap();
        f.node.commit(&session, None, None, "selected").await.unwrap();
    }

    #[tokio::test]
    async fn test_init_twice() {
        let f = fixture().await;
        f.node.init(&f.admin, "apples").await.unwrap();
        let err = f.node.init(&f.admin, "apples").await.unwrap_err();
        assert_eq!(err.to_string(), "admin/apples exists already");
    }

    #[tokio::test]
    async fn test_commit_pauses_attached_containers() {
        let f = fixture().await;
        f.node.attach(&f.admin, "apples", "web").await.unwrap();
        f.node.commit(&f.admin, Some("apples"), None, "live").await.unwrap();
        // Paused and unpaused, never restarted
        assert_eq!(f.runtime.start_count("web").await, 1);
        assert_eq!(
            f.runtime.status("web").await,
            Some(crate::subdot::ContainerStatus::Running)
        );
    }

    #[tokio::test]
    async fn test_reset_target_must_be_ancestor() {
        let f = fixture().await;
        f.node.init(&f.admin, "apples").await.unwrap();
        let err = f.node.reset(&f.admin, None, "HEAD", false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        f.node.commit(&f.admin, None, None, "one").await.unwrap();
        let err = f.node.reset(&f.admin, None, "HEAD^", true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_admin_only_calls() {
        let f = fixture().await;
        f.node
            .register_user(&f.admin, "bob", "bob@bob.com", "pw")
            .await
            .unwrap();
        let bob = f.node.authenticate("bob", "pw").await.unwrap();

        let err = f.node.set_debug_flag(&bob, "FailDrainReclaim", "true").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert!(f.node.all_dots_and_branches(&bob).await.is_err());
        assert!(f.node.register_user(&bob, "eve", "e@e", "pw").await.is_err());

        let err = f.node.set_debug_flag(&f.admin, "NoSuchFlag", "true").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        f.node.set_debug_flag(&f.admin, "FailDrainReclaim", "true").await.unwrap();
        assert!(f.node.flags().is_set(crate::config::DebugFlag::FailDrainReclaim));
    }

    #[tokio::test]
    async fn test_upstreams_and_listing() {
        let f = fixture().await;
        f.node.init(&f.admin, "apples").await.unwrap();
        f.node.commit(&f.admin, Some("apples"), None, "first").await.unwrap();
        f.node.checkout(&f.admin, Some("apples"), "dev", true).await.unwrap();

        f.node
            .set_upstream(&f.admin, Some("apples"), "hub", "alice/fruit")
            .await
            .unwrap();
        f.node
            .set_upstream(&f.admin, Some("apples"), "hub", "alice/apples")
            .await
            .unwrap();
        let details = f.node.show_dot(&f.admin, Some("apples")).await.unwrap();
        assert_eq!(details.upstreams.len(), 1);
        assert_eq!(details.upstreams["hub"].to_string(), "alice/apples");
        assert_eq!(details.checked_out, "dev");

        let all = f.node.all_dots_and_branches(&f.admin).await.unwrap();
        assert_eq!(all.len(), 1);
        let mut names: Vec<_> = all[0].branches.iter().map(|b| b.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["dev".to_string(), "master".to_string()]);
    }

    #[tokio::test]
    async fn test_dirty_scan_records_bytes() {
        let f = fixture().await;
        let record = f.node.init(&f.admin, "apples").await.unwrap();
        let fs = FilesystemId::new(record.id, "master");
        f.engine.write_file(&fs, "x", b"12345").await.unwrap();

        f.node.scan_dirty().await.unwrap();
        let dots = f.node.list_dots(&f.admin).await.unwrap();
        assert_eq!(dots[0].name, "apples");
        assert_eq!(dots[0].dirty_bytes, 5);

        f.node.commit(&f.admin, None, None, "clean").await.unwrap();
        let details = f.node.show_dot(&f.admin, None).await.unwrap();
        assert_eq!(details.dirty_bytes, 0);
        assert_eq!(details.branches[0].commits, 1);
    }

    #[test]
    fn test_lock_keys_do_not_collide() {
        let id = Uuid::new_v4();
        let name = VolumeName::new("admin", id.to_string()).unwrap();
        assert_ne!(dot_key(&id), create_key(&name));
    }
}
