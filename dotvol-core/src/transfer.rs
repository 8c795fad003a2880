//! Push, pull and clone
//!
//! The sending side compares its branch history with the peer's and ships
//! only the commits the peer lacks. The receiving side re-checks everything
//! inside the receiving dot's exclusive section before it touches state:
//!
//! 1. the incoming tip must fast-forward the branch, else `Diverged`
//! 2. recorded dirty bytes mean "uncommitted changes"; bytes found only now
//!    mean "has been modified"
//! 3. containers mounting the branch block the overwrite
//! 4. every ancestor of the incoming tip must have metadata
//!
//! Then deltas are applied oldest first, commit records written, and the
//! branch tip moved by compare-and-set. A failure on the way undoes the
//! snapshots created by this transfer.

use crate::authz::{AccessLevel, AuthzProvider};
use crate::error::{DotError, Result};
use crate::graph::{relation, BranchRecord, CommitId, Relation};
use crate::name::{validate_branch, VolumeName};
use crate::node::{dot_key, DotNode};
use crate::registry::DotRecord;
use crate::remote::Remote;
use crate::replication::{build_bundle, RemoteBranchState, ReplicationPeer, TransferBundle, TransferSummary};
use crate::session::Session;
use crate::snapshot::{FilesystemId, SnapshotRef};
use crate::store::Expect;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Instant;

/// Arguments of `Push`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Local dot; defaults to the session's selection
    pub dot: Option<String>,
    /// Defaults to the checked-out branch
    pub branch: Option<String>,
    /// Remote dot; defaults to the saved upstream, then `<remote user>/<name>`
    pub remote_dot: Option<String>,
}

/// Arguments of `Pull`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub dot: Option<String>,
    pub branch: Option<String>,
    /// Remote dot; defaults to the saved upstream
    pub remote_dot: Option<String>,
}

/// Arguments of `Clone`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneRequest {
    pub remote_dot: String,
    /// Defaults to the remote dot's name in the caller's namespace
    pub local_name: Option<String>,
    pub branch: Option<String>,
}

fn diverged(dot: &VolumeName, branch: &str, detail: &str) -> DotError {
    DotError::Diverged {
        dot: dot.to_string(),
        branch: branch.to_string(),
        detail: detail.to_string(),
    }
}

impl DotNode {
    // ─────────────────────────────────────────────────────
    // Client side
    // ─────────────────────────────────────────────────────

    /// Send the commits of a local branch to a remote
    pub async fn push(&self, session: &Session, remote: &Remote, request: PushRequest) -> Result<TransferSummary> {
        let started = Instant::now();
        let (record, _) = self.resolve(session, request.dot.as_deref(), AccessLevel::Read).await?;
        let branch_name = request.branch.unwrap_or_else(|| record.checked_out.clone());
        let (branch, _) = self.registry.require_branch(&record, &branch_name).await?;

        let peer = self.connector.connect(remote).await?;
        let target = match &request.remote_dot {
            Some(name) => VolumeName::parse(name, peer.identity())?,
            None => match record.upstreams.get(&remote.name) {
                Some(upstream) => upstream.clone(),
                None => VolumeName::new(peer.identity(), record.name.name.clone())?,
            },
        };

        let state = peer.describe(&target, &branch_name).await?;
        let graph = self.registry.graph(&record.id).await?;
        let local_chain = graph.chain(branch.tip)?;
        match relation(&local_chain, &state.chain) {
            Relation::Equal => {
                tracing::info!("{}@{} is already up to date on {}", target, branch_name, remote.name);
                self.remember_upstream(&record, &remote.name, &target).await?;
                return Ok(TransferSummary::unchanged(&target, &branch_name, branch.tip));
            }
            Relation::RemoteAhead => {
                return Err(diverged(
                    &target,
                    &branch_name,
                    "the remote branch has commits the local branch lacks",
                ))
            }
            Relation::Diverged => {
                return Err(diverged(&target, &branch_name, "histories have no common tip"))
            }
            Relation::RemoteEmpty | Relation::FastForward => {}
        }

        if state.dirty_bytes > 0 {
            return Err(DotError::UncommittedChanges {
                dot: target.to_string(),
                branch: branch_name,
                bytes: state.dirty_bytes,
            });
        }

        let tip = branch
            .tip
            .ok_or_else(|| DotError::internal(format!("{}@{} has no tip to push", record.name, branch_name)))?;
        let known: HashSet<CommitId> = state.known.into_iter().collect();
        let bundle = build_bundle(self.engine.as_ref(), &record.id, &graph, &branch_name, tip, &known).await?;

        let mut summary = peer.receive(&target, bundle).await?;
        self.remember_upstream(&record, &remote.name, &target).await?;
        summary.duration_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            "Pushed {} commits ({} bytes) of {}@{} to {} on {}",
            summary.commits,
            summary.bytes,
            record.name,
            branch_name,
            target,
            remote.name
        );
        Ok(summary)
    }

    /// Bring a local branch up to date with a remote
    pub async fn pull(&self, session: &Session, remote: &Remote, request: PullRequest) -> Result<TransferSummary> {
        let started = Instant::now();
        let (record, _) = self.resolve(session, request.dot.as_deref(), AccessLevel::Write).await?;
        let branch_name = request.branch.unwrap_or_else(|| record.checked_out.clone());
        validate_branch(&branch_name)?;

        let peer = self.connector.connect(remote).await?;
        let target = match &request.remote_dot {
            Some(name) => VolumeName::parse(name, peer.identity())?,
            None => record
                .upstreams
                .get(&remote.name)
                .cloned()
                .ok_or_else(|| DotError::NoUpstream {
                    dot: record.name.to_string(),
                    remote: remote.name.clone(),
                })?,
        };

        let mut summary = self.pull_from(&record, peer.as_ref(), &target, &branch_name).await?;
        self.remember_upstream(&record, &remote.name, &target).await?;
        summary.duration_ms = started.elapsed().as_millis() as u64;
        Ok(summary)
    }

    /// Create a local dot from a remote one
    ///
    /// The new dot's default upstream on `remote` is the source. If the
    /// transfer fails the new dot is removed again.
    pub async fn clone_dot(&self, session: &Session, remote: &Remote, request: CloneRequest) -> Result<TransferSummary> {
        let started = Instant::now();
        let peer = self.connector.connect(remote).await?;
        let target = VolumeName::parse(&request.remote_dot, peer.identity())?;
        let local_name = match &request.local_name {
            Some(name) => VolumeName::parse(name, session.namespace())?,
            None => VolumeName::new(session.namespace(), target.name.clone())?,
        };
        let branch_name = request
            .branch
            .unwrap_or_else(|| self.config.default_branch.clone());
        validate_branch(&branch_name)?;

        let state = peer.describe(&target, &branch_name).await?;
        if !state.exists {
            return Err(DotError::NoSuchDot(target.to_string()));
        }

        let record = self.create_dot(session, &local_name).await?;
        let result = async {
            self.remember_upstream(&record, &remote.name, &target).await?;
            if state.chain.is_empty() {
                return Ok(TransferSummary::unchanged(&local_name, &branch_name, None));
            }
            self.pull_from(&record, peer.as_ref(), &target, &branch_name).await
        }
        .await;

        match result {
            Ok(mut summary) => {
                summary.created = true;
                summary.duration_ms = started.elapsed().as_millis() as u64;
                tracing::info!("Cloned {} from {} as {}", target, remote.name, local_name);
                Ok(summary)
            }
            Err(e) => {
                tracing::warn!("Clone of {} failed, removing {}: {}", target, local_name, e);
                let _guard = self.locks.lock(&dot_key(&record.id)).await;
                if let Err(undo) = self.registry.revert(&record, self.engine.as_ref()).await {
                    tracing::error!("Failed to remove {}: {}", local_name, undo);
                }
                Err(e)
            }
        }
    }

    async fn pull_from(
        &self,
        record: &DotRecord,
        peer: &dyn ReplicationPeer,
        target: &VolumeName,
        branch_name: &str,
    ) -> Result<TransferSummary> {
        let state = peer.describe(target, branch_name).await?;
        if !state.exists {
            return Err(DotError::NoSuchDot(target.to_string()));
        }
        if state.chain.is_empty() {
            return Err(DotError::NoSuchBranch {
                dot: target.to_string(),
                branch: branch_name.to_string(),
            });
        }

        let graph = self.registry.graph(&record.id).await?;
        let local_tip = self
            .registry
            .branch(&record.id, branch_name)
            .await?
            .and_then(|(b, _)| b.tip);
        match relation(&graph.chain(local_tip)?, &state.chain) {
            Relation::Equal | Relation::FastForward | Relation::RemoteEmpty => {
                tracing::info!("{}@{} is already up to date", record.name, branch_name);
                return Ok(TransferSummary::unchanged(&record.name, branch_name, local_tip));
            }
            Relation::Diverged => {
                return Err(diverged(&record.name, branch_name, "histories have no common tip"))
            }
            Relation::RemoteAhead => {}
        }

        let have: Vec<CommitId> = graph.ids().copied().collect();
        let bundle = peer.fetch(target, branch_name, have).await?;
        bundle.validate()?;

        let (_guard, record, _) = self.lock_dot(record).await?;
        let summary = self.apply_bundle(&record, bundle).await?;
        tracing::info!(
            "Pulled {} commits ({} bytes) into {}@{} from {}",
            summary.commits,
            summary.bytes,
            record.name,
            branch_name,
            target
        );
        Ok(summary)
    }

    // ─────────────────────────────────────────────────────
    // Peer side
    // ─────────────────────────────────────────────────────

    /// State of a branch as seen by a pushing or pulling peer
    pub async fn describe_branch(&self, session: &Session, dot: &VolumeName, branch: &str) -> Result<RemoteBranchState> {
        let (record, _) = match self.registry.lookup(dot).await? {
            Some(found) => found,
            None => {
                // Same answer for a missing dot as for a foreign one
                self.authz.require_create(&session.user, dot)?;
                return Ok(RemoteBranchState::default());
            }
        };
        self.authz.require(&session.user, &record, AccessLevel::Read)?;

        let graph = self.registry.graph(&record.id).await?;
        let chain = match self.registry.branch(&record.id, branch).await? {
            Some((b, _)) => graph.chain(b.tip)?,
            None => Vec::new(),
        };
        Ok(RemoteBranchState {
            exists: true,
            chain,
            known: graph.ids().copied().collect(),
            dirty_bytes: self.registry.recorded_dirty(&record.id, branch).await?,
        })
    }

    /// Apply a pushed bundle, creating the dot if it does not exist
    pub async fn receive_bundle(&self, session: &Session, dot: &VolumeName, bundle: TransferBundle) -> Result<TransferSummary> {
        bundle.validate()?;
        validate_branch(&bundle.branch)?;

        let (record, created) = match self.registry.lookup(dot).await? {
            Some((record, _)) => (record, false),
            None => match self.create_dot(session, dot).await {
                Ok(record) => (record, true),
                // Another push created it first
                Err(DotError::AlreadyExists(_)) => (self.registry.require(dot).await?.0, false),
                Err(e) => return Err(e),
            },
        };
        if !created {
            self.authz.require(&session.user, &record, AccessLevel::Write)?;
        }

        let (_guard, record, _) = self.lock_dot(&record).await?;
        match self.apply_bundle(&record, bundle).await {
            Ok(mut summary) => {
                summary.created = created;
                Ok(summary)
            }
            Err(e) => {
                if created {
                    if let Err(undo) = self.registry.revert(&record, self.engine.as_ref()).await {
                        tracing::error!("Failed to remove {} after rejected push: {}", record.name, undo);
                    }
                }
                Err(e)
            }
        }
    }

    /// Bundle taking a holder of `have` to the tip of `branch`
    pub async fn fetch_bundle(
        &self,
        session: &Session,
        dot: &VolumeName,
        branch: &str,
        have: &[CommitId],
    ) -> Result<TransferBundle> {
        let (record, _) = self.registry.require(dot).await?;
        self.authz.require(&session.user, &record, AccessLevel::Read)?;
        let (branch_record, _) = self.registry.require_branch(&record, branch).await?;
        let tip = branch_record.tip.ok_or_else(|| DotError::NoSuchBranch {
            dot: record.name.to_string(),
            branch: branch.to_string(),
        })?;

        let graph = self.registry.graph(&record.id).await?;
        let known: HashSet<CommitId> = have.iter().copied().collect();
        build_bundle(self.engine.as_ref(), &record.id, &graph, branch, tip, &known).await
    }

    /// Apply a bundle to `record`; caller holds the dot's exclusive section
    async fn apply_bundle(&self, record: &DotRecord, bundle: TransferBundle) -> Result<TransferSummary> {
        let started = Instant::now();
        let branch_name = bundle.branch.clone();
        let existing = self.registry.branch(&record.id, &branch_name).await?;
        let local_tip = existing.as_ref().and_then(|(b, _)| b.tip);

        let mut graph = self.registry.graph(&record.id).await?;
        let local_chain = graph.chain(local_tip)?;
        let held: HashSet<CommitId> = graph.ids().copied().collect();
        for commit in &bundle.commits {
            graph.insert(commit.clone());
        }
        // The tip only moves once every commit below it has metadata here
        graph.verify_chain(Some(bundle.tip))?;
        let incoming_chain = graph.chain(Some(bundle.tip))?;

        match relation(&incoming_chain, &local_chain) {
            Relation::Equal => return Ok(TransferSummary::unchanged(&record.name, &branch_name, local_tip)),
            Relation::RemoteEmpty | Relation::FastForward => {}
            Relation::RemoteAhead => {
                return Err(diverged(
                    &record.name,
                    &branch_name,
                    "the receiving branch is ahead of the incoming commits",
                ))
            }
            Relation::Diverged => {
                return Err(diverged(&record.name, &branch_name, "histories have no common tip"))
            }
        }

        let fs = FilesystemId::new(record.id, &branch_name);
        let fs_existed = self.engine.filesystem_exists(&fs).await?;
        if fs_existed {
            let recorded = self.registry.recorded_dirty(&record.id, &branch_name).await?;
            if recorded > 0 {
                return Err(DotError::UncommittedChanges {
                    dot: record.name.to_string(),
                    branch: branch_name,
                    bytes: recorded,
                });
            }
            let live = self.engine.dirty_byte_count(&fs).await?;
            if live > 0 {
                return Err(DotError::Modified {
                    dot: record.name.to_string(),
                    branch: branch_name,
                    bytes: live,
                });
            }
        }

        let containers: Vec<String> = self
            .attached_to(&fs)
            .await?
            .into_iter()
            .map(|a| a.container)
            .collect();
        if !containers.is_empty() {
            return Err(DotError::Attached {
                dot: record.name.to_string(),
                branch: branch_name,
                containers,
            });
        }

        if let Some(base) = bundle.base {
            if !self.engine.has_snapshot(&record.id, base).await? {
                return Err(DotError::internal(format!(
                    "base snapshot {} of {} is not held on node {}",
                    base, record.name, self.config.node_name
                )));
            }
        }

        // Snapshots
        let mut created: Vec<SnapshotRef> = Vec::new();
        let mut outcome = Ok(());
        for delta in &bundle.deltas {
            if let Err(e) = self.engine.receive_snapshot(&fs, delta).await {
                outcome = Err(e);
                break;
            }
            if !held.contains(&delta.to) {
                created.push(delta.to);
            }
        }
        if outcome.is_ok() && bundle.deltas.is_empty() {
            // Tip already held through another branch
            outcome = if fs_existed {
                self.engine.rollback_to(&fs, bundle.tip).await
            } else {
                self.engine.clone_snapshot(&fs, Some(bundle.tip)).await
            };
        }

        // Metadata
        if outcome.is_ok() {
            outcome = async {
                for commit in &bundle.commits {
                    self.registry.put_commit(&record.id, commit).await?;
                }
                match &existing {
                    Some((branch, rev)) => {
                        let mut branch = branch.clone();
                        branch.tip = Some(bundle.tip);
                        self.registry
                            .put_branch(&record.id, &branch, Expect::Revision(*rev))
                            .await?;
                    }
                    None => {
                        let branch = BranchRecord {
                            name: branch_name.clone(),
                            tip: Some(bundle.tip),
                            origin: bundle.base,
                        };
                        self.registry.put_branch(&record.id, &branch, Expect::Absent).await?;
                    }
                }
                self.registry.record_dirty(&record.id, &branch_name, 0).await
            }
            .await;
        }

        if let Err(e) = outcome {
            tracing::warn!("Transfer into {}@{} failed, undoing: {}", record.name, branch_name, e);
            self.undo_receive(record, &fs, fs_existed, local_tip, &created, &bundle).await;
            return Err(e);
        }

        Ok(TransferSummary {
            dot: record.name.clone(),
            branch: branch_name,
            commits: bundle.commits.len() as u64,
            bytes: bundle.byte_len(),
            duration_ms: started.elapsed().as_millis() as u64,
            tip: Some(bundle.tip),
            created: false,
        })
    }

    async fn undo_receive(
        &self,
        record: &DotRecord,
        fs: &FilesystemId,
        fs_existed: bool,
        local_tip: Option<CommitId>,
        created: &[SnapshotRef],
        bundle: &TransferBundle,
    ) {
        for commit in bundle.commits.iter().filter(|c| created.contains(&c.id)) {
            if let Err(e) = self.registry.delete_commit(&record.id, &commit.id).await {
                tracing::error!("Failed to drop commit record {}: {}", commit.id, e);
            }
        }
        for snapshot in created {
            if let Err(e) = self.engine.destroy_snapshot(&record.id, *snapshot).await {
                tracing::error!("Failed to drop snapshot {}: {}", snapshot, e);
            }
        }

        let restored = match (fs_existed, local_tip) {
            (true, Some(tip)) => self.engine.rollback_to(fs, tip).await,
            (true, None) => match self.engine.destroy_filesystem(fs).await {
                Ok(()) => self.engine.create_filesystem(fs).await,
                Err(e) => Err(e),
            },
            (false, _) => self.engine.destroy_filesystem(fs).await,
        };
        if let Err(e) = restored {
            tracing::error!("Failed to restore {}: {}", fs, e);
        }
    }
}
