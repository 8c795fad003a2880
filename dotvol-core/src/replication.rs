//! Replication protocol
//!
//! Push, pull and clone move commits between clusters as a
//! [`TransferBundle`]: the commit records a peer is missing, oldest first,
//! with one snapshot delta per commit. Snapshots are named by commit id, so
//! the receiver replays each delta on top of the parent snapshot it already
//! holds.
//!
//! Peers are reached through [`ReplicationPeer`]. [`LocalPeer`] talks to a
//! node in the same process (tests, multi-cluster setups in one binary);
//! the server crate provides an HTTP implementation. Both carry messages in
//! the framed [`TransferMessage`] encoding.

use crate::error::{DotError, Result};
use crate::graph::{CommitGraph, CommitId, CommitRecord};
use crate::name::VolumeName;
use crate::node::DotNode;
use crate::remote::Remote;
use crate::session::Session;
use crate::snapshot::{SnapshotDelta, SnapshotEngine};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Envelope version; peers reject any other.
pub const PROTOCOL_VERSION: u8 = 1;

/// Magic bytes for framed transfer messages.
pub const PROTOCOL_MAGIC: &[u8; 4] = b"DOTV";

/// Maximum single message size (256 MB).
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024;

const HEADER_LEN: usize = 14;
const FLAG_COMPRESSED: u8 = 0x01;

/// What a peer knows about one branch of one dot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteBranchState {
    /// Whether the dot exists at all
    pub exists: bool,
    /// Branch history, newest first; empty when the branch is missing
    pub chain: Vec<CommitId>,
    /// Every commit the dot holds, on any branch
    pub known: Vec<CommitId>,
    /// Dirty bytes last recorded for the branch
    pub dirty_bytes: u64,
}

/// Commits and snapshot deltas for one branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferBundle {
    pub branch: String,
    pub tip: CommitId,
    /// Commit the first delta applies on top of
    pub base: Option<CommitId>,
    /// Oldest first
    pub commits: Vec<CommitRecord>,
    /// One per commit, same order
    pub deltas: Vec<SnapshotDelta>,
}

impl TransferBundle {
    /// Payload size of all deltas
    pub fn byte_len(&self) -> u64 {
        self.deltas.iter().map(SnapshotDelta::byte_len).sum()
    }

    /// Check that commits and deltas line up into a single chain
    pub fn validate(&self) -> Result<()> {
        if self.commits.len() != self.deltas.len() {
            return Err(DotError::internal(format!(
                "bundle carries {} commits but {} deltas",
                self.commits.len(),
                self.deltas.len()
            )));
        }
        let mut parent = self.base;
        for (commit, delta) in self.commits.iter().zip(&self.deltas) {
            if commit.parent != parent || delta.from != parent || delta.to != commit.id {
                return Err(DotError::internal(format!(
                    "bundle is not a contiguous chain at commit {}",
                    commit.id
                )));
            }
            parent = Some(commit.id);
        }
        match self.commits.last() {
            Some(last) if last.id != self.tip => Err(DotError::internal(format!(
                "bundle ends at {} instead of its tip {}",
                last.id, self.tip
            ))),
            _ => Ok(()),
        }
    }
}

/// Outcome of a push, pull or clone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSummary {
    pub dot: VolumeName,
    pub branch: String,
    /// Commits transferred
    pub commits: u64,
    /// Delta bytes transferred
    pub bytes: u64,
    pub duration_ms: u64,
    /// Branch tip after the transfer
    pub tip: Option<CommitId>,
    /// Whether the receiving dot was created by this transfer
    pub created: bool,
}

impl TransferSummary {
    /// Summary of a transfer that had nothing to do
    pub fn unchanged(dot: &VolumeName, branch: &str, tip: Option<CommitId>) -> Self {
        Self {
            dot: dot.clone(),
            branch: branch.to_string(),
            commits: 0,
            bytes: 0,
            duration_ms: 0,
            tip,
            created: false,
        }
    }
}

/// Envelope for all peer messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransferMessage {
    Describe { dot: VolumeName, branch: String },
    State(RemoteBranchState),
    Fetch { dot: VolumeName, branch: String, have: Vec<CommitId> },
    Bundle { dot: VolumeName, bundle: TransferBundle },
    Summary(TransferSummary),
}

fn read_u32(data: &[u8], offset: usize) -> Result<usize> {
    let bytes: [u8; 4] = data
        .get(offset..offset + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| DotError::internal("Message too short for header"))?;
    Ok(u32::from_le_bytes(bytes) as usize)
}

impl TransferMessage {
    /// Serialize a message to bytes with a length prefix.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)
            .map_err(|e| DotError::internal(format!("Failed to serialize transfer message: {}", e)))?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(DotError::internal(format!(
                "Message too large: {} bytes (max {})",
                payload.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        let mut buf = Vec::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Deserialize a message from bytes (after reading the length prefix).
    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data)
            .map_err(|e| DotError::internal(format!("Failed to deserialize transfer message: {}", e)))
    }

    /// Encode with zstd compression.
    pub fn encode_compressed(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)
            .map_err(|e| DotError::internal(format!("Failed to serialize transfer message: {}", e)))?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(DotError::internal(format!(
                "Message too large: {} bytes (max {})",
                payload.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        let compressed = zstd::encode_all(&payload[..], 3)
            .map_err(|e| DotError::internal(format!("Failed to compress transfer message: {}", e)))?;
        // Header: [magic(4)] [version(1)] [flags(1)] [uncompressed_len(4)] [compressed_len(4)] [data]
        let mut buf = Vec::with_capacity(HEADER_LEN + compressed.len());
        buf.extend_from_slice(PROTOCOL_MAGIC);
        buf.push(PROTOCOL_VERSION);
        buf.push(FLAG_COMPRESSED);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        buf.extend_from_slice(&compressed);
        Ok(buf)
    }

    /// Decode a compressed message.
    pub fn decode_compressed(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(DotError::internal("Message too short for header"));
        }
        if &data[0..4] != PROTOCOL_MAGIC {
            return Err(DotError::internal("Invalid protocol magic"));
        }
        if data[4] != PROTOCOL_VERSION {
            return Err(DotError::internal(format!(
                "Unsupported transfer protocol version {} (expected {})",
                data[4], PROTOCOL_VERSION
            )));
        }
        let flags = data[5];
        let uncompressed_len = read_u32(data, 6)?;
        let compressed_len = read_u32(data, 10)?;
        if uncompressed_len > MAX_MESSAGE_SIZE {
            return Err(DotError::internal(format!(
                "Message too large: {} bytes (max {})",
                uncompressed_len, MAX_MESSAGE_SIZE
            )));
        }
        if data.len() < HEADER_LEN + compressed_len {
            return Err(DotError::internal("Message truncated"));
        }

        let body = &data[HEADER_LEN..HEADER_LEN + compressed_len];
        let payload = if flags & FLAG_COMPRESSED != 0 {
            zstd::decode_all(body).map_err(|e| DotError::internal(format!("Failed to decompress: {}", e)))?
        } else {
            body.to_vec()
        };

        Self::decode(&payload)
    }
}

/// Collect what a peer holding `known` is missing to reach `tip`
pub async fn build_bundle(
    engine: &dyn SnapshotEngine,
    dot: &Uuid,
    graph: &CommitGraph,
    branch: &str,
    tip: CommitId,
    known: &HashSet<CommitId>,
) -> Result<TransferBundle> {
    let commits = graph.missing(Some(tip), known)?;
    let base = commits.first().and_then(|c| c.parent);
    let mut deltas = Vec::with_capacity(commits.len());
    for commit in &commits {
        deltas.push(engine.send_snapshot(dot, commit.parent, commit.id).await?);
    }
    Ok(TransferBundle {
        branch: branch.to_string(),
        tip,
        base,
        commits,
        deltas,
    })
}

// ─────────────────────────────────────────────────────
// Peers
// ─────────────────────────────────────────────────────

/// The remote side of a transfer, authenticated as one identity
#[async_trait]
pub trait ReplicationPeer: Send + Sync {
    /// Identity the peer authenticated us as
    fn identity(&self) -> &str;

    /// State of `branch` of `dot` on the peer
    async fn describe(&self, dot: &VolumeName, branch: &str) -> Result<RemoteBranchState>;

    /// Apply a bundle to `dot` on the peer, creating the dot if needed
    async fn receive(&self, dot: &VolumeName, bundle: TransferBundle) -> Result<TransferSummary>;

    /// Bundle taking a holder of `have` to the peer's tip of `branch`
    async fn fetch(&self, dot: &VolumeName, branch: &str, have: Vec<CommitId>) -> Result<TransferBundle>;
}

/// Resolves a configured remote to a connected peer
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, remote: &Remote) -> Result<Arc<dyn ReplicationPeer>>;
}

/// Connector for nodes living in this process, keyed by endpoint
#[derive(Default)]
pub struct LocalConnector {
    nodes: RwLock<HashMap<String, Arc<DotNode>>>,
}

impl LocalConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, endpoint: &str, node: Arc<DotNode>) {
        self.nodes.write().await.insert(endpoint.to_string(), node);
    }
}

#[async_trait]
impl PeerConnector for LocalConnector {
    async fn connect(&self, remote: &Remote) -> Result<Arc<dyn ReplicationPeer>> {
        let node = self
            .nodes
            .read()
            .await
            .get(&remote.endpoint)
            .cloned()
            .ok_or_else(|| DotError::NoSuchRemote(remote.endpoint.clone()))?;
        let session = node.authenticate(&remote.user, &remote.api_key).await?;
        Ok(Arc::new(LocalPeer { node, session }))
    }
}

/// In-process peer; messages still go through the wire encoding
pub struct LocalPeer {
    node: Arc<DotNode>,
    session: Session,
}

impl LocalPeer {
    fn round_trip(message: TransferMessage) -> Result<TransferMessage> {
        TransferMessage::decode_compressed(&message.encode_compressed()?)
    }
}

fn unexpected(message: &TransferMessage) -> DotError {
    DotError::internal(format!("unexpected transfer message {:?}", std::mem::discriminant(message)))
}

#[async_trait]
impl ReplicationPeer for LocalPeer {
    fn identity(&self) -> &str {
        &self.session.user.name
    }

    async fn describe(&self, dot: &VolumeName, branch: &str) -> Result<RemoteBranchState> {
        let state = self.node.describe_branch(&self.session, dot, branch).await?;
        match Self::round_trip(TransferMessage::State(state))? {
            TransferMessage::State(state) => Ok(state),
            other => Err(unexpected(&other)),
        }
    }

    async fn receive(&self, dot: &VolumeName, bundle: TransferBundle) -> Result<TransferSummary> {
        let message = Self::round_trip(TransferMessage::Bundle {
            dot: dot.clone(),
            bundle,
        })?;
        match message {
            TransferMessage::Bundle { dot, bundle } => {
                self.node.receive_bundle(&self.session, &dot, bundle).await
            }
            other => Err(unexpected(&other)),
        }
    }

    async fn fetch(&self, dot: &VolumeName, branch: &str, have: Vec<CommitId>) -> Result<TransferBundle> {
        let bundle = self.node.fetch_bundle(&self.session, dot, branch, &have).await?;
        match Self::round_trip(TransferMessage::Bundle {
            dot: dot.clone(),
            bundle,
        })? {
            TransferMessage::Bundle { bundle, .. } => Ok(bundle),
            other => Err(unexpected(&other)),
        }
    }
}
