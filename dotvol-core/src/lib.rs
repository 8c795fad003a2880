//! DotVol Core Library
//!
//! Control plane for versioned data volumes ("dots"), including:
//! - Metadata store abstraction (in-memory and sled) with compare-and-set and watches
//! - Dot registry with crash-safe two-phase creation
//! - Commit graph, branches and hard/soft reset
//! - Snapshot engine abstraction and an in-memory engine
//! - Subdots and the quiesce saga around workload containers
//! - Users, API keys and namespace/ownership authorization
//! - Deletion lifecycle with metadata drain
//! - Push, pull and clone between clusters

pub mod auth;
pub mod authz;
pub mod config;
pub mod deletion;
pub mod error;
pub mod graph;
pub mod locks;
pub mod name;
pub mod node;
pub mod registry;
pub mod remote;
pub mod replication;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod subdot;
pub mod transfer;

pub use auth::{AuthMethod, AuthProvider, AuthenticatedUser, UserDirectory, UserInfo};
pub use authz::{AccessLevel, AuthzProvider, OwnershipAuthz};
pub use config::{DebugFlag, DebugFlags, NodeConfig};
pub use error::{DotError, ErrorKind, Result};
pub use graph::{BranchRecord, CommitGraph, CommitId, CommitRecord, Relation};
pub use name::{VolumeName, VolumeRef};
pub use node::{BranchSummary, DotBranches, DotDetails, DotNode, DotSummary, MountPoint, VersionInfo};
pub use registry::{DotRecord, DotState, Registry};
pub use remote::{Remote, RemoteConfig};
pub use replication::{
    LocalConnector, PeerConnector, RemoteBranchState, ReplicationPeer, TransferBundle, TransferMessage,
    TransferSummary, PROTOCOL_MAGIC, PROTOCOL_VERSION,
};
pub use session::Session;
pub use snapshot::{FilesystemId, MemorySnapshotEngine, SnapshotDelta, SnapshotEngine};
pub use store::{MemoryStore, MetadataStore, SledStore};
pub use subdot::{Attachment, ContainerStatus, MemoryRuntime, WorkloadRuntime};
pub use transfer::{CloneRequest, PullRequest, PushRequest};
