//! Error types for the dot control plane
//!
//! Every failure surfaced to a caller is a [`DotError`]. Errors are
//! serializable so they can cross the RPC boundary unchanged, and each
//! variant maps onto a coarse [`ErrorKind`] that callers branch on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for control plane operations
pub type Result<T> = std::result::Result<T, DotError>;

/// Coarse classification of a [`DotError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// No such dot, branch, commit, user or remote
    NotFound,
    /// Duplicate create
    AlreadyExists,
    /// Blocked by an attached workload
    InUse,
    /// Namespace or collaborator check failed
    NotOwner,
    /// Bad or missing credentials
    Unauthorized,
    /// No current dot and none could be inferred
    NoSelection,
    /// Uncommitted changes on the receiving side
    Dirty,
    /// Histories are not comparable
    Diverged,
    /// Malformed dot, branch or subdot name
    InvalidName,
    /// Test-only forced failure
    InjectedFault,
    /// Snapshot engine or metadata store failure
    Internal,
}

/// Errors returned by the control plane
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum DotError {
    #[error("No such filesystem: {0}")]
    NoSuchDot(String),

    #[error("No such branch {branch} on {dot}")]
    NoSuchBranch { dot: String, branch: String },

    #[error("No such commit: {0}")]
    NoSuchCommit(String),

    #[error("No such user: {0}")]
    NoSuchUser(String),

    #[error("No such remote: {0}")]
    NoSuchRemote(String),

    #[error("{0} exists already")]
    AlreadyExists(String),

    #[error("cannot delete the volume {dot}: in use by containers {containers:?}")]
    InUse { dot: String, containers: Vec<String> },

    #[error("cannot overwrite {dot}@{branch}: attached to running containers {containers:?}")]
    Attached {
        dot: String,
        branch: String,
        containers: Vec<String>,
    },

    #[error("You are not the owner of {0}")]
    NotOwner(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("No current dot is selected")]
    NoSelection,

    #[error("No upstream dot recorded for {dot} on remote {remote}")]
    NoUpstream { dot: String, remote: String },

    #[error("{dot}@{branch} has uncommitted changes ({bytes} bytes)")]
    UncommittedChanges { dot: String, branch: String, bytes: u64 },

    #[error("{dot}@{branch} has been modified since its last commit ({bytes} bytes)")]
    Modified { dot: String, branch: String, bytes: u64 },

    #[error("{dot}@{branch} has diverged: {detail}")]
    Diverged {
        dot: String,
        branch: String,
        detail: String,
    },

    #[error("Invalid dot name: {0}")]
    InvalidName(String),

    #[error("Invalid branch name: {0}")]
    InvalidBranch(String),

    #[error("Invalid commit reference: {0}")]
    InvalidRef(String),

    #[error("Unknown debug flag: {0}")]
    UnknownFlag(String),

    #[error("Injected fault: {0}")]
    InjectedFault(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DotError {
    /// Create a [`DotError::Internal`] from anything printable
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoSuchDot(_)
            | Self::NoSuchBranch { .. }
            | Self::NoSuchCommit(_)
            | Self::NoSuchUser(_)
            | Self::NoSuchRemote(_)
            | Self::UnknownFlag(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::InUse { .. } | Self::Attached { .. } => ErrorKind::InUse,
            Self::NotOwner(_) => ErrorKind::NotOwner,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::NoSelection | Self::NoUpstream { .. } => ErrorKind::NoSelection,
            Self::UncommittedChanges { .. } | Self::Modified { .. } => ErrorKind::Dirty,
            Self::Diverged { .. } => ErrorKind::Diverged,
            Self::InvalidName(_) | Self::InvalidBranch(_) | Self::InvalidRef(_) => {
                ErrorKind::InvalidName
            }
            Self::InjectedFault(_) => ErrorKind::InjectedFault,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<serde_json::Error> for DotError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("serialization error: {}", e))
    }
}

impl From<sled::Error> for DotError {
    fn from(e: sled::Error) -> Self {
        Self::Internal(format!("metadata store error: {}", e))
    }
}

impl From<std::io::Error> for DotError {
    fn from(e: std::io::Error) -> Self {
        Self::Internal(format!("I/O error: {}", e))
    }
}
