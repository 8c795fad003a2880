//! Commit/branch graph
//!
//! Commits are immutable records keyed by id with a back-reference to their
//! parent. A dot's history is an arena of these records; branches are a
//! separate map from branch name to tip id. Nothing in here touches the
//! store, callers load the records and hand them to [`CommitGraph`].

use crate::error::{DotError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Globally unique commit id; also names the commit's snapshot
pub type CommitId = Uuid;

/// Immutable commit metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub id: CommitId,
    pub parent: Option<CommitId>,
    pub message: String,
    pub author: String,
    /// Unix seconds
    pub timestamp: i64,
}

impl CommitRecord {
    pub fn new(parent: Option<CommitId>, message: &str, author: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent,
            message: message.to_string(),
            author: author.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Mutable branch pointer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRecord {
    pub name: String,
    /// `None` until the first commit on the branch
    pub tip: Option<CommitId>,
    /// Commit the branch was created from
    pub origin: Option<CommitId>,
}

impl BranchRecord {
    pub fn new(name: &str, origin: Option<CommitId>) -> Self {
        Self {
            name: name.to_string(),
            tip: origin,
            origin,
        }
    }
}

/// How a local branch relates to its remote counterpart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// Same tip, nothing to transfer
    Equal,
    /// Remote has no history for the branch
    RemoteEmpty,
    /// Remote tip is an ancestor of the local tip
    FastForward,
    /// Local tip is an ancestor of the remote tip
    RemoteAhead,
    /// Neither tip is an ancestor of the other
    Diverged,
}

/// Classify two branch histories given as newest-first id chains
pub fn relation(local_chain: &[CommitId], remote_chain: &[CommitId]) -> Relation {
    match (local_chain.first(), remote_chain.first()) {
        (None, None) => Relation::Equal,
        (Some(_), None) => Relation::RemoteEmpty,
        (None, Some(_)) => Relation::RemoteAhead,
        (Some(local), Some(remote)) if local == remote => Relation::Equal,
        (Some(local), Some(remote)) => {
            if local_chain.contains(remote) {
                Relation::FastForward
            } else if remote_chain.contains(local) {
                Relation::RemoteAhead
            } else {
                Relation::Diverged
            }
        }
    }
}

/// Arena of a dot's commits
#[derive(Debug, Clone, Default)]
pub struct CommitGraph {
    commits: HashMap<CommitId, CommitRecord>,
}

impl CommitGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = CommitRecord>) -> Self {
        let mut graph = Self::new();
        for record in records {
            graph.insert(record);
        }
        graph
    }

    pub fn insert(&mut self, record: CommitRecord) {
        self.commits.insert(record.id, record);
    }

    pub fn get(&self, id: &CommitId) -> Option<&CommitRecord> {
        self.commits.get(id)
    }

    pub fn contains(&self, id: &CommitId) -> bool {
        self.commits.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &CommitId> {
        self.commits.keys()
    }

    /// Commits reachable from `tip`, newest first
    ///
    /// Fails if any commit on the way has no metadata.
    pub fn log(&self, tip: Option<CommitId>) -> Result<Vec<&CommitRecord>> {
        let mut out = Vec::new();
        let mut cursor = tip;
        while let Some(id) = cursor {
            // Parent links are acyclic by construction; bound the walk anyway
            if out.len() > self.commits.len() {
                return Err(DotError::internal(format!("commit cycle detected at {}", id)));
            }
            let record = self.commits.get(&id).ok_or_else(|| {
                DotError::internal(format!("missing metadata for ancestor commit {}", id))
            })?;
            out.push(record);
            cursor = record.parent;
        }
        Ok(out)
    }

    /// Ids reachable from `tip`, newest first
    pub fn chain(&self, tip: Option<CommitId>) -> Result<Vec<CommitId>> {
        Ok(self.log(tip)?.into_iter().map(|c| c.id).collect())
    }

    /// Check that every ancestor of `tip` has metadata
    pub fn verify_chain(&self, tip: Option<CommitId>) -> Result<()> {
        self.log(tip).map(|_| ())
    }

    /// Whether `ancestor` is `descendant` or one of its ancestors
    pub fn is_ancestor(&self, ancestor: &CommitId, descendant: &CommitId) -> bool {
        let mut cursor = Some(*descendant);
        let mut steps = 0;
        while let Some(id) = cursor {
            if id == *ancestor {
                return true;
            }
            steps += 1;
            if steps > self.commits.len() {
                return false;
            }
            cursor = self.commits.get(&id).and_then(|c| c.parent);
        }
        false
    }

    /// Commits reachable from `tip` that are not in `known`, oldest first
    ///
    /// The walk stops at the first known commit, so the result is exactly the
    /// chain a peer holding `known` is missing.
    pub fn missing(&self, tip: Option<CommitId>, known: &HashSet<CommitId>) -> Result<Vec<CommitRecord>> {
        let mut out = Vec::new();
        for record in self.log(tip)? {
            if known.contains(&record.id) {
                break;
            }
            out.push(record.clone());
        }
        out.reverse();
        Ok(out)
    }

    /// Resolve a reset target relative to `tip`
    ///
    /// Accepts `HEAD`, `HEAD^`, `HEAD^^...`, `HEAD~N` and full commit ids.
    /// The result is always `tip` or one of its ancestors.
    pub fn resolve(&self, tip: Option<CommitId>, reference: &str) -> Result<CommitId> {
        let reference = reference.trim();
        let head = tip.ok_or_else(|| DotError::NoSuchCommit(reference.to_string()))?;

        if let Some(rest) = reference.strip_prefix("HEAD") {
            let steps = if rest.is_empty() {
                0
            } else if rest.chars().all(|c| c == '^') {
                rest.len()
            } else if let Some(n) = rest.strip_prefix('~') {
                n.parse::<usize>()
                    .map_err(|_| DotError::InvalidRef(reference.to_string()))?
            } else {
                return Err(DotError::InvalidRef(reference.to_string()));
            };

            let mut cursor = head;
            for _ in 0..steps {
                cursor = self
                    .commits
                    .get(&cursor)
                    .and_then(|c| c.parent)
                    .ok_or_else(|| DotError::NoSuchCommit(reference.to_string()))?;
            }
            return Ok(cursor);
        }

        let id = Uuid::parse_str(reference).map_err(|_| DotError::InvalidRef(reference.to_string()))?;
        if !self.contains(&id) {
            return Err(DotError::NoSuchCommit(reference.to_string()));
        }
        if !self.is_ancestor(&id, &head) {
            return Err(DotError::InvalidRef(format!(
                "{} is not an ancestor of the branch tip",
                reference
            )));
        }
        Ok(id)
    }
}
