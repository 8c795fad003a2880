//! Authorization
//!
//! Dots are owned by the identity whose namespace they live in:
//! - the owner may do anything to a dot
//! - collaborators may read and write but not delete or share it
//! - admin identities bypass every check
//!
//! Creating a dot requires the namespace to be the caller's own. A refused
//! request must not reveal whether the target exists, so a missing dot in a
//! foreign namespace is refused exactly like an existing foreign dot.

use crate::auth::AuthenticatedUser;
use crate::error::{DotError, Result};
use crate::name::VolumeName;
use crate::registry::DotRecord;

/// Access level required by an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessLevel {
    /// Log, show, describe, fetch
    Read,
    /// Commit, checkout, reset, receive pushes
    Write,
    /// Delete, add collaborators
    Own,
}

/// Authorization result
#[derive(Debug, Clone, PartialEq)]
pub enum AuthzResult {
    /// Access granted
    Granted,
    /// Access denied
    Denied,
    /// Authorization error
    Error(String),
}

/// Authorization provider trait
pub trait AuthzProvider: Send + Sync {
    /// Check if a user has the required access to an existing dot
    fn check_access(&self, user: &AuthenticatedUser, dot: &DotRecord, level: AccessLevel) -> AuthzResult;

    /// Check if a user may create (or be told about) a dot at `name`
    fn check_create(&self, user: &AuthenticatedUser, name: &VolumeName) -> AuthzResult;

    fn can_read(&self, user: &AuthenticatedUser, dot: &DotRecord) -> bool {
        matches!(self.check_access(user, dot, AccessLevel::Read), AuthzResult::Granted)
    }

    fn can_write(&self, user: &AuthenticatedUser, dot: &DotRecord) -> bool {
        matches!(self.check_access(user, dot, AccessLevel::Write), AuthzResult::Granted)
    }

    /// Like `check_access`, as a `Result`
    fn require(&self, user: &AuthenticatedUser, dot: &DotRecord, level: AccessLevel) -> Result<()> {
        match self.check_access(user, dot, level) {
            AuthzResult::Granted => Ok(()),
            AuthzResult::Denied => Err(DotError::NotOwner(dot.name.to_string())),
            AuthzResult::Error(e) => Err(DotError::Internal(e)),
        }
    }

    /// Like `check_create`, as a `Result`
    fn require_create(&self, user: &AuthenticatedUser, name: &VolumeName) -> Result<()> {
        match self.check_create(user, name) {
            AuthzResult::Granted => Ok(()),
            AuthzResult::Denied => Err(DotError::NotOwner(name.to_string())),
            AuthzResult::Error(e) => Err(DotError::Internal(e)),
        }
    }
}

/// Namespace/ownership based authorization
#[derive(Debug, Clone)]
pub struct OwnershipAuthz {
    admin_user: String,
}

impl OwnershipAuthz {
    pub fn new(admin_user: &str) -> Self {
        Self {
            admin_user: admin_user.to_string(),
        }
    }

    pub fn is_admin(&self, user: &AuthenticatedUser) -> bool {
        user.admin || user.name == self.admin_user
    }
}

impl AuthzProvider for OwnershipAuthz {
    fn check_access(&self, user: &AuthenticatedUser, dot: &DotRecord, level: AccessLevel) -> AuthzResult {
        if self.is_admin(user) || dot.owner == user.name {
            return AuthzResult::Granted;
        }
        let collaborator = dot.collaborators.contains(&user.name);
        match level {
            AccessLevel::Read | AccessLevel::Write if collaborator => AuthzResult::Granted,
            _ => AuthzResult::Denied,
        }
    }

    fn check_create(&self, user: &AuthenticatedUser, name: &VolumeName) -> AuthzResult {
        if self.is_admin(user) || name.namespace == user.name {
            AuthzResult::Granted
        } else {
            AuthzResult::Denied
        }
    }
}
