//! Per-caller session context
//!
//! The session carries who is calling and which dot they have selected. It
//! is passed explicitly to every node operation; nodes keep no per-caller
//! state.

use crate::auth::AuthenticatedUser;
use crate::name::VolumeName;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user: AuthenticatedUser,
    /// Dot selected with `switch`, if any
    pub current_dot: Option<VolumeName>,
}

impl Session {
    pub fn new(user: AuthenticatedUser) -> Self {
        Self {
            user,
            current_dot: None,
        }
    }

    /// Namespace bare dot names resolve in
    pub fn namespace(&self) -> &str {
        &self.user.name
    }

    pub fn with_dot(mut self, dot: VolumeName) -> Self {
        self.current_dot = Some(dot);
        self
    }
}
