//! Dot naming
//!
//! A dot is addressed as `namespace/name`. Volume-driver mounts use the
//! compound form `namespace/name@branch.subdot`, where every part except
//! `name` is optional:
//!
//! ```text
//! apples                  -> <default ns>/apples, checked-out branch, default subdot
//! bob/apples@dev          -> bob/apples, pinned to branch dev
//! apples.frogs            -> subdot frogs
//! apples@dev.__root__     -> dev, top level of the dot
//! ```

use crate::error::{DotError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Subdot name denoting the top level of a dot
pub const ROOT_SUBDOT: &str = "__root__";

fn valid_segment(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 128
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Fully qualified dot name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VolumeName {
    pub namespace: String,
    pub name: String,
}

impl VolumeName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let name = name.into();
        if !valid_segment(&namespace) || !valid_segment(&name) {
            return Err(DotError::InvalidName(format!("{}/{}", namespace, name)));
        }
        Ok(Self { namespace, name })
    }

    /// Parse `ns/name` or a bare `name` in `default_namespace`
    pub fn parse(s: &str, default_namespace: &str) -> Result<Self> {
        let s = s.trim();
        let result = match s.split_once('/') {
            Some((ns, name)) => Self::new(ns, name),
            None => Self::new(default_namespace, s),
        };
        result.map_err(|_| DotError::InvalidName(s.to_string()))
    }

    /// Render without the namespace when it equals `default_namespace`
    pub fn display_relative(&self, default_namespace: &str) -> String {
        if self.namespace == default_namespace {
            self.name.clone()
        } else {
            self.to_string()
        }
    }
}

impl fmt::Display for VolumeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Parsed compound volume reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRef {
    pub volume: VolumeName,
    /// Branch pin; `None` follows the dot's checked-out branch
    pub branch: Option<String>,
    /// Subdot; `None` resolves to the dot's default subdot
    pub subdot: Option<String>,
}

impl VolumeRef {
    pub fn parse(s: &str, default_namespace: &str) -> Result<Self> {
        let invalid = || DotError::InvalidName(s.to_string());
        let s_trim = s.trim();

        let (namespace, rest) = match s_trim.split_once('/') {
            Some((ns, rest)) => (ns, rest),
            None => (default_namespace, s_trim),
        };

        let (name, branch, subdot) = match rest.split_once('@') {
            Some((name, tail)) => match tail.split_once('.') {
                Some((branch, subdot)) => (name, Some(branch), Some(subdot)),
                None => (name, Some(tail), None),
            },
            None => match rest.split_once('.') {
                Some((name, subdot)) => (name, None, Some(subdot)),
                None => (rest, None, None),
            },
        };

        let volume = VolumeName::new(namespace, name).map_err(|_| invalid())?;
        if let Some(branch) = branch {
            if !valid_segment(branch) {
                return Err(invalid());
            }
        }
        if let Some(subdot) = subdot {
            if !valid_segment(subdot) {
                return Err(invalid());
            }
        }

        Ok(Self {
            volume,
            branch: branch.map(str::to_string),
            subdot: subdot.map(str::to_string),
        })
    }
}

/// Validate a branch name
pub fn validate_branch(branch: &str) -> Result<()> {
    if valid_segment(branch) {
        Ok(())
    } else {
        Err(DotError::InvalidBranch(branch.to_string()))
    }
}
