//! Client-side remote configuration
//!
//! A remote is a named cluster endpoint plus the credentials to use there.
//! This is client state, kept in a JSON file next to the client; the
//! per-dot default upstream for each remote is cluster state and lives on
//! the dot record instead.

use crate::error::{DotError, Result as DotResult};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// File name of the remote configuration inside a client directory
pub const REMOTES_FILE: &str = "remotes.json";

/// A named cluster endpoint with credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remote {
    pub name: String,
    /// Base URL of the cluster (or an in-process endpoint name)
    pub endpoint: String,
    pub user: String,
    pub api_key: String,
}

impl Remote {
    pub fn new(name: &str, endpoint: &str, user: &str, api_key: &str) -> Self {
        Self {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            user: user.to_string(),
            api_key: api_key.to_string(),
        }
    }
}

/// Every remote a client knows, plus the current one
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub current: Option<String>,
    pub remotes: BTreeMap<String, Remote>,
}

impl RemoteConfig {
    /// Load the remote config from a client directory.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(REMOTES_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read remote config from {:?}", path))?;
        let config: RemoteConfig =
            serde_json::from_str(&data).with_context(|| "Failed to parse remote config JSON")?;
        Ok(config)
    }

    /// Save the remote config to a client directory.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(REMOTES_FILE);
        let tmp_path = path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Add a remote; the first one added becomes current
    pub fn add(&mut self, remote: Remote) -> DotResult<()> {
        if self.remotes.contains_key(&remote.name) {
            return Err(DotError::AlreadyExists(format!("remote {}", remote.name)));
        }
        if self.current.is_none() {
            self.current = Some(remote.name.clone());
        }
        self.remotes.insert(remote.name.clone(), remote);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> DotResult<Remote> {
        let removed = self
            .remotes
            .remove(name)
            .ok_or_else(|| DotError::NoSuchRemote(name.to_string()))?;
        if self.current.as_deref() == Some(name) {
            self.current = None;
        }
        Ok(removed)
    }

    pub fn switch(&mut self, name: &str) -> DotResult<()> {
        if !self.remotes.contains_key(name) {
            return Err(DotError::NoSuchRemote(name.to_string()));
        }
        self.current = Some(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> DotResult<&Remote> {
        self.remotes
            .get(name)
            .ok_or_else(|| DotError::NoSuchRemote(name.to_string()))
    }

    pub fn current(&self) -> DotResult<&Remote> {
        match &self.current {
            Some(name) => self.get(name),
            None => Err(DotError::NoSuchRemote("(no current remote)".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_add_switch_remove() {
        let mut config = RemoteConfig::default();
        config.add(Remote::new("origin", "http://a:6969", "alice", "k1")).unwrap();
        config.add(Remote::new("hub", "http://b:6969", "alice", "k2")).unwrap();
        assert_eq!(config.current().unwrap().name, "origin");

        assert!(config.add(Remote::new("hub", "x", "y", "z")).is_err());
        config.switch("hub").unwrap();
        assert_eq!(config.current().unwrap().endpoint, "http://b:6969");

        config.remove("hub").unwrap();
        assert!(config.current().is_err());
        assert!(config.switch("hub").is_err());
    }

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(RemoteConfig::load(tmp.path()).unwrap(), RemoteConfig::default());

        let mut config = RemoteConfig::default();
        config.add(Remote::new("origin", "http://a:6969", "alice", "k1")).unwrap();
        config.save(tmp.path()).unwrap();

        let loaded = RemoteConfig::load(tmp.path()).unwrap();
        assert_eq!(loaded, config);
        assert!(!tmp.path().join("remotes.tmp").exists());
    }
}
