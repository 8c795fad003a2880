//! Node configuration
//!
//! `NodeConfig` is read from a TOML file (every field optional) with a few
//! environment overrides on top. `DebugFlags` are the runtime-toggleable
//! fault-injection switches exposed through the `SetDebugFlag` call.

use crate::error::{DotError, Result as DotResult};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::RwLock;
use std::time::Duration;

/// Environment variable overriding the metadata-drain timeout, in seconds
pub const METADATA_TIMEOUT_ENV: &str = "FILESYSTEM_METADATA_TIMEOUT";

/// Configuration of a single node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Human-readable node name used in logs
    pub node_name: String,
    /// Identity that bypasses ownership checks
    pub admin_user: String,
    /// Bootstrap password for the admin identity
    pub admin_password: Option<String>,
    /// Bootstrap API key for the admin identity (generated if unset)
    pub admin_api_key: Option<String>,
    pub default_branch: String,
    pub default_subdot: String,
    /// How long a deletion marker is kept after its metadata is drained
    pub metadata_timeout_ms: u64,
    /// Delay between failed reclamation attempts
    pub drain_retry_ms: u64,
    /// Upper bound on pausing or stopping attached containers
    pub quiesce_timeout_ms: u64,
    /// Interval of the background dirty-state scanner
    pub dirty_poll_ms: u64,
    pub bcrypt_cost: u32,
    /// Where the persistent metadata store lives (in-memory when unset)
    pub data_dir: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "node-0".to_string(),
            admin_user: "admin".to_string(),
            admin_password: None,
            admin_api_key: None,
            default_branch: "master".to_string(),
            default_subdot: "__default__".to_string(),
            metadata_timeout_ms: 5_000,
            drain_retry_ms: 500,
            quiesce_timeout_ms: 10_000,
            dirty_poll_ms: 1_000,
            bcrypt_cost: bcrypt::DEFAULT_COST,
            data_dir: None,
        }
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file, applying environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read node config from {:?}", path))?;
        let mut config: NodeConfig = toml::from_str(&data)
            .with_context(|| format!("Failed to parse node config {:?}", path))?;
        config.apply_env()?;
        Ok(config)
    }

    /// Save configuration atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp_path = path.with_extension("tmp");
        let data = toml::to_string_pretty(self).context("Failed to encode node config")?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Apply environment overrides
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var(METADATA_TIMEOUT_ENV) {
            let secs: u64 = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}: {:?}", METADATA_TIMEOUT_ENV, value))?;
            self.metadata_timeout_ms = secs * 1000;
        }
        Ok(())
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }

    pub fn drain_retry(&self) -> Duration {
        Duration::from_millis(self.drain_retry_ms)
    }

    pub fn quiesce_timeout(&self) -> Duration {
        Duration::from_millis(self.quiesce_timeout_ms)
    }

    pub fn dirty_poll(&self) -> Duration {
        Duration::from_millis(self.dirty_poll_ms)
    }

    /// Configuration with short timeouts and cheap hashing, for tests
    pub fn for_tests(node_name: &str) -> Self {
        Self {
            node_name: node_name.to_string(),
            admin_password: Some("admin-password".to_string()),
            metadata_timeout_ms: 300,
            drain_retry_ms: 20,
            quiesce_timeout_ms: 1_000,
            dirty_poll_ms: 20,
            bcrypt_cost: 4,
            ..Self::default()
        }
    }
}

/// Fault-injection switches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DebugFlag {
    /// Fail dot creation after the snapshot engine created the filesystem,
    /// leaving the provisional record behind as a crash would
    PartialFailCreateFilesystem,
    /// Fail every snapshot reclamation attempt of the deletion drain
    FailDrainReclaim,
}

impl FromStr for DebugFlag {
    type Err = DotError;

    fn from_str(s: &str) -> DotResult<Self> {
        match s {
            "PartialFailCreateFilesystem" => Ok(Self::PartialFailCreateFilesystem),
            "FailDrainReclaim" => Ok(Self::FailDrainReclaim),
            other => Err(DotError::UnknownFlag(other.to_string())),
        }
    }
}

/// Set of active debug flags
#[derive(Debug, Default)]
pub struct DebugFlags {
    active: RwLock<HashSet<DebugFlag>>,
}

impl DebugFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, flag: DebugFlag, enabled: bool) {
        let mut active = match self.active.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if enabled {
            active.insert(flag);
        } else {
            active.remove(&flag);
        }
    }

    /// Set a flag from its textual name and value (`"true"` / `"false"`)
    pub fn set_named(&self, name: &str, value: &str) -> DotResult<()> {
        let flag: DebugFlag = name.parse()?;
        let enabled = match value.trim() {
            "true" | "1" | "on" => true,
            "false" | "0" | "off" => false,
            other => {
                return Err(DotError::InvalidRef(format!(
                    "debug flag value must be true or false, got {:?}",
                    other
                )))
            }
        };
        self.set(flag, enabled);
        Ok(())
    }

    pub fn is_set(&self, flag: DebugFlag) -> bool {
        match self.active.read() {
            Ok(guard) => guard.contains(&flag),
            Err(poisoned) => poisoned.into_inner().contains(&flag),
        }
    }
}
