//! Subdot composition and workload quiescing
//!
//! A dot's filesystem is the union of its subdots. Each named subdot is a
//! directory at the top of the branch filesystem; `__root__` is the top level
//! itself. Because all subdots share one filesystem per branch, a single
//! snapshot captures every subdot at the same instant.
//!
//! Containers attached to a dot are quiesced around commits (paused) and
//! around checkout / hard reset (stopped, then restarted on the new state).
//! The sequence is an explicit saga:
//!
//! ```text
//! Preparing -> Quiesced -> Switching -> Restoring -> Done
//!     |                        |
//!     +-> RolledBack <---------+   (resume everything on the original state)
//! ```

use crate::error::{DotError, Result};
use crate::name::ROOT_SUBDOT;
use crate::snapshot::FilesystemId;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Resolve an optional subdot name against the dot's default
pub fn resolve_subdot(requested: Option<&str>, default_subdot: &str) -> String {
    requested.unwrap_or(default_subdot).to_string()
}

/// Directory of a subdot inside the branch filesystem
pub fn subdot_dir(subdot: &str) -> &str {
    if subdot == ROOT_SUBDOT { "" } else { subdot }
}

/// A container using a subdot of a dot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub container: String,
    pub dot: Uuid,
    pub subdot: String,
    /// Branch fixed at mount time; unpinned containers follow checkout
    pub pinned_branch: Option<String>,
    /// Filesystem currently mounted
    pub fs: FilesystemId,
}

/// Container runtime operations the control plane relies on
#[async_trait]
pub trait WorkloadRuntime: Send + Sync {
    /// Containers currently holding a mount of `dot`
    async fn attachments(&self, dot: &Uuid) -> Result<Vec<Attachment>>;

    /// Record that a container mounted a dot
    async fn bind(&self, attachment: Attachment) -> Result<()>;

    async fn stop(&self, container: &str) -> Result<()>;

    /// Start a stopped container with `fs` mounted
    async fn start(&self, container: &str, fs: &FilesystemId) -> Result<()>;

    async fn pause(&self, container: &str) -> Result<()>;

    async fn unpause(&self, container: &str) -> Result<()>;
}

/// Lifecycle state of a container in [`MemoryRuntime`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone)]
struct ContainerState {
    attachment: Attachment,
    status: ContainerStatus,
    starts: u32,
}

/// In-process runtime for tests and the development server
#[derive(Default)]
pub struct MemoryRuntime {
    containers: RwLock<BTreeMap<String, ContainerState>>,
    failing: RwLock<HashSet<String>>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a running container holding a mount
    pub async fn attach(&self, attachment: Attachment) {
        let name = attachment.container.clone();
        self.containers.write().await.insert(
            name,
            ContainerState {
                attachment,
                status: ContainerStatus::Running,
                starts: 1,
            },
        );
    }

    /// The container exited and released its mount
    pub async fn detach(&self, container: &str) {
        self.containers.write().await.remove(container);
    }

    pub async fn mounted(&self, container: &str) -> Option<FilesystemId> {
        let containers = self.containers.read().await;
        containers.get(container).map(|c| c.attachment.fs.clone())
    }

    pub async fn status(&self, container: &str) -> Option<ContainerStatus> {
        self.containers.read().await.get(container).map(|c| c.status)
    }

    /// Number of times the container has been started
    pub async fn start_count(&self, container: &str) -> u32 {
        let containers = self.containers.read().await;
        containers.get(container).map(|c| c.starts).unwrap_or(0)
    }

    /// Make every runtime operation on `container` fail
    pub async fn set_failing(&self, container: &str, failing: bool) {
        let mut set = self.failing.write().await;
        if failing {
            set.insert(container.to_string());
        } else {
            set.remove(container);
        }
    }

    async fn transition(
        &self,
        container: &str,
        from: &[ContainerStatus],
        to: ContainerStatus,
    ) -> Result<()> {
        if self.failing.read().await.contains(container) {
            return Err(DotError::internal(format!("runtime refused to touch {}", container)));
        }
        let mut containers = self.containers.write().await;
        let state = containers
            .get_mut(container)
            .ok_or_else(|| DotError::internal(format!("no such container {}", container)))?;
        if !from.contains(&state.status) {
            return Err(DotError::internal(format!(
                "container {} is {:?}, expected one of {:?}",
                container, state.status, from
            )));
        }
        state.status = to;
        Ok(())
    }
}

#[async_trait]
impl WorkloadRuntime for MemoryRuntime {
    async fn attachments(&self, dot: &Uuid) -> Result<Vec<Attachment>> {
        let containers = self.containers.read().await;
        Ok(containers
            .values()
            .filter(|c| c.attachment.dot == *dot)
            .map(|c| c.attachment.clone())
            .collect())
    }

    async fn bind(&self, attachment: Attachment) -> Result<()> {
        self.attach(attachment).await;
        Ok(())
    }

    async fn stop(&self, container: &str) -> Result<()> {
        self.transition(
            container,
            &[ContainerStatus::Running, ContainerStatus::Paused],
            ContainerStatus::Stopped,
        )
        .await
    }

    async fn start(&self, container: &str, fs: &FilesystemId) -> Result<()> {
        self.transition(container, &[ContainerStatus::Stopped], ContainerStatus::Running)
            .await?;
        let mut containers = self.containers.write().await;
        if let Some(state) = containers.get_mut(container) {
            state.attachment.fs = fs.clone();
            state.starts += 1;
        }
        Ok(())
    }

    async fn pause(&self, container: &str) -> Result<()> {
        self.transition(container, &[ContainerStatus::Running], ContainerStatus::Paused)
            .await
    }

    async fn unpause(&self, container: &str) -> Result<()> {
        self.transition(container, &[ContainerStatus::Paused], ContainerStatus::Running)
            .await
    }
}

/// How containers are held still during a switch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuiesceMode {
    /// Pause and unpause; mounts are unchanged (commit)
    Pause,
    /// Stop and start again, possibly on another filesystem (checkout, reset)
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaState {
    Preparing,
    Quiesced,
    Switching,
    Restoring,
    Done,
    RolledBack,
}

/// Coordinated quiesce of every container attached to a dot
pub struct QuiesceSaga<'a> {
    runtime: &'a dyn WorkloadRuntime,
    mode: QuiesceMode,
    timeout: Duration,
    targets: Vec<Attachment>,
    quiesced: Vec<Attachment>,
    state: SagaState,
}

impl<'a> QuiesceSaga<'a> {
    pub fn new(
        runtime: &'a dyn WorkloadRuntime,
        mode: QuiesceMode,
        timeout: Duration,
        targets: Vec<Attachment>,
    ) -> Self {
        Self {
            runtime,
            mode,
            timeout,
            targets,
            quiesced: Vec::new(),
            state: SagaState::Preparing,
        }
    }

    pub fn state(&self) -> SagaState {
        self.state
    }

    pub fn targets(&self) -> &[Attachment] {
        &self.targets
    }

    /// Pause or stop every target concurrently
    ///
    /// If any container does not acknowledge within the timeout, the ones that
    /// did are resumed and the saga ends in `RolledBack`.
    pub async fn quiesce(&mut self) -> Result<()> {
        if self.state != SagaState::Preparing {
            return Err(DotError::internal(format!("cannot quiesce from {:?}", self.state)));
        }

        let runtime = self.runtime;
        let mode = self.mode;
        let timeout = self.timeout;
        let results = join_all(self.targets.iter().map(|target| async move {
            let op = async {
                match mode {
                    QuiesceMode::Pause => runtime.pause(&target.container).await,
                    QuiesceMode::Stop => runtime.stop(&target.container).await,
                }
            };
            let outcome = match tokio::time::timeout(timeout, op).await {
                Ok(result) => result,
                Err(_) => Err(DotError::internal(format!(
                    "timed out quiescing {}",
                    target.container
                ))),
            };
            (target.clone(), outcome)
        }))
        .await;

        let mut failures = Vec::new();
        for (target, outcome) in results {
            match outcome {
                Ok(()) => self.quiesced.push(target),
                Err(e) => failures.push(format!("{}: {}", target.container, e)),
            }
        }

        if failures.is_empty() {
            self.state = SagaState::Quiesced;
            return Ok(());
        }

        tracing::warn!("Quiesce failed, rolling back: {}", failures.join("; "));
        self.resume_original().await;
        self.state = SagaState::RolledBack;
        Err(DotError::internal(format!(
            "could not quiesce containers: {}",
            failures.join("; ")
        )))
    }

    /// Enter the switching phase; the caller now mutates the filesystem
    pub fn begin_switch(&mut self) -> Result<()> {
        if self.state != SagaState::Quiesced {
            return Err(DotError::internal(format!("cannot switch from {:?}", self.state)));
        }
        self.state = SagaState::Switching;
        Ok(())
    }

    /// Resume every container, mounting the filesystem chosen by `placement`
    ///
    /// `placement` is only consulted in [`QuiesceMode::Stop`]. All containers
    /// are attempted even if some fail.
    pub async fn restore<F>(&mut self, placement: F) -> Result<()>
    where
        F: Fn(&Attachment) -> FilesystemId,
    {
        if self.state != SagaState::Switching {
            return Err(DotError::internal(format!("cannot restore from {:?}", self.state)));
        }
        self.state = SagaState::Restoring;

        let runtime = self.runtime;
        let mode = self.mode;
        let results = join_all(self.quiesced.iter().map(|target| {
            let fs = placement(target);
            async move {
                let outcome = match mode {
                    QuiesceMode::Pause => runtime.unpause(&target.container).await,
                    QuiesceMode::Stop => runtime.start(&target.container, &fs).await,
                };
                (target.container.clone(), outcome)
            }
        }))
        .await;

        self.state = SagaState::Done;
        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|(name, outcome)| outcome.err().map(|e| format!("{}: {}", name, e)))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(DotError::internal(format!(
                "could not restart containers: {}",
                failures.join("; ")
            )))
        }
    }

    /// Abandon the switch and resume everything on its original filesystem
    pub async fn abort(&mut self) {
        if matches!(self.state, SagaState::Quiesced | SagaState::Switching) {
            self.resume_original().await;
            self.state = SagaState::RolledBack;
        }
    }

    async fn resume_original(&mut self) {
        let runtime = self.runtime;
        let mode = self.mode;
        let results = join_all(self.quiesced.iter().map(|target| async move {
            let outcome = match mode {
                QuiesceMode::Pause => runtime.unpause(&target.container).await,
                QuiesceMode::Stop => runtime.start(&target.container, &target.fs).await,
            };
            (target.container.clone(), outcome)
        }))
        .await;
        for (name, outcome) in results {
            if let Err(e) = outcome {
                tracing::error!("Failed to resume {} during rollback: {}", name, e);
            }
        }
        self.quiesced.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(container: &str, dot: Uuid, subdot: &str, branch: &str) -> Attachment {
        Attachment {
            container: container.to_string(),
            dot,
            subdot: subdot.to_string(),
            pinned_branch: None,
            fs: FilesystemId::new(dot, branch),
        }
    }

    #[test]
    fn test_subdot_paths() {
        assert_eq!(resolve_subdot(None, "__default__"), "__default__");
        assert_eq!(resolve_subdot(Some("frogs"), "__default__"), "frogs");
        assert_eq!(subdot_dir(ROOT_SUBDOT), "");
        assert_eq!(subdot_dir("eat"), "eat");
    }

    #[tokio::test]
    async fn test_stop_saga_moves_containers() {
        let runtime = MemoryRuntime::new();
        let dot = Uuid::new_v4();
        for (name, subdot) in [("frogs_c", "frogs"), ("eat_c", "eat"), ("root_c", ROOT_SUBDOT)] {
            runtime.attach(attachment(name, dot, subdot, "master")).await;
        }

        let targets = runtime.attachments(&dot).await.unwrap();
        let mut saga = QuiesceSaga::new(&runtime, QuiesceMode::Stop, Duration::from_secs(1), targets);
        saga.quiesce().await.unwrap();
        assert_eq!(saga.state(), SagaState::Quiesced);
        assert_eq!(runtime.status("eat_c").await, Some(ContainerStatus::Stopped));

        saga.begin_switch().unwrap();
        saga.restore(|a| FilesystemId::new(a.dot, "branch")).await.unwrap();
        assert_eq!(saga.state(), SagaState::Done);

        for name in ["frogs_c", "eat_c", "root_c"] {
            assert_eq!(runtime.status(name).await, Some(ContainerStatus::Running));
            assert_eq!(runtime.mounted(name).await.unwrap().branch, "branch");
            assert_eq!(runtime.start_count(name).await, 2);
        }
    }

    #[tokio::test]
    async fn test_partial_quiesce_rolls_back() {
        let runtime = MemoryRuntime::new();
        let dot = Uuid::new_v4();
        runtime.attach(attachment("good", dot, "frogs", "master")).await;
        runtime.attach(attachment("bad", dot, "eat", "master")).await;
        runtime.set_failing("bad", true).await;

        let targets = runtime.attachments(&dot).await.unwrap();
        let mut saga = QuiesceSaga::new(&runtime, QuiesceMode::Pause, Duration::from_secs(1), targets);
        assert!(saga.quiesce().await.is_err());
        assert_eq!(saga.state(), SagaState::RolledBack);
        assert_eq!(runtime.status("good").await, Some(ContainerStatus::Running));
        assert_eq!(runtime.status("bad").await, Some(ContainerStatus::Running));
    }

    #[tokio::test]
    async fn test_abort_restarts_on_original_fs() {
        let runtime = MemoryRuntime::new();
        let dot = Uuid::new_v4();
        runtime.attach(attachment("c", dot, "frogs", "master")).await;

        let targets = runtime.attachments(&dot).await.unwrap();
        let mut saga = QuiesceSaga::new(&runtime, QuiesceMode::Stop, Duration::from_secs(1), targets);
        saga.quiesce().await.unwrap();
        saga.begin_switch().unwrap();
        saga.abort().await;

        assert_eq!(saga.state(), SagaState::RolledBack);
        assert_eq!(runtime.status("c").await, Some(ContainerStatus::Running));
        assert_eq!(runtime.mounted("c").await.unwrap().branch, "master");
    }

    #[tokio::test]
    async fn test_empty_saga() {
        let runtime = MemoryRuntime::new();
        let mut saga = QuiesceSaga::new(&runtime, QuiesceMode::Pause, Duration::from_secs(1), vec![]);
        saga.quiesce().await.unwrap();
        saga.begin_switch().unwrap();
        saga.restore(|a| a.fs.clone()).await.unwrap();
        assert_eq!(saga.state(), SagaState::Done);
    }
}
