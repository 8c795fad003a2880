//! Shared fixtures for the integration tests
//!
//! A cluster is a set of nodes sharing one metadata store, each with its own
//! snapshot engine and container runtime. Clusters reach each other through
//! one `LocalConnector`, keyed by cluster endpoint.

#![allow(dead_code)]

use dotvol_core::{
    DotNode, FilesystemId, LocalConnector, MemoryRuntime, MemorySnapshotEngine, MemoryStore, NodeConfig, Remote,
    Session,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const ADMIN_PASSWORD: &str = "admin-password";

pub struct TestNode {
    pub node: Arc<DotNode>,
    pub engine: Arc<MemorySnapshotEngine>,
    pub runtime: Arc<MemoryRuntime>,
}

impl TestNode {
    pub fn fs(&self, dot: Uuid, branch: &str) -> FilesystemId {
        FilesystemId::new(dot, branch)
    }
}

pub struct Cluster {
    pub endpoint: String,
    pub store: Arc<MemoryStore>,
    pub nodes: Vec<TestNode>,
}

impl Cluster {
    /// First node of the cluster
    pub fn node(&self) -> &TestNode {
        &self.nodes[0]
    }

    pub async fn admin(&self) -> Session {
        self.node()
            .node
            .authenticate("admin", ADMIN_PASSWORD)
            .await
            .unwrap()
    }

    /// Register `name` and return a session authenticated by API key
    pub async fn user(&self, name: &str) -> Session {
        let admin = self.admin().await;
        let node = &self.node().node;
        node.register_user(&admin, name, &format!("{}@example.com", name), "secret")
            .await
            .unwrap();
        let by_password = node.authenticate(name, "secret").await.unwrap();
        let key = node.get_api_key(&by_password).await.unwrap();
        node.authenticate(name, &key).await.unwrap()
    }

    /// A remote pointing at this cluster with the given session's key
    pub async fn remote_for(&self, remote_name: &str, session: &Session) -> Remote {
        let key = self.node().node.get_api_key(session).await.unwrap();
        Remote::new(remote_name, &self.endpoint, &session.user.name, &key)
    }
}

/// Build a cluster of `nodes` nodes and register it with `connector`
pub async fn cluster(endpoint: &str, nodes: usize, connector: &Arc<LocalConnector>) -> Cluster {
    let store = Arc::new(MemoryStore::new());
    let mut members = Vec::new();
    for i in 0..nodes {
        let engine = Arc::new(MemorySnapshotEngine::new());
        let runtime = Arc::new(MemoryRuntime::new());
        let node = DotNode::open(
            NodeConfig::for_tests(&format!("{}-{}", endpoint, i)),
            store.clone(),
            engine.clone(),
            runtime.clone(),
            connector.clone(),
        )
        .await
        .unwrap();
        node.start_background().await.unwrap();
        members.push(TestNode { node, engine, runtime });
    }
    connector.register(endpoint, members[0].node.clone()).await;
    Cluster {
        endpoint: endpoint.to_string(),
        store,
        nodes: members,
    }
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
