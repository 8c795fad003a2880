//! HTTP replication peer
//!
//! Reaches another dotvol server's `/rpc` endpoint with the credentials of
//! a configured [`Remote`]. Bundles travel as base64 framed
//! [`TransferMessage`]s; control plane errors come back as [`DotError`]s so
//! callers see the same kinds they would locally.

use crate::rpc::{Payload, RpcRequest, RpcResponse};
use async_trait::async_trait;
use dotvol_core::{
    CommitId, DotError, PeerConnector, Remote, RemoteBranchState, ReplicationPeer, Result, TransferBundle,
    TransferMessage, TransferSummary, UserInfo, VolumeName,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Client for one remote cluster
pub struct HttpPeer {
    base_url: String,
    user: String,
    api_key: String,
    http: reqwest::Client,
    identity: String,
}

impl HttpPeer {
    /// Connect to `remote` and confirm who its credentials authenticate as
    pub async fn connect(remote: &Remote, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DotError::internal(format!("Failed to create HTTP client: {}", e)))?;
        let mut peer = Self {
            base_url: remote.endpoint.trim_end_matches('/').to_string(),
            user: remote.user.clone(),
            api_key: remote.api_key.clone(),
            http,
            identity: String::new(),
        };
        let me: UserInfo = peer.call("CurrentUser", Value::Null).await?;
        tracing::debug!("Connected to {} as {}", peer.base_url, me.name);
        peer.identity = me.name;
        Ok(peer)
    }

    /// Invoke `method` on the remote node
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let url = format!("{}/rpc", self.base_url);
        let request = RpcRequest {
            method: method.to_string(),
            params,
            current_dot: None,
        };
        let resp = self
            .http
            .post(&url)
            .basic_auth(&self.user, Some(&self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| DotError::internal(format!("Failed to reach {}: {}", url, e)))?;

        let status = resp.status();
        let body: RpcResponse = resp.json().await.map_err(|e| {
            DotError::internal(format!("{} from {} returned an unreadable body ({}): {}", method, url, status, e))
        })?;

        match (body.result, body.failure) {
            (_, Some(failure)) => Err(failure
                .error
                .unwrap_or_else(|| DotError::internal(format!("{} failed ({}): {}", method, status, failure.message)))),
            (Some(result), None) => serde_json::from_value(result)
                .map_err(|e| DotError::internal(format!("Unexpected {} result: {}", method, e))),
            (None, None) => Err(DotError::internal(format!("{} returned neither result nor failure", method))),
        }
    }

    async fn exchange(&self, method: &str, message: TransferMessage) -> Result<TransferMessage> {
        let params = to_params(&Payload::encode(&message)?)?;
        let reply: Payload = self.call(method, params).await?;
        reply.decode()
    }
}

fn to_params<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(DotError::internal)
}

fn unexpected(method: &str, message: &TransferMessage) -> DotError {
    DotError::internal(format!(
        "{} answered with unexpected message {:?}",
        method,
        std::mem::discriminant(message)
    ))
}

#[async_trait]
impl ReplicationPeer for HttpPeer {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn describe(&self, dot: &VolumeName, branch: &str) -> Result<RemoteBranchState> {
        let message = TransferMessage::Describe {
            dot: dot.clone(),
            branch: branch.to_string(),
        };
        match self.exchange("DescribeBranch", message).await? {
            TransferMessage::State(state) => Ok(state),
            other => Err(unexpected("DescribeBranch", &other)),
        }
    }

    async fn receive(&self, dot: &VolumeName, bundle: TransferBundle) -> Result<TransferSummary> {
        tracing::info!(
            "Sending {} commits ({} bytes) of {} to {}",
            bundle.commits.len(),
            bundle.byte_len(),
            dot,
            self.base_url
        );
        let message = TransferMessage::Bundle {
            dot: dot.clone(),
            bundle,
        };
        match self.exchange("ReceiveBundle", message).await? {
            TransferMessage::Summary(summary) => Ok(summary),
            other => Err(unexpected("ReceiveBundle", &other)),
        }
    }

    async fn fetch(&self, dot: &VolumeName, branch: &str, have: Vec<CommitId>) -> Result<TransferBundle> {
        let message = TransferMessage::Fetch {
            dot: dot.clone(),
            branch: branch.to_string(),
            have,
        };
        match self.exchange("FetchBundle", message).await? {
            TransferMessage::Bundle { bundle, .. } => Ok(bundle),
            other => Err(unexpected("FetchBundle", &other)),
        }
    }
}

/// Connects remotes over HTTP
pub struct HttpConnector {
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[async_trait]
impl PeerConnector for HttpConnector {
    async fn connect(&self, remote: &Remote) -> Result<Arc<dyn ReplicationPeer>> {
        Ok(Arc::new(HttpPeer::connect(remote, self.timeout).await?))
    }
}
