//! JSON-RPC endpoint
//!
//! Every call is a `POST /rpc` with HTTP basic authentication (user name
//! plus API key or password) and a body of
//!
//! ```text
//! {"method": "Commit", "params": {...}, "current_dot": "apples"}
//! ```
//!
//! The node keeps no per-caller state; a client that has switched dots sends
//! its selection as `current_dot`. Peer methods (`DescribeBranch`,
//! `ReceiveBundle`, `FetchBundle`) carry a base64 [`TransferMessage`] in
//! `params.payload` and answer the same way.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use dotvol_core::{
    CloneRequest, DotError, DotNode, ErrorKind, PullRequest, PushRequest, Remote, Session, TransferMessage,
    VolumeName,
};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use thiserror::Error;

/// Largest accepted request body (bundles included)
pub const MAX_BODY_SIZE: usize = 256 * 1024 * 1024;

/// Errors raised while serving an RPC
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Missing or malformed credentials")]
    BadCredentials,

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Invalid parameters for {method}: {detail}")]
    InvalidParams { method: String, detail: String },

    #[error("Malformed request: {0}")]
    BadRequest(String),

    #[error("Request body exceeds {0} bytes")]
    TooLarge(usize),

    #[error(transparent)]
    Dot(#[from] DotError),
}

impl RpcError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadCredentials => StatusCode::UNAUTHORIZED,
            Self::UnknownMethod(_) => StatusCode::NOT_FOUND,
            Self::InvalidParams { .. } | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Dot(e) => status_of(e.kind()),
        }
    }
}

/// HTTP status for an error kind
pub fn status_of(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyExists | ErrorKind::InUse | ErrorKind::Dirty | ErrorKind::Diverged => {
            StatusCode::CONFLICT
        }
        ErrorKind::NotOwner => StatusCode::FORBIDDEN,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::NoSelection | ErrorKind::InvalidName => StatusCode::BAD_REQUEST,
        ErrorKind::InjectedFault | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Body of `POST /rpc`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub current_dot: Option<String>,
}

/// Error half of an [`RpcResponse`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcFailure {
    pub message: String,
    /// Set when the failure came from the control plane
    pub error: Option<DotError>,
}

/// Body of every `/rpc` answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub result: Option<Value>,
    pub failure: Option<RpcFailure>,
}

/// Base64 framed [`TransferMessage`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub payload: String,
}

impl Payload {
    pub fn encode(message: &TransferMessage) -> dotvol_core::Result<Self> {
        Ok(Self {
            payload: STANDARD.encode(message.encode_compressed()?),
        })
    }

    pub fn decode(&self) -> dotvol_core::Result<TransferMessage> {
        let bytes = STANDARD
            .decode(&self.payload)
            .map_err(|e| DotError::internal(format!("Invalid payload encoding: {}", e)))?;
        TransferMessage::decode_compressed(&bytes)
    }
}

// ─────────────────────────────────────────────────────
// Parameter shapes
// ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct NameParams {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DotParams {
    dot: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommitParams {
    dot: Option<String>,
    branch: Option<String>,
    message: String,
}

#[derive(Debug, Deserialize)]
struct CheckoutParams {
    dot: Option<String>,
    branch: String,
    #[serde(default)]
    create_new: bool,
}

#[derive(Debug, Deserialize)]
struct ResetParams {
    dot: Option<String>,
    target: String,
    #[serde(default)]
    hard: bool,
}

#[derive(Debug, Deserialize)]
struct LogParams {
    dot: Option<String>,
    branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AttachParams {
    name: String,
    container: String,
}

#[derive(Debug, Deserialize)]
struct TransferParams<T> {
    remote: Remote,
    #[serde(flatten)]
    request: T,
}

#[derive(Debug, Deserialize)]
struct CollaboratorParams {
    dot: Option<String>,
    user: String,
}

#[derive(Debug, Deserialize)]
struct UpstreamParams {
    dot: Option<String>,
    remote: String,
    upstream: String,
}

#[derive(Debug, Deserialize)]
struct FlagParams {
    flag: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct RegisterParams {
    name: String,
    email: String,
    password: String,
}

fn params<T: DeserializeOwned>(method: &str, value: Value) -> Result<T, RpcError> {
    let value = if value.is_null() { json!({}) } else { value };
    serde_json::from_value(value).map_err(|e| RpcError::InvalidParams {
        method: method.to_string(),
        detail: e.to_string(),
    })
}

fn to_value<T: Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::Dot(DotError::internal(e)))
}

fn unexpected(method: &str) -> RpcError {
    RpcError::BadRequest(format!("unexpected transfer message for {}", method))
}

/// Parse `Authorization: Basic base64(user:secret)`
pub fn parse_basic_auth(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, secret) = text.split_once(':')?;
    Some((user.to_string(), secret.to_string()))
}

/// Serves the RPC surface of one node
pub struct RpcHandler {
    node: Arc<DotNode>,
    max_body: usize,
}

impl RpcHandler {
    pub fn new(node: Arc<DotNode>) -> Self {
        Self {
            node,
            max_body: MAX_BODY_SIZE,
        }
    }

    /// Lower the request body limit
    pub fn with_max_body(mut self, max_body: usize) -> Self {
        self.max_body = max_body;
        self
    }

    /// Handle one HTTP request
    pub async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        match (req.method(), req.uri().path()) {
            (&Method::GET, "/version") => json_response(StatusCode::OK, &self.node.version()),
            (&Method::POST, "/rpc") => self.handle_rpc(req).await,
            _ => json_response(
                StatusCode::NOT_FOUND,
                &RpcResponse {
                    result: None,
                    failure: Some(RpcFailure {
                        message: format!("No route for {} {}", req.method(), req.uri().path()),
                        error: None,
                    }),
                },
            ),
        }
    }

    async fn handle_rpc(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let credentials = req
            .headers()
            .get(hyper::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_basic_auth);

        let outcome = async {
            let (user, secret) = credentials.ok_or(RpcError::BadCredentials)?;
            let body = Limited::new(req.into_body(), self.max_body)
                .collect()
                .await
                .map_err(|e| {
                    if e.is::<LengthLimitError>() {
                        RpcError::TooLarge(self.max_body)
                    } else {
                        RpcError::BadRequest(e.to_string())
                    }
                })?
                .to_bytes();
            let request: RpcRequest =
                serde_json::from_slice(&body).map_err(|e| RpcError::BadRequest(e.to_string()))?;

            let mut session = self.node.authenticate(&user, &secret).await?;
            if let Some(current) = &request.current_dot {
                let dot = VolumeName::parse(current, session.namespace())?;
                session = session.with_dot(dot);
            }
            tracing::debug!("RPC {} from {}", request.method, session.user.name);
            self.dispatch(&session, &request.method, request.params).await
        }
        .await;

        match outcome {
            Ok(result) => json_response(
                StatusCode::OK,
                &RpcResponse {
                    result: Some(result),
                    failure: None,
                },
            ),
            Err(e) => {
                let status = e.status();
                if status.is_server_error() {
                    tracing::error!("RPC failed: {}", e);
                } else {
                    tracing::debug!("RPC rejected: {}", e);
                }
                let error = match &e {
                    RpcError::Dot(inner) => Some(inner.clone()),
                    _ => None,
                };
                json_response(
                    status,
                    &RpcResponse {
                        result: None,
                        failure: Some(RpcFailure {
                            message: e.to_string(),
                            error,
                        }),
                    },
                )
            }
        }
    }

    /// Run one method for an authenticated caller
    pub async fn dispatch(&self, session: &Session, method: &str, raw: Value) -> Result<Value, RpcError> {
        let node = &self.node;
        match method {
            "Version" => to_value(node.version()),
            "Init" => {
                let p: NameParams = params(method, raw)?;
                to_value(node.init(session, &p.name).await?)
            }
            "Mount" => {
                let p: NameParams = params(method, raw)?;
                to_value(node.mount(session, &p.name).await?)
            }
            "Attach" => {
                let p: AttachParams = params(method, raw)?;
                to_value(node.attach(session, &p.name, &p.container).await?)
            }
            "ListFiles" => {
                let p: NameParams = params(method, raw)?;
                to_value(node.list_files(session, &p.name).await?)
            }
            "Commit" => {
                let p: CommitParams = params(method, raw)?;
                let commit = node
                    .commit(session, p.dot.as_deref(), p.branch.as_deref(), &p.message)
                    .await?;
                to_value(commit.id)
            }
            "Checkout" => {
                let p: CheckoutParams = params(method, raw)?;
                node.checkout(session, p.dot.as_deref(), &p.branch, p.create_new)
                    .await?;
                Ok(Value::Bool(true))
            }
            "Reset" => {
                let p: ResetParams = params(method, raw)?;
                to_value(node.reset(session, p.dot.as_deref(), &p.target, p.hard).await?)
            }
            "Log" => {
                let p: LogParams = params(method, raw)?;
                to_value(node.log(session, p.dot.as_deref(), p.branch.as_deref()).await?)
            }
            "Branches" => {
                let p: DotParams = params(method, raw)?;
                to_value(node.branches(session, p.dot.as_deref()).await?)
            }
            "Push" => {
                let p: TransferParams<PushRequest> = params(method, raw)?;
                to_value(node.push(session, &p.remote, p.request).await?)
            }
            "Pull" => {
                let p: TransferParams<PullRequest> = params(method, raw)?;
                to_value(node.pull(session, &p.remote, p.request).await?)
            }
            "Clone" => {
                let p: TransferParams<CloneRequest> = params(method, raw)?;
                to_value(node.clone_dot(session, &p.remote, p.request).await?)
            }
            "DeleteDot" => {
                let p: NameParams = params(method, raw)?;
                node.delete_dot(session, &p.name).await?;
                Ok(Value::Bool(true))
            }
            "GetApiKey" => to_value(json!({ "api_key": node.get_api_key(session).await? })),
            "ResetApiKey" => to_value(json!({ "api_key": node.reset_api_key(session).await? })),
            "CurrentUser" => to_value(node.current_user(session).await?),
            "AddCollaborator" => {
                let p: CollaboratorParams = params(method, raw)?;
                node.add_collaborator(session, p.dot.as_deref(), &p.user).await?;
                Ok(Value::Bool(true))
            }
            "SetUpstream" => {
                let p: UpstreamParams = params(method, raw)?;
                node.set_upstream(session, p.dot.as_deref(), &p.remote, &p.upstream)
                    .await?;
                Ok(Value::Bool(true))
            }
            "ShowDot" => {
                let p: DotParams = params(method, raw)?;
                to_value(node.show_dot(session, p.dot.as_deref()).await?)
            }
            "ListDots" => to_value(node.list_dots(session).await?),
            "SetDebugFlag" => {
                let p: FlagParams = params(method, raw)?;
                node.set_debug_flag(session, &p.flag, &p.value).await?;
                Ok(Value::Bool(true))
            }
            "AllDotsAndBranches" => to_value(node.all_dots_and_branches(session).await?),
            "RegisterUser" => {
                let p: RegisterParams = params(method, raw)?;
                to_value(node.register_user(session, &p.name, &p.email, &p.password).await?)
            }

            // Peer methods
            "DescribeBranch" => {
                let p: Payload = params(method, raw)?;
                let TransferMessage::Describe { dot, branch } = p.decode()? else {
                    return Err(unexpected(method));
                };
                let state = node.describe_branch(session, &dot, &branch).await?;
                to_value(Payload::encode(&TransferMessage::State(state))?)
            }
            "ReceiveBundle" => {
                let p: Payload = params(method, raw)?;
                let TransferMessage::Bundle { dot, bundle } = p.decode()? else {
                    return Err(unexpected(method));
                };
                let summary = node.receive_bundle(session, &dot, bundle).await?;
                to_value(Payload::encode(&TransferMessage::Summary(summary))?)
            }
            "FetchBundle" => {
                let p: Payload = params(method, raw)?;
                let TransferMessage::Fetch { dot, branch, have } = p.decode()? else {
                    return Err(unexpected(method));
                };
                let bundle = node.fetch_bundle(session, &dot, &branch, &have).await?;
                to_value(Payload::encode(&TransferMessage::Bundle { dot, bundle })?)
            }
            other => Err(RpcError::UnknownMethod(other.to_string())),
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let (status, bytes) = match serde_json::to_vec(body) {
        Ok(bytes) => (status, bytes),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{{\"result\":null,\"failure\":{{\"message\":\"{}\",\"error\":null}}}}", e).into_bytes(),
        ),
    };
    let mut response = Response::new(Full::new(Bytes::from(bytes)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}
