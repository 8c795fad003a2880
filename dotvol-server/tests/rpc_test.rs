//! End-to-end tests over real HTTP

use dotvol_core::{
    DotNode, ErrorKind, MemoryRuntime, MemorySnapshotEngine, MemoryStore, MetadataStore, NodeConfig,
    PushRequest, Remote, ReplicationPeer, Session, SledStore,
};
use dotvol_server::{HttpConnector, HttpPeer, RpcHandler, RpcResponse};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

struct Server {
    addr: SocketAddr,
    node: Arc<DotNode>,
    engine: Arc<MemorySnapshotEngine>,
}

impl Server {
    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

async fn spawn_server(name: &str) -> Server {
    spawn_server_with(name, Arc::new(MemoryStore::new())).await
}

async fn spawn_server_with(name: &str, store: Arc<dyn MetadataStore>) -> Server {
    start(name, store, None).await
}

async fn start(name: &str, store: Arc<dyn MetadataStore>, max_body: Option<usize>) -> Server {
    let engine = Arc::new(MemorySnapshotEngine::new());
    let node = DotNode::open(
        NodeConfig::for_tests(name),
        store,
        engine.clone(),
        Arc::new(MemoryRuntime::new()),
        Arc::new(HttpConnector::new(Duration::from_secs(30))),
    )
    .await
    .unwrap();
    let mut handler = RpcHandler::new(node.clone());
    if let Some(max_body) = max_body {
        handler = handler.with_max_body(max_body);
    }
    let handler = Arc::new(handler);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let handler = handler.clone();
                    async move { Ok::<_, hyper::Error>(handler.handle(req).await) }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    Server { addr, node, engine }
}

async fn rpc(server: &Server, user: &str, secret: &str, method: &str, params: Value) -> (u16, RpcResponse) {
    let resp = reqwest::Client::new()
        .post(format!("{}/rpc", server.url()))
        .basic_auth(user, Some(secret))
        .json(&json!({ "method": method, "params": params }))
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

async fn commit_file(server: &Server, session: &Session, file: &str) {
    let mount = server.node.mount(session, "apples").await.unwrap();
    server
        .engine
        .write_file(&mount.fs, &format!("__default__/{}", file), b"data")
        .await
        .unwrap();
    server.node.commit(session, Some("apples"), None, file).await.unwrap();
}

#[tokio::test]
async fn test_rpc_requires_credentials() {
    let server = spawn_server("node-a").await;

    let resp = reqwest::Client::new()
        .post(format!("{}/rpc", server.url()))
        .json(&json!({ "method": "ListDots" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);

    let (status, _) = rpc(&server, "admin", "wrong", "ListDots", Value::Null).await;
    assert_eq!(status, 401);

    let (status, body) = rpc(&server, "admin", "admin-password", "NoSuchMethod", Value::Null).await;
    assert_eq!(status, 404);
    assert!(body.failure.unwrap().message.contains("NoSuchMethod"));

    let version = reqwest::get(format!("{}/version", server.url()))
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap();
    assert_eq!(version["name"], "dotvol-core");
}

#[tokio::test]
async fn test_rpc_init_commit_and_errors() {
    let server = spawn_server("node-a").await;

    let (status, _) = rpc(&server, "admin", "admin-password", "Init", json!({ "name": "apples" })).await;
    assert_eq!(status, 200);

    let (status, body) = rpc(&server, "admin", "admin-password", "Init", json!({ "name": "apples" })).await;
    assert_eq!(status, 409);
    let failure = body.failure.unwrap();
    assert_eq!(failure.message, "admin/apples exists already");
    assert_eq!(failure.error.unwrap().kind(), ErrorKind::AlreadyExists);

    let (status, body) = rpc(
        &server,
        "admin",
        "admin-password",
        "Commit",
        json!({ "message": "first" }),
    )
    .await;
    assert_eq!(status, 200);
    assert!(body.result.unwrap().is_string());

    let (_, body) = rpc(&server, "admin", "admin-password", "Log", json!({ "dot": "apples" })).await;
    let log = body.result.unwrap();
    assert_eq!(log.as_array().unwrap().len(), 1);
    assert_eq!(log[0]["message"], "first");

    let (status, _) = rpc(&server, "admin", "admin-password", "Commit", json!({ "dot": 5 })).await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_push_between_servers() {
    let dir = tempfile::tempdir().unwrap();
    let a = spawn_server("node-a").await;
    let b = spawn_server_with("node-b", Arc::new(SledStore::open(&dir.path().join("metadata")).unwrap())).await;

    let admin_a = a.node.authenticate("admin", "admin-password").await.unwrap();
    let admin_b = b.node.authenticate("admin", "admin-password").await.unwrap();
    let key_b = b.node.get_api_key(&admin_b).await.unwrap();
    let remote = Remote::new("b", &b.url(), "admin", &key_b);

    let peer = HttpPeer::connect(&remote, Duration::from_secs(10)).await.unwrap();
    assert_eq!(peer.identity(), "admin");

    a.node.init(&admin_a, "apples").await.unwrap();
    commit_file(&a, &admin_a, "hello").await;

    let request = PushRequest {
        dot: Some("apples".to_string()),
        ..Default::default()
    };
    let summary = a.node.push(&admin_a, &remote, request.clone()).await.unwrap();
    assert!(summary.created);
    assert_eq!(summary.commits, 1);
    assert_eq!(
        b.node.list_files(&admin_b, "apples").await.unwrap(),
        vec!["hello".to_string()]
    );

    // Errors keep their kind across the wire
    commit_file(&b, &admin_b, "remote-only").await;
    commit_file(&a, &admin_a, "local-only").await;
    let err = a.node.push(&admin_a, &remote, request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Diverged);

    let bad = Remote::new("b", &b.url(), "admin", "not-a-key");
    assert_eq!(
        HttpPeer::connect(&bad, Duration::from_secs(10))
            .await
            .err()
            .map(|e| e.kind()),
        Some(ErrorKind::Unauthorized)
    );
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let server = start("node-a", Arc::new(MemoryStore::new()), Some(1024)).await;

    let (status, _) = rpc(&server, "admin", "admin-password", "Init", json!({ "name": "apples" })).await;
    assert_eq!(status, 200);

    let message = "x".repeat(8 * 1024);
    let (status, body) = rpc(&server, "admin", "admin-password", "Commit", json!({ "message": message })).await;
    assert_eq!(status, 413);
    assert!(body.failure.unwrap().message.contains("exceeds 1024 bytes"));
    let admin = server.node.authenticate("admin", "admin-password").await.unwrap();
    let dots = server.node.list_dots(&admin).await.unwrap();
    assert!(dots.iter().all(|d| d.tip.is_none()));
}
