//! DotVol Server Library
//!
//! HTTP surface of a dotvol node:
//! - JSON-RPC endpoint (`POST /rpc`) with basic authentication
//! - HTTP replication peer used to push, pull and clone between clusters

pub mod peer;
pub mod rpc;

pub use peer::{HttpConnector, HttpPeer};
pub use rpc::{RpcError, RpcHandler, RpcRequest, RpcResponse};
