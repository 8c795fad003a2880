//! DotVol Server - control plane for versioned data volumes
//!
//! Serves one node's JSON-RPC surface over HTTP/1 and talks to other
//! clusters over the same protocol when pushing, pulling or cloning.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use dotvol_core::{
    DotNode, MemoryRuntime, MemorySnapshotEngine, MemoryStore, MetadataStore, NodeConfig, SledStore,
};
use dotvol_server::{HttpConnector, RpcHandler};
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// DotVol Server Configuration
#[derive(Parser, Debug)]
#[command(name = "dotvol")]
#[command(author = "DotVol Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Control plane for versioned data volumes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server
    Start {
        /// Listen address (e.g., 0.0.0.0:6969)
        #[arg(short, long, default_value = "0.0.0.0:6969")]
        addr: String,

        /// Node configuration file (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Metadata directory; overrides the config file
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },

    /// Write a default node configuration file
    InitConfig {
        /// Where to write the configuration
        path: PathBuf,

        /// Node name to record
        #[arg(long, default_value = "node-0")]
        node_name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            addr,
            config,
            data_dir,
            debug,
        } => {
            // Initialize tracing
            let env_filter = if debug {
                tracing_subscriber::EnvFilter::new("debug")
            } else {
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::INFO.into())
            };

            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer())
                .with(env_filter)
                .init();

            let mut node_config = match &config {
                Some(path) => NodeConfig::load(path)?,
                None => {
                    let mut defaults = NodeConfig::default();
                    defaults.apply_env()?;
                    defaults
                }
            };
            if data_dir.is_some() {
                node_config.data_dir = data_dir;
            }

            info!("Starting DotVol node {} on {}", node_config.node_name, addr);

            let store: Arc<dyn MetadataStore> = match &node_config.data_dir {
                Some(dir) => {
                    std::fs::create_dir_all(dir)
                        .with_context(|| format!("Failed to create data directory {:?}", dir))?;
                    let path = dir.join("metadata");
                    info!("Metadata store: {:?}", path);
                    Arc::new(SledStore::open(&path)?)
                }
                None => {
                    info!("Metadata store: in-memory (no data directory configured)");
                    Arc::new(MemoryStore::new())
                }
            };

            let node = DotNode::open(
                node_config,
                store,
                Arc::new(MemorySnapshotEngine::new()),
                Arc::new(MemoryRuntime::new()),
                Arc::new(HttpConnector::default()),
            )
            .await?;
            node.start_background().await?;

            let handler = Arc::new(RpcHandler::new(node));

            // Start server
            let addr: SocketAddr = addr.parse()?;
            let listener: TcpListener = TcpListener::bind(addr).await?;

            info!("Server listening on {}", addr);

            loop {
                let (stream, _) = listener.accept().await?;
                let handler = handler.clone();
                let io = TokioIo::new(stream);

                tokio::spawn(async move {
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(io, service_fn(move |req| handle_request(req, handler.clone())))
                        .await
                    {
                        error!("Error serving connection: {:?}", e);
                    }
                });
            }
        }

        Commands::InitConfig { path, node_name } => {
            let config = NodeConfig {
                node_name,
                ..NodeConfig::default()
            };
            config
                .save(&path)
                .with_context(|| format!("Failed to write {:?}", path))?;
            println!("Wrote node configuration to {}", path.display());
        }
    }

    Ok(())
}

/// Handle incoming HTTP request
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    handler: Arc<RpcHandler>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    tracing::debug!("Request: {} {}", req.method(), req.uri());
    let response = handler.handle(req).await;
    tracing::debug!("Response: {}", response.status());
    Ok(response)
}
