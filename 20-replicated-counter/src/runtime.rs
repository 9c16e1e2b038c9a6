//! Bringing a node up over TCP and tearing it down again.
//!
//! [`spawn_node`] binds the RPC listener first, so peers that learn about this
//! node during bootstrap can already reach it, then:
//!
//! 1. starts the RPC server,
//! 2. bootstraps against the initial peers,
//! 3. starts the heartbeat monitor with Reconnect and Resend registered,
//! 4. starts the HTTP front door, if configured.
//!
//! Every background task watches the same shutdown signal.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};
use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::discovery::join_cluster;
use crate::heartbeat::FailureDetector;
use crate::http;
use crate::node::Node;
use crate::replication::IncrementReceipt;
use crate::server::RpcServer;
use crate::transport::tcp::TcpConnector;

/// Handle to a running node.
pub struct NodeHandle {
    node: Arc<Node>,
    detector: Arc<FailureDetector>,
    rpc_addr: SocketAddr,
    http_addr: Option<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn id(&self) -> &str {
        self.node.id()
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn detector(&self) -> &Arc<FailureDetector> {
        &self.detector
    }

    pub fn rpc_addr(&self) -> SocketAddr {
        self.rpc_addr
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    pub async fn increment(&self) -> IncrementReceipt {
        self.node.increment().await
    }

    pub fn counter(&self) -> i64 {
        self.node.counter()
    }

    /// Signals every background task to stop and waits for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "node task ended abnormally");
            }
        }
        info!(node = %self.node.id(), "node stopped");
    }
}

/// Resolves once `true` is sent or the sender is dropped.
async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}

/// Binds the listeners, joins the cluster and starts all background tasks.
///
/// # Errors
///
/// Fails only if a listener cannot be bound. Unreachable peers are logged and
/// left to the failure detector.
pub async fn spawn_node(config: NodeConfig) -> Result<NodeHandle> {
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind rpc listener on {}", config.listen))?;
    let rpc_addr = listener.local_addr()?;
    let id = config
        .advertise
        .clone()
        .unwrap_or_else(|| rpc_addr.to_string());

    let node = Node::new(id, Arc::new(TcpConnector), config.timing);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    let server = RpcServer::new(listener, Arc::clone(&node));
    let rpc_shutdown = wait_for_shutdown(shutdown_rx.clone());
    tasks.push(tokio::spawn(async move {
        if let Err(err) = server.run_until(rpc_shutdown).await {
            warn!(error = ?err, "rpc server exited with error");
        }
    }));
    info!(node = %node.id(), %rpc_addr, "rpc server listening");

    let (detector, monitor) = join_cluster(
        Arc::clone(&node),
        config.initial_peers.as_slice(),
        wait_for_shutdown(shutdown_rx.clone()),
    )
    .await;
    tasks.push(monitor);

    let http_addr = match config.http_listen {
        Some(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind http listener on {addr}"))?;
            let http_addr = listener.local_addr()?;
            let app = http::router(Arc::clone(&node));
            let http_shutdown = wait_for_shutdown(shutdown_rx.clone());
            tasks.push(tokio::spawn(async move {
                if let Err(err) = axum::serve(listener, app)
                    .with_graceful_shutdown(http_shutdown)
                    .await
                {
                    warn!(error = ?err, "http server exited with error");
                }
            }));
            info!(node = %node.id(), %http_addr, "http server listening");
            Some(http_addr)
        }
        None => None,
    };

    Ok(NodeHandle {
        node,
        detector,
        rpc_addr,
        http_addr,
        shutdown_tx,
        tasks,
    })
}
