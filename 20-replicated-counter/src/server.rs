use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
    task::JoinSet,
};
use tracing::{debug, info, warn};

use crate::message::{read_message, write_message, Request};
use crate::node::Node;

/// Accepts peer connections and answers their RPCs against one node.
pub struct RpcServer {
    listener: TcpListener,
    node: Arc<Node>,
}

impl RpcServer {
    pub fn new(listener: TcpListener, node: Arc<Node>) -> Self {
        Self { listener, node }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let RpcServer { listener, node } = self;
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();

        loop {
            select! {
                _ = &mut shutdown => {
                    info!(node = %node.id(), open = connections.len(), "rpc server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &node, &mut connections);
                }
            }
            while connections.try_join_next().is_some() {}
        }

        connections.shutdown().await;
        Ok(())
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    node: &Arc<Node>,
    connections: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, node, connections),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(
    stream: TcpStream,
    peer: SocketAddr,
    node: &Arc<Node>,
    connections: &mut JoinSet<()>,
) {
    let node = Arc::clone(node);
    connections.spawn(async move {
        if let Err(err) = handle_connection(stream, &node).await {
            debug!(peer = %peer, error = ?err, "rpc connection closed with error");
        }
    });
}

/// Serves requests from one connection until the peer hangs up.
async fn handle_connection(stream: TcpStream, node: &Node) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    while let Some(request) = read_message::<_, Request>(&mut reader).await? {
        let response = node.serve(request);
        write_message(&mut writer, &response).await?;
    }

    Ok(())
}
