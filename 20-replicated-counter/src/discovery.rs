//! Joining a cluster: transitive peer discovery and counter reconciliation.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::heartbeat::FailureDetector;
use crate::node::Node;
use crate::transport::{PeerClient, RpcError};

/// What a bootstrap run reached.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BootstrapReport {
    /// Addresses that answered Register, in visit order.
    pub registered: Vec<String>,
    /// Addresses whose dial or Register failed.
    pub failed: Vec<String>,
}

/// Walks the cluster from `initial`, registering with every peer reachable
/// transitively through Register responses.
///
/// Each address is handled at most once. A peer that cannot be dialed or
/// registered with only prunes its own branch of the walk.
pub async fn bootstrap<S: AsRef<str>>(node: &Node, initial: &[S]) -> BootstrapReport {
    let mut report = BootstrapReport::default();
    let mut visited: HashSet<String> = HashSet::new();
    // Depth-first, visiting siblings in the order they were listed.
    let mut stack: Vec<String> = initial
        .iter()
        .rev()
        .map(|addr| addr.as_ref().trim().to_string())
        .collect();

    while let Some(addr) = stack.pop() {
        if addr.is_empty() || addr == node.id() || !visited.insert(addr.clone()) {
            continue;
        }

        match register_with(node, &addr).await {
            Ok(peers) => {
                report.registered.push(addr);
                stack.extend(peers.into_iter().rev());
            }
            Err(err) => {
                warn!(peer = %addr, error = %err, "could not register with peer");
                report.failed.push(addr);
            }
        }
    }

    info!(
        node = %node.id(),
        registered = report.registered.len(),
        failed = report.failed.len(),
        peers = ?node.alive_peers(),
        counter = node.counter(),
        "bootstrap finished"
    );
    report
}

/// Registers with `addr`, merges counters from newly seen peers and records
/// them as live. Returns the peers `addr` reported.
async fn register_with(node: &Node, addr: &str) -> Result<Vec<String>, RpcError> {
    let client = dial(node, addr).await?;
    let result = client.register(node.id()).await;
    let peers = match result {
        Ok(peers) => peers,
        Err(err) => {
            client.close().await;
            return Err(err);
        }
    };
    debug!(peer = %addr, reported = ?peers, "registered");

    for peer in &peers {
        if node.knows(peer) {
            continue;
        }
        if peer == addr {
            sync_counter(node, &client).await;
        } else {
            match dial(node, peer).await {
                Ok(other) => {
                    sync_counter(node, &other).await;
                    other.close().await;
                }
                Err(err) => warn!(peer = %peer, error = %err, "could not dial peer for counter sync"),
            }
        }
    }
    client.close().await;

    node.add_peers(std::iter::once(addr).chain(peers.iter().map(String::as_str)));
    Ok(peers)
}

/// Short-lived client that bypasses the connection pool.
async fn dial(node: &Node, addr: &str) -> Result<PeerClient, RpcError> {
    let channel = node.connector().dial(addr).await?;
    Ok(PeerClient::new(addr, channel, node.timing().rpc_timeout))
}

/// Raises the local counter to the peer's if the peer is ahead.
async fn sync_counter(node: &Node, client: &PeerClient) {
    match client.get_counter().await {
        Ok(remote) => {
            if node.merge_counter(remote) {
                info!(peer = %client.peer(), counter = remote, "adopted counter from peer");
            }
        }
        Err(err) => warn!(peer = %client.peer(), error = %err, "failed to get counter"),
    }
}

/// Bootstraps `node`, then starts its heartbeat monitor with the standard
/// recovery actions until `shutdown` resolves.
pub async fn join_cluster<S, F>(
    node: Arc<Node>,
    initial: &[S],
    shutdown: F,
) -> (Arc<FailureDetector>, JoinHandle<()>)
where
    S: AsRef<str>,
    F: Future<Output = ()> + Send + 'static,
{
    bootstrap(&node, initial).await;

    let detector = Arc::new(FailureDetector::with_default_actions(node));
    let monitor = {
        let detector = Arc::clone(&detector);
        tokio::spawn(async move { detector.run_until(shutdown).await })
    };
    (detector, monitor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timing;
    use crate::transport::memory::MemoryNetwork;
    use std::time::Duration;

    fn timing() -> Timing {
        Timing {
            dial_backoff: Duration::from_millis(1),
            ..Timing::default()
        }
    }

    fn spawn(network: &Arc<MemoryNetwork>, id: &str) -> Arc<Node> {
        let node = Node::new(id, network.connector(id), timing());
        network.attach(&node);
        node
    }

    #[tokio::test]
    async fn discovers_peers_transitively() {
        let network = MemoryNetwork::new();
        let a = spawn(&network, "a:1");
        let b = spawn(&network, "b:1");
        let c = spawn(&network, "c:1");
        // c knows a; b only knows c.
        bootstrap(&c, &["a:1"]).await;

        let report = bootstrap(&b, &["c:1"]).await;

        assert_eq!(report.registered, vec!["c:1".to_string(), "a:1".to_string()]);
        assert!(report.failed.is_empty());
        assert_eq!(b.alive_peers(), vec!["a:1".to_string(), "c:1".to_string()]);
        assert_eq!(a.alive_peers(), vec!["b:1".to_string(), "c:1".to_string()]);
        assert_eq!(c.alive_peers(), vec!["a:1".to_string(), "b:1".to_string()]);
    }

    #[tokio::test]
    async fn skips_self_empty_and_repeated_addresses() {
        let network = MemoryNetwork::new();
        let a = spawn(&network, "a:1");
        let _b = spawn(&network, "b:1");

        let report = bootstrap(&a, &["", "a:1", "b:1", "b:1", " "]).await;

        assert_eq!(report.registered, vec!["b:1".to_string()]);
        assert_eq!(a.alive_peers(), vec!["b:1".to_string()]);
        assert!(a.dead_peers().is_empty());
    }

    #[tokio::test]
    async fn unreachable_branch_does_not_abort_the_walk() {
        let network = MemoryNetwork::new();
        let a = spawn(&network, "a:1");
        let _b = spawn(&network, "b:1");
        network.take_down("ghost:1");

        let report = bootstrap(&a, &["ghost:1", "b:1"]).await;

        assert_eq!(report.failed, vec!["ghost:1".to_string()]);
        assert_eq!(report.registered, vec!["b:1".to_string()]);
        assert_eq!(a.alive_peers(), vec!["b:1".to_string()]);
    }

    #[tokio::test]
    async fn joining_node_adopts_the_larger_counter() {
        let network = MemoryNetwork::new();
        let a = spawn(&network, "a:1");
        let b = spawn(&network, "b:1");
        for _ in 0..4 {
            a.increment().await;
        }
        b.merge_counter(1);

        bootstrap(&b, &["a:1"]).await;

        assert_eq!(b.counter(), 4);
        assert_eq!(a.counter(), 4);
    }

    #[tokio::test]
    async fn join_cluster_registers_default_actions() {
        let network = MemoryNetwork::new();
        let a = spawn(&network, "a:1");

        let (detector, monitor) = join_cluster(Arc::clone(&a), &[] as &[&str], async {}).await;

        assert_eq!(detector.action_names(), vec!["reconnect", "resend"]);
        monitor.await.expect("monitor exits on shutdown");
    }
}
