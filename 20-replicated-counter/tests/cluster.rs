use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use replicated_counter::{
    config::Timing,
    discovery::bootstrap,
    heartbeat::{FailureDetector, ProbeOutcome},
    message::{Request, Response},
    node::Node,
    transport::{memory::MemoryNetwork, Connector, PeerChannel, RpcError},
};
use tokio::time::sleep;

fn fast() -> Timing {
    Timing {
        heartbeat_period: Duration::from_millis(20),
        rpc_timeout: Duration::from_millis(200),
        heartbeat_backoff: Duration::from_millis(1),
        dial_backoff: Duration::from_millis(1),
        ..Timing::default()
    }
}

fn spawn(network: &Arc<MemoryNetwork>, id: &str) -> Arc<Node> {
    let node = Node::new(id, network.connector(id), fast());
    network.attach(&node);
    node
}

/// Delays every call to one peer; other peers go through untouched.
struct SlowPeer {
    inner: Arc<dyn Connector>,
    slow: String,
    delay: Duration,
}

struct SlowChannel {
    inner: Arc<dyn PeerChannel>,
    delay: Duration,
}

#[async_trait]
impl Connector for SlowPeer {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn PeerChannel>, RpcError> {
        let channel = self.inner.dial(addr).await?;
        if addr != self.slow {
            return Ok(channel);
        }
        Ok(Arc::new(SlowChannel {
            inner: channel,
            delay: self.delay,
        }))
    }
}

#[async_trait]
impl PeerChannel for SlowChannel {
    async fn call(&self, request: Request) -> Result<Response, RpcError> {
        sleep(self.delay).await;
        self.inner.call(request).await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

fn assert_disjoint(node: &Node) {
    let alive: HashSet<String> = node.alive_peers().into_iter().collect();
    for dead in node.dead_peers() {
        assert!(!alive.contains(&dead), "{dead} is both alive and dead on {}", node.id());
    }
    assert!(!alive.contains(node.id()));
}

#[tokio::test]
async fn lone_node_counts_its_own_increments() {
    let network = MemoryNetwork::new();
    let n1 = spawn(&network, "n1:8080");

    for _ in 0..3 {
        let receipt = n1.increment().await;
        assert!(receipt.delivered.is_empty());
        assert!(receipt.queued.is_empty());
    }

    assert_eq!(n1.serve(Request::GetCounter), Response::Counter { counter: 3 });
    assert_eq!(n1.peers(), vec!["n1:8080".to_string()]);
}

#[tokio::test]
async fn increments_reach_a_bootstrapped_peer() {
    let network = MemoryNetwork::new();
    let n1 = spawn(&network, "n1:8080");
    let n2 = spawn(&network, "n2:8081");

    let report = bootstrap(&n2, &["n1:8080"]).await;
    assert_eq!(report.registered, vec!["n1:8080".to_string()]);
    assert_eq!(n1.peers(), vec!["n1:8080".to_string(), "n2:8081".to_string()]);

    for _ in 0..3 {
        let receipt = n1.increment().await;
        assert_eq!(receipt.delivered, vec!["n2:8081".to_string()]);
    }

    assert_eq!(n2.serve(Request::GetCounter), Response::Counter { counter: 3 });
    assert_eq!(n1.counter(), 3);
}

#[tokio::test]
async fn partitioned_peer_gets_missed_ops_when_it_heals() {
    let network = MemoryNetwork::new();
    let n1 = spawn(&network, "n1:8080");
    let n2 = spawn(&network, "n2:8081");
    bootstrap(&n2, &["n1:8080"]).await;
    let detector = FailureDetector::with_default_actions(Arc::clone(&n1));

    network.partition("n1:8080", "n2:8081");
    let first = n1.increment().await;
    let second = n1.increment().await;
    assert_eq!(first.queued, vec!["n2:8081".to_string()]);
    assert_eq!(second.queued, vec!["n2:8081".to_string()]);
    assert_eq!(n1.missed_ops("n2:8081"), vec![first.op_id.clone(), second.op_id.clone()]);
    assert_eq!(n2.counter(), 0);

    let outcomes = detector.run_round().await;
    assert_eq!(outcomes, vec![("n2:8081".to_string(), ProbeOutcome::Died)]);
    assert!(n1.is_dead("n2:8081"));
    assert_disjoint(&n1);

    network.heal("n1:8080", "n2:8081");
    let outcomes = detector.run_round().await;
    assert_eq!(outcomes, vec![("n2:8081".to_string(), ProbeOutcome::Healed)]);

    assert_eq!(n2.counter(), 2);
    assert!(n2.has_seen(&first.op_id) && n2.has_seen(&second.op_id));
    assert!(n1.missed_ops("n2:8081").is_empty());
    assert_eq!(n1.alive_peers(), vec!["n2:8081".to_string()]);
    assert_disjoint(&n1);
}

#[tokio::test]
async fn increments_while_a_peer_is_dead_are_queued_for_it() {
    let network = MemoryNetwork::new();
    let n1 = spawn(&network, "n1:8080");
    let n2 = spawn(&network, "n2:8081");
    bootstrap(&n2, &["n1:8080"]).await;
    let detector = FailureDetector::with_default_actions(Arc::clone(&n1));

    network.partition("n1:8080", "n2:8081");
    detector.run_round().await;
    assert!(n1.is_dead("n2:8081"));

    let receipt = n1.increment().await;
    assert!(receipt.delivered.is_empty());
    assert_eq!(receipt.queued, vec!["n2:8081".to_string()]);
    assert_eq!(n1.peers(), vec!["n1:8080".to_string()]);

    network.heal("n1:8080", "n2:8081");
    detector.run_round().await;

    assert_eq!(n2.counter(), 1);
    assert!(n1.missed_ops("n2:8081").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_increments_are_neither_lost_nor_doubled() {
    let network = MemoryNetwork::new();
    let n1 = spawn(&network, "n1:8080");

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let node = Arc::clone(&n1);
            tokio::spawn(async move { node.increment().await })
        })
        .collect();
    let mut op_ids = HashSet::new();
    for task in tasks {
        let receipt = task.await.expect("increment task");
        op_ids.insert(receipt.op_id);
    }

    assert_eq!(n1.counter(), 50);
    assert_eq!(n1.seen_op_count(), 50);
    assert_eq!(op_ids.len(), 50);
}

#[tokio::test]
async fn concurrent_broadcasts_converge_on_every_peer() {
    let network = MemoryNetwork::new();
    let n1 = spawn(&network, "n1:8080");
    let n2 = spawn(&network, "n2:8081");
    let n3 = spawn(&network, "n3:8082");
    bootstrap(&n2, &["n1:8080"]).await;
    bootstrap(&n3, &["n2:8081"]).await;

    let increments = [&n1, &n2, &n3]
        .into_iter()
        .flat_map(|node| (0..5).map(move |_| node.increment()));
    join_all(increments).await;

    for node in [&n1, &n2, &n3] {
        assert_eq!(node.counter(), 15, "counter on {}", node.id());
        assert_eq!(node.seen_op_count(), 15);
        assert_eq!(node.alive_peers().len(), 2);
    }
}

#[tokio::test]
async fn redelivered_ops_are_applied_once() {
    let network = MemoryNetwork::new();
    let n1 = spawn(&network, "n1:8080");

    let propagate = || Request::PropagateIncrement {
        op_id: "op-1".to_string(),
    };
    assert_eq!(n1.serve(propagate()), Response::Ack { success: true });
    assert_eq!(n1.serve(propagate()), Response::Ack { success: true });
    assert_eq!(n1.serve(propagate()), Response::Ack { success: true });

    assert_eq!(n1.counter(), 1);
    assert_eq!(n1.seen_op_count(), 1);
}

#[tokio::test]
async fn late_joiner_adopts_the_cluster_counter() {
    let network = MemoryNetwork::new();
    let n1 = spawn(&network, "n1:8080");
    let n2 = spawn(&network, "n2:8081");
    bootstrap(&n2, &["n1:8080"]).await;
    for _ in 0..4 {
        n2.increment().await;
    }

    let n3 = spawn(&network, "n3:8082");
    let report = bootstrap(&n3, &["n1:8080"]).await;

    assert_eq!(
        report.registered,
        vec!["n1:8080".to_string(), "n2:8081".to_string()]
    );
    assert_eq!(n3.counter(), 4);
    assert_eq!(
        n3.peers(),
        vec![
            "n3:8082".to_string(),
            "n1:8080".to_string(),
            "n2:8081".to_string()
        ]
    );
    assert_eq!(n1.counter(), 4);
}

#[tokio::test]
async fn crashed_node_is_detected_and_left_out_of_broadcasts() {
    let network = MemoryNetwork::new();
    let n1 = spawn(&network, "n1:8080");
    let n2 = spawn(&network, "n2:8081");
    let n3 = spawn(&network, "n3:8082");
    bootstrap(&n2, &["n1:8080"]).await;
    bootstrap(&n3, &["n1:8080"]).await;
    let detector = FailureDetector::with_default_actions(Arc::clone(&n1));

    network.take_down("n3:8082");
    // An undialable peer is skipped, a severed one dies.
    let outcomes = detector.run_round().await;
    assert!(outcomes.contains(&("n2:8081".to_string(), ProbeOutcome::Alive)));
    assert!(outcomes.contains(&("n3:8082".to_string(), ProbeOutcome::Skipped)));
    assert!(!n1.is_dead("n3:8082"));

    network.bring_up("n3:8082");
    network.partition("n1:8080", "n3:8082");
    let outcomes = detector.run_round().await;
    assert!(outcomes.contains(&("n3:8082".to_string(), ProbeOutcome::Died)));

    let receipt = n1.increment().await;
    assert_eq!(receipt.delivered, vec!["n2:8081".to_string()]);
    assert_eq!(receipt.queued, vec!["n3:8082".to_string()]);
    assert_eq!(n2.counter(), 1);
    assert_eq!(n3.counter(), 0);
    assert_disjoint(&n1);
}

#[tokio::test]
async fn peer_healed_mid_broadcast_still_gets_the_op() {
    let network = MemoryNetwork::new();
    let connector = Arc::new(SlowPeer {
        inner: network.connector("n1:8080"),
        slow: "n3:8082".to_string(),
        delay: Duration::from_millis(100),
    });
    let n1 = Node::new("n1:8080", connector, fast());
    network.attach(&n1);
    let n2 = spawn(&network, "n2:8081");
    let _n3 = spawn(&network, "n3:8082");
    n1.add_peers(["n2:8081", "n3:8082"]);
    let detector = FailureDetector::with_default_actions(Arc::clone(&n1));

    network.partition("n1:8080", "n2:8081");
    assert_eq!(detector.probe("n2:8081").await, ProbeOutcome::Died);
    network.heal("n1:8080", "n2:8081");

    let broadcast = {
        let n1 = Arc::clone(&n1);
        tokio::spawn(async move { n1.increment().await })
    };
    // The broadcast is now stuck on n3 while n2 heals.
    sleep(Duration::from_millis(20)).await;
    assert_eq!(detector.probe("n2:8081").await, ProbeOutcome::Healed);

    let receipt = broadcast.await.expect("increment task");
    assert_eq!(receipt.queued, vec!["n2:8081".to_string()]);
    assert_eq!(receipt.delivered, vec!["n3:8082".to_string()]);
    assert_eq!(n2.counter(), 1);
    assert!(n2.has_seen(&receipt.op_id));
    assert!(n1.missed_ops("n2:8081").is_empty());
    assert_disjoint(&n1);
}
