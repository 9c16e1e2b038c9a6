//! Actions run against a peer right after it heals.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::node::Node;

/// Something to do when a peer comes back from the dead.
///
/// Actions are best-effort: they log their failures and return, and the
/// detector runs the next registered action regardless.
#[async_trait]
pub trait RecoveryAction: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, node: &Node, peer: &str);
}

/// Re-verifies a healed peer and re-registers with it.
#[derive(Debug, Default, Clone, Copy)]
pub struct Reconnect;

#[async_trait]
impl RecoveryAction for Reconnect {
    fn name(&self) -> &'static str {
        "reconnect"
    }

    async fn execute(&self, node: &Node, peer: &str) {
        let client = match node.get_or_create_client(peer).await {
            Ok(client) => client,
            Err(err) => {
                warn!(peer = %peer, error = %err, "reconnect: no channel");
                return;
            }
        };

        if let Err(err) = client.heartbeat(node.id()).await {
            warn!(peer = %peer, error = %err, "reconnect: heartbeat failed");
        }

        match client.register(node.id()).await {
            Ok(peers) => {
                let learned = node.add_peers(&peers);
                if !learned.is_empty() {
                    info!(peer = %peer, learned = ?learned, "reconnect: learned new peers");
                }
                debug!(peer = %peer, "reconnect: re-registered");
            }
            Err(err) => warn!(peer = %peer, error = %err, "reconnect: register failed"),
        }
    }
}

/// Replays the operations a healed peer missed while it was unreachable.
#[derive(Debug, Default, Clone, Copy)]
pub struct Resend;

#[async_trait]
impl RecoveryAction for Resend {
    fn name(&self) -> &'static str {
        "resend"
    }

    async fn execute(&self, node: &Node, peer: &str) {
        let backlog = node.missed_ops(peer);
        if backlog.is_empty() {
            return;
        }
        info!(peer = %peer, count = backlog.len(), "resending missed ops");

        let mut delivered = 0usize;
        for op_id in &backlog {
            match node.propagate(peer, op_id).await {
                Ok(()) => {
                    node.ack_missed_op(peer, op_id);
                    delivered += 1;
                }
                // Stays queued for the next heal.
                Err(err) => warn!(peer = %peer, op_id = %op_id, error = %err, "failed to resend op"),
            }
        }
        info!(peer = %peer, delivered, remaining = backlog.len() - delivered, "resend finished");
    }
}
