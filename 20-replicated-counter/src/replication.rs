//! The replicated counter: local increments, broadcast, and idempotent apply.
//!
//! Every increment is tagged with a fresh operation id. A node applies an id at
//! most once, so broadcasts, resends and retries may deliver it any number of
//! times. Ids that could not be delivered to a peer are queued in that peer's
//! missed-op backlog and replayed by [`crate::recovery::Resend`] when it heals.

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::node::Node;
use crate::transport::RpcError;

/// Outcome of one local increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementReceipt {
    pub op_id: String,
    /// Counter value right after the local apply.
    pub counter: i64,
    /// Peers that acknowledged the operation.
    pub delivered: Vec<String>,
    /// Peers that now have the operation in their missed-op backlog.
    pub queued: Vec<String>,
}

pub fn new_op_id() -> String {
    nanoid::nanoid!()
}

impl Node {
    /// Applies `op_id` unless it was applied before, returning the new counter.
    ///
    /// The membership check, the insert and the increment form one critical
    /// section, which is what makes concurrent and repeated deliveries safe.
    pub fn apply_op(&self, op_id: &str) -> Option<i64> {
        let mut state = self.state();
        if !state.seen_ops.insert(op_id.to_string()) {
            return None;
        }
        state.counter += 1;
        Some(state.counter)
    }

    /// Handler body for PropagateIncrement.
    pub fn apply_remote_increment(&self, op_id: &str) -> bool {
        match self.apply_op(op_id) {
            Some(counter) => {
                debug!(node = %self.id(), op_id = %op_id, counter, "applied propagated increment");
                true
            }
            None => {
                debug!(node = %self.id(), op_id = %op_id, "duplicate increment ignored");
                false
            }
        }
    }

    /// Raises the counter to `remote` if it is ahead. Returns whether it moved.
    pub fn merge_counter(&self, remote: i64) -> bool {
        let mut state = self.state();
        if remote > state.counter {
            state.counter = remote;
            true
        } else {
            false
        }
    }

    /// Increments locally and broadcasts the new operation to every live peer.
    pub async fn increment(&self) -> IncrementReceipt {
        let op_id = new_op_id();
        let counter = self.apply_op(&op_id).unwrap_or_else(|| self.counter());

        // Dead peers are owed the op in the same critical section that picks
        // the broadcast targets, before anything awaits.
        let (targets, dead) = {
            let mut state = self.state();
            let targets: Vec<String> = state.peers.iter().cloned().collect();
            let dead: Vec<String> = state.dead_peers.iter().cloned().collect();
            for peer in &dead {
                state
                    .missed_ops
                    .entry(peer.clone())
                    .or_default()
                    .push(op_id.clone());
            }
            (targets, dead)
        };

        let op = op_id.as_str();
        let attempts = targets.iter().map(|peer| async move {
            let outcome = self.propagate(peer, op).await;
            (peer.clone(), outcome)
        });

        let mut receipt = IncrementReceipt {
            op_id: op_id.clone(),
            counter,
            delivered: Vec::new(),
            queued: dead,
        };
        for (peer, outcome) in join_all(attempts).await {
            match outcome {
                Ok(()) => receipt.delivered.push(peer),
                Err(err) => {
                    warn!(peer = %peer, op_id = %op_id, error = %err, "failed to propagate increment");
                    self.queue_missed_op(&peer, &op_id);
                    receipt.queued.push(peer);
                }
            }
        }

        info!(
            node = %self.id(),
            op_id = %op_id,
            counter,
            delivered = receipt.delivered.len(),
            queued = receipt.queued.len(),
            "counter incremented"
        );
        receipt
    }

    /// Sends one PropagateIncrement to `peer`. A negative ack counts as failure.
    pub(crate) async fn propagate(&self, peer: &str, op_id: &str) -> Result<(), RpcError> {
        let client = self.get_or_create_client(peer).await?;
        if client.propagate_increment(op_id).await? {
            Ok(())
        } else {
            Err(RpcError::Remote {
                peer: peer.to_string(),
                message: "increment rejected".to_string(),
            })
        }
    }
}
