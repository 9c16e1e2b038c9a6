//! Node state: membership, the replicated counter and its bookkeeping.
//!
//! Everything mutable sits in one [`NodeState`] behind one `std::sync::Mutex`.
//! The lock is only held for in-memory edits and is never held across an
//! `.await`; network calls happen outside and merge their results back in.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::config::Timing;
use crate::message::{Request, Response};
use crate::transport::{Connector, PeerChannel};

pub(crate) struct NodeState {
    /// Peers believed alive. Never contains the node's own id.
    pub(crate) peers: BTreeSet<String>,
    /// Peers believed dead. Disjoint from `peers`.
    pub(crate) dead_peers: BTreeSet<String>,
    pub(crate) counter: i64,
    pub(crate) seen_ops: HashSet<String>,
    /// Operations still owed to each peer, in the order they failed.
    pub(crate) missed_ops: HashMap<String, Vec<String>>,
    pub(crate) connections: HashMap<String, Arc<dyn PeerChannel>>,
}

/// One cluster member.
pub struct Node {
    id: String,
    timing: Timing,
    connector: Arc<dyn Connector>,
    state: Mutex<NodeState>,
}

impl Node {
    pub fn new(id: impl Into<String>, connector: Arc<dyn Connector>, timing: Timing) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            timing,
            connector,
            state: Mutex::new(NodeState {
                peers: BTreeSet::new(),
                dead_peers: BTreeSet::new(),
                counter: 0,
                seen_ops: HashSet::new(),
                missed_ops: HashMap::new(),
                connections: HashMap::new(),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub(crate) fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, NodeState> {
        // Every critical section leaves the state consistent, so a panic
        // elsewhere while holding the lock does not invalidate it.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// This node followed by every peer believed alive.
    pub fn peers(&self) -> Vec<String> {
        let state = self.state();
        std::iter::once(self.id.clone())
            .chain(state.peers.iter().cloned())
            .collect()
    }

    /// Peers believed alive, excluding this node.
    pub fn alive_peers(&self) -> Vec<String> {
        self.state().peers.iter().cloned().collect()
    }

    pub fn dead_peers(&self) -> Vec<String> {
        self.state().dead_peers.iter().cloned().collect()
    }

    /// This node, the live peers and the dead peers: what Register and GetPeers answer.
    pub fn known_peers(&self) -> Vec<String> {
        let state = self.state();
        std::iter::once(self.id.clone())
            .chain(state.peers.iter().cloned())
            .chain(state.dead_peers.iter().cloned())
            .collect()
    }

    /// True for this node and for any peer in either membership list.
    pub fn knows(&self, peer: &str) -> bool {
        if peer == self.id {
            return true;
        }
        let state = self.state();
        state.peers.contains(peer) || state.dead_peers.contains(peer)
    }

    pub fn is_dead(&self, peer: &str) -> bool {
        self.state().dead_peers.contains(peer)
    }

    /// Adds peers this node has never heard of to the live set.
    ///
    /// Self, empty ids and peers already live or dead are skipped; dead peers
    /// only come back through the failure detector. Returns the newly added ids.
    pub fn add_peers<I, S>(&self, candidates: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = self.state();
        let mut added = Vec::new();
        for candidate in candidates {
            let candidate = candidate.as_ref();
            if candidate.is_empty()
                || candidate == self.id
                || state.dead_peers.contains(candidate)
                || state.peers.contains(candidate)
            {
                continue;
            }
            state.peers.insert(candidate.to_string());
            added.push(candidate.to_string());
        }
        added
    }

    /// Moves `peer` from the live set to the dead set.
    pub(crate) fn mark_dead(&self, peer: &str) {
        let mut state = self.state();
        state.peers.remove(peer);
        if peer != self.id {
            state.dead_peers.insert(peer.to_string());
        }
    }

    /// Moves `peer` from the dead set back to the live set.
    pub(crate) fn mark_alive(&self, peer: &str) {
        if peer == self.id {
            return;
        }
        let mut state = self.state();
        state.dead_peers.remove(peer);
        state.peers.insert(peer.to_string());
    }

    pub fn counter(&self) -> i64 {
        self.state().counter
    }

    pub fn has_seen(&self, op_id: &str) -> bool {
        self.state().seen_ops.contains(op_id)
    }

    pub fn seen_op_count(&self) -> usize {
        self.state().seen_ops.len()
    }

    /// Operations still owed to `peer`, oldest first.
    pub fn missed_ops(&self, peer: &str) -> Vec<String> {
        self.state()
            .missed_ops
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn queue_missed_op(&self, peer: &str, op_id: &str) {
        self.state()
            .missed_ops
            .entry(peer.to_string())
            .or_default()
            .push(op_id.to_string());
    }

    /// Drops one delivered operation from `peer`'s backlog.
    pub(crate) fn ack_missed_op(&self, peer: &str, op_id: &str) {
        let mut state = self.state();
        if let Some(queue) = state.missed_ops.get_mut(peer) {
            if let Some(index) = queue.iter().position(|queued| queued == op_id) {
                queue.remove(index);
            }
            if queue.is_empty() {
                state.missed_ops.remove(peer);
            }
        }
    }

    /// Answers one RPC from a peer.
    pub fn serve(&self, request: Request) -> Response {
        match request {
            Request::Register { id } => {
                self.register_peer(&id);
                Response::Peers {
                    peers: self.known_peers(),
                }
            }
            Request::Heartbeat { id } => {
                debug!(node = %self.id, from = %id, "received heartbeat");
                Response::Alive { alive: true }
            }
            Request::PropagateIncrement { op_id } => {
                self.apply_remote_increment(&op_id);
                Response::Ack { success: true }
            }
            Request::GetCounter => Response::Counter {
                counter: self.counter(),
            },
            Request::GetPeers => Response::Peers {
                peers: self.known_peers(),
            },
        }
    }

    fn register_peer(&self, id: &str) {
        if self.add_peers([id]).is_empty() {
            debug!(node = %self.id, peer = %id, "peer re-registered");
        } else {
            info!(node = %self.id, peer = %id, "registered peer");
        }
    }
}
