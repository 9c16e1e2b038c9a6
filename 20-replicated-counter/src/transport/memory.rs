//! In-process transport: nodes in one process calling each other directly.
//!
//! Links can be severed and nodes taken down to simulate partitions and
//! crashes without sockets or wall-clock heavy timeouts.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;

use super::{Connector, PeerChannel, RpcError};
use crate::message::{Request, Response};
use crate::node::Node;

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<String, Weak<Node>>,
    severed: HashSet<(String, String)>,
    down: HashSet<String>,
}

#[derive(Default)]
pub struct MemoryNetwork {
    state: Mutex<NetworkState>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connector for the node whose identity is `local`.
    pub fn connector(self: &Arc<Self>, local: impl Into<String>) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            network: Arc::clone(self),
            local: local.into(),
        })
    }

    /// Makes `node` reachable under its id.
    pub fn attach(&self, node: &Arc<Node>) {
        self.lock()
            .nodes
            .insert(node.id().to_string(), Arc::downgrade(node));
    }

    /// Cuts the link between `a` and `b` in both directions.
    pub fn partition(&self, a: &str, b: &str) {
        self.lock().severed.insert(link(a, b));
    }

    pub fn heal(&self, a: &str, b: &str) {
        self.lock().severed.remove(&link(a, b));
    }

    /// Node refuses dials and calls until [`MemoryNetwork::bring_up`].
    pub fn take_down(&self, id: &str) {
        self.lock().down.insert(id.to_string());
    }

    pub fn bring_up(&self, id: &str) {
        self.lock().down.remove(id);
    }

    fn route(&self, from: &str, to: &str) -> Result<Arc<Node>, RpcError> {
        let state = self.lock();
        let unreachable = || RpcError::Unreachable {
            peer: to.to_string(),
        };
        if state.down.contains(to) || state.severed.contains(&link(from, to)) {
            return Err(unreachable());
        }
        state
            .nodes
            .get(to)
            .and_then(Weak::upgrade)
            .ok_or_else(unreachable)
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn link(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

struct MemoryConnector {
    network: Arc<MemoryNetwork>,
    local: String,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn PeerChannel>, RpcError> {
        if self.network.lock().down.contains(addr) {
            return Err(RpcError::Unreachable {
                peer: addr.to_string(),
            });
        }
        Ok(Arc::new(MemoryChannel {
            network: Arc::clone(&self.network),
            from: self.local.clone(),
            to: addr.to_string(),
        }))
    }
}

struct MemoryChannel {
    network: Arc<MemoryNetwork>,
    from: String,
    to: String,
}

#[async_trait]
impl PeerChannel for MemoryChannel {
    async fn call(&self, request: Request) -> Result<Response, RpcError> {
        let node = self.network.route(&self.from, &self.to)?;
        Ok(node.serve(request))
    }

    async fn close(&self) {}
}
