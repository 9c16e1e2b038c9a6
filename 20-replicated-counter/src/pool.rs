//! Cached outbound channels, one per peer.

use std::sync::Arc;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::node::Node;
use crate::transport::{PeerClient, RpcError};

impl Node {
    /// Returns a client for `peer`, dialing and caching a channel on first use.
    ///
    /// A failed dial is retried with linear backoff. After the last attempt the
    /// peer is reported [`RpcError::Unreachable`]; callers treat that as
    /// "skip for now", never as fatal.
    pub async fn get_or_create_client(&self, peer: &str) -> Result<PeerClient, RpcError> {
        let deadline = self.timing().rpc_timeout;
        let cached = self.state().connections.get(peer).cloned();
        if let Some(channel) = cached {
            return Ok(PeerClient::new(peer, channel, deadline));
        }

        let attempts = self.timing().dial_attempts;
        for attempt in 0..attempts {
            match self.connector().dial(peer).await {
                Ok(channel) => {
                    // A concurrent caller may have won the race; keep whichever landed first.
                    let channel = Arc::clone(
                        self.state()
                            .connections
                            .entry(peer.to_string())
                            .or_insert(channel),
                    );
                    debug!(node = %self.id(), peer = %peer, "pooled channel");
                    return Ok(PeerClient::new(peer, channel, deadline));
                }
                Err(err) => {
                    warn!(peer = %peer, attempt = attempt + 1, error = %err, "failed to connect");
                    sleep(self.timing().dial_backoff_after(attempt)).await;
                }
            }
        }

        warn!(peer = %peer, attempts, "unable to establish connection");
        Err(RpcError::Unreachable {
            peer: peer.to_string(),
        })
    }

    /// Removes and closes the pooled channel for `peer`, if any.
    pub async fn evict_client(&self, peer: &str) {
        let channel = self.state().connections.remove(peer);
        if let Some(channel) = channel {
            channel.close().await;
            debug!(node = %self.id(), peer = %peer, "evicted channel");
        }
    }

    pub fn pooled_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.state().connections.keys().cloned().collect();
        peers.sort();
        peers
    }
}
