//! Point-to-point request/response transport between nodes.
//!
//! The core only sees [`Connector`] (dial an address) and [`PeerChannel`]
//! (exchange one [`Request`] for one [`Response`]). [`PeerClient`] layers the
//! typed calls and the fixed per-call deadline on top of a channel.
//!
//! - [`tcp`]: newline-delimited JSON over TCP, connected lazily.
//! - [`memory`]: in-process network with injectable partitions.

pub mod memory;
pub mod tcp;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::timeout;

use crate::message::{Request, Response};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("peer {peer} is unreachable")]
    Unreachable { peer: String },
    #[error("call to {peer} timed out after {after:?}")]
    Timeout { peer: String, after: Duration },
    #[error("i/o error talking to {peer}: {source}")]
    Io {
        peer: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{peer} closed the connection")]
    Closed { peer: String },
    #[error("{peer} answered with an error: {message}")]
    Remote { peer: String, message: String },
    #[error("{peer} sent an unexpected response, wanted {expected}")]
    UnexpectedResponse { peer: String, expected: &'static str },
}

/// An open, reusable channel to one peer.
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Sends one request and waits for its response. No deadline is applied here.
    async fn call(&self, request: Request) -> Result<Response, RpcError>;

    /// Releases whatever the channel holds open. Later calls may reconnect.
    async fn close(&self);
}

/// Creates channels to peer addresses.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn PeerChannel>, RpcError>;
}

/// Typed RPC calls over a channel, each bounded by the same deadline.
#[derive(Clone)]
pub struct PeerClient {
    peer: String,
    channel: Arc<dyn PeerChannel>,
    deadline: Duration,
}

impl PeerClient {
    pub fn new(peer: impl Into<String>, channel: Arc<dyn PeerChannel>, deadline: Duration) -> Self {
        Self {
            peer: peer.into(),
            channel,
            deadline,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Registers `id` with the peer and returns every peer it knows.
    pub async fn register(&self, id: &str) -> Result<Vec<String>, RpcError> {
        match self.call(Request::Register { id: id.to_string() }).await? {
            Response::Peers { peers } => Ok(peers),
            other => Err(self.unexpected(other, "peers")),
        }
    }

    pub async fn heartbeat(&self, id: &str) -> Result<bool, RpcError> {
        match self.call(Request::Heartbeat { id: id.to_string() }).await? {
            Response::Alive { alive } => Ok(alive),
            other => Err(self.unexpected(other, "alive")),
        }
    }

    pub async fn propagate_increment(&self, op_id: &str) -> Result<bool, RpcError> {
        let request = Request::PropagateIncrement {
            op_id: op_id.to_string(),
        };
        match self.call(request).await? {
            Response::Ack { success } => Ok(success),
            other => Err(self.unexpected(other, "ack")),
        }
    }

    pub async fn get_counter(&self) -> Result<i64, RpcError> {
        match self.call(Request::GetCounter).await? {
            Response::Counter { counter } => Ok(counter),
            other => Err(self.unexpected(other, "counter")),
        }
    }

    pub async fn get_peers(&self) -> Result<Vec<String>, RpcError> {
        match self.call(Request::GetPeers).await? {
            Response::Peers { peers } => Ok(peers),
            other => Err(self.unexpected(other, "peers")),
        }
    }

    pub async fn close(&self) {
        self.channel.close().await;
    }

    async fn call(&self, request: Request) -> Result<Response, RpcError> {
        match timeout(self.deadline, self.channel.call(request)).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout {
                peer: self.peer.clone(),
                after: self.deadline,
            }),
        }
    }

    fn unexpected(&self, response: Response, expected: &'static str) -> RpcError {
        match response {
            Response::Error { message } => RpcError::Remote {
                peer: self.peer.clone(),
                message,
            },
            _ => RpcError::UnexpectedResponse {
                peer: self.peer.clone(),
                expected,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted(Response);

    #[async_trait]
    impl PeerChannel for Scripted {
        async fn call(&self, _request: Request) -> Result<Response, RpcError> {
            Ok(self.0.clone())
        }

        async fn close(&self) {}
    }

    struct Stalled;

    #[async_trait]
    impl PeerChannel for Stalled {
        async fn call(&self, _request: Request) -> Result<Response, RpcError> {
            std::future::pending().await
        }

        async fn close(&self) {}
    }

    fn client(channel: impl PeerChannel + 'static) -> PeerClient {
        PeerClient::new("peer:1", Arc::new(channel), Duration::from_millis(50))
    }

    #[tokio::test]
    async fn error_response_becomes_remote_error() {
        let client = client(Scripted(Response::Error {
            message: "boom".into(),
        }));
        let err = client.get_counter().await.expect_err("must fail");
        assert!(matches!(err, RpcError::Remote { ref message, .. } if message == "boom"));
    }

    #[tokio::test]
    async fn mismatched_response_is_rejected() {
        let client = client(Scripted(Response::Alive { alive: true }));
        let err = client.get_peers().await.expect_err("must fail");
        assert!(matches!(
            err,
            RpcError::UnexpectedResponse {
                expected: "peers",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn stalled_call_hits_the_deadline() {
        let client = client(Stalled);
        let err = client.heartbeat("me").await.expect_err("must time out");
        assert!(matches!(err, RpcError::Timeout { ref peer, .. } if peer == "peer:1"));
    }
}
