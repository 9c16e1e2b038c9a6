//! A self-organizing cluster that replicates one counter.
//!
//! Nodes find each other transitively from a few seed addresses, watch each
//! other with heartbeats, and replicate increments as uniquely tagged
//! operations. Delivery is at-least-once: an operation that cannot reach a
//! peer is queued and replayed when that peer heals. Application is
//! idempotent: each operation id moves a node's counter at most once.
//!
//! There is no quorum and no persistence; membership views may briefly
//! disagree and the counter is only eventually consistent.
//!
//! - [`node`]: membership and counter state behind one lock, plus the RPC handlers
//! - [`pool`]: cached outbound channels with linear dial backoff
//! - [`discovery`]: bootstrap walk and join-time counter merge
//! - [`heartbeat`]: the failure detector
//! - [`recovery`]: Reconnect and Resend, run when a peer heals
//! - [`replication`]: local increments, broadcast and missed-op queuing
//! - [`transport`]: the request/response seam, over TCP or in memory
//! - [`message`]: the JSON line protocol
//! - [`server`] and [`http`]: the RPC listener and the client-facing endpoints
//! - [`runtime`]: wiring a node up from a [`config::NodeConfig`]

pub mod cli;
pub mod config;
pub mod discovery;
pub mod heartbeat;
pub mod http;
pub mod message;
pub mod node;
pub mod pool;
pub mod recovery;
pub mod replication;
pub mod runtime;
pub mod server;
pub mod transport;
