//! Node configuration and protocol timing.

use std::net::SocketAddr;
use std::time::Duration;

/// Offset between a node's RPC port and its HTTP port when none is given.
pub const HTTP_PORT_OFFSET: u16 = 1000;

/// Timing knobs for the failure detector, the connection pool and every RPC.
///
/// The defaults are the production values. Tests shrink them so a full
/// detect/heal cycle completes in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Pause between heartbeat rounds.
    pub heartbeat_period: Duration,
    /// Deadline applied to every outbound RPC.
    pub rpc_timeout: Duration,
    /// Heartbeat attempts per peer per round.
    pub heartbeat_attempts: u32,
    /// First sleep after a failed heartbeat; doubles after every failure.
    pub heartbeat_backoff: Duration,
    /// Dial attempts before a peer is reported unreachable.
    pub dial_attempts: u32,
    /// Unit of the linear dial backoff: attempt `n` waits `n * dial_backoff`.
    pub dial_backoff: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            heartbeat_period: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(2),
            heartbeat_attempts: 5,
            heartbeat_backoff: Duration::from_secs(1),
            dial_attempts: 5,
            dial_backoff: Duration::from_secs(1),
        }
    }
}

impl Timing {
    /// Backoff to sleep after the failed heartbeat attempt `attempt` (0-based).
    pub fn heartbeat_backoff_after(&self, attempt: u32) -> Duration {
        self.heartbeat_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Backoff to sleep after the failed dial attempt `attempt` (0-based).
    pub fn dial_backoff_after(&self, attempt: u32) -> Duration {
        self.dial_backoff.saturating_mul(attempt + 1)
    }
}

/// Everything `spawn_node` needs to bring a node up.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address the RPC listener binds. Port 0 picks an ephemeral port.
    pub listen: SocketAddr,
    /// Identity advertised to peers (`host:port`). Defaults to the bound address.
    pub advertise: Option<String>,
    /// Address the HTTP front door binds. `None` disables it.
    pub http_listen: Option<SocketAddr>,
    /// Bootstrap targets.
    pub initial_peers: Vec<String>,
    pub timing: Timing,
}

impl NodeConfig {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            advertise: None,
            http_listen: None,
            initial_peers: Vec::new(),
            timing: Timing::default(),
        }
    }
}

/// HTTP port paired with an RPC port.
pub fn http_port_for(rpc_port: u16) -> u16 {
    rpc_port.saturating_add(HTTP_PORT_OFFSET)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_backoff_doubles_from_one_second() {
        let timing = Timing::default();
        let waits: Vec<u64> = (0..timing.heartbeat_attempts)
            .map(|attempt| timing.heartbeat_backoff_after(attempt).as_secs())
            .collect();
        assert_eq!(waits, vec![1, 2, 4, 8, 16]);
        assert_eq!(waits.iter().sum::<u64>(), 31);
    }

    #[test]
    fn dial_backoff_is_linear() {
        let timing = Timing::default();
        let waits: Vec<u64> = (0..timing.dial_attempts)
            .map(|attempt| timing.dial_backoff_after(attempt).as_secs())
            .collect();
        assert_eq!(waits, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn http_port_is_rpc_port_plus_offset() {
        assert_eq!(http_port_for(8080), 9080);
        assert_eq!(http_port_for(u16::MAX), u16::MAX);
    }
}
