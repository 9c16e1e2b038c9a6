use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::Parser;

use crate::config::{http_port_for, NodeConfig, Timing};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run one replicated-counter node", long_about = None)]
pub struct Cli {
    /// Port for peer RPCs. The node's identity is `<host>:<port>`.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Host name peers use to reach this node.
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Comma-separated list of peers to bootstrap from, e.g. localhost:8080,localhost:8081
    #[arg(long, value_delimiter = ',', default_value = "")]
    pub peers: Vec<String>,

    /// Port for the HTTP front door. Defaults to the RPC port + 1000.
    #[arg(long)]
    pub http_port: Option<u16>,

    /// Pause between heartbeat rounds, in milliseconds.
    #[arg(long)]
    pub heartbeat_ms: Option<u64>,

    /// Deadline for every outbound RPC, in milliseconds.
    #[arg(long)]
    pub rpc_timeout_ms: Option<u64>,
}

impl Cli {
    pub fn node_id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn into_config(self) -> NodeConfig {
        let mut timing = Timing::default();
        if let Some(ms) = self.heartbeat_ms {
            timing.heartbeat_period = Duration::from_millis(ms);
        }
        if let Some(ms) = self.rpc_timeout_ms {
            timing.rpc_timeout = Duration::from_millis(ms);
        }

        let http_port = self.http_port.unwrap_or_else(|| http_port_for(self.port));
        NodeConfig {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port)),
            advertise: Some(self.node_id()),
            http_listen: Some(SocketAddr::from((Ipv4Addr::UNSPECIFIED, http_port))),
            initial_peers: self
                .peers
                .into_iter()
                .map(|peer| peer.trim().to_string())
                .filter(|peer| !peer.is_empty())
                .collect(),
            timing,
        }
    }
}
