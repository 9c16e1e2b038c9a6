use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use replicated_counter::{cli::Cli, runtime::spawn_node};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = cli.into_config();
    let handle = spawn_node(config).await?;
    info!(
        node = %handle.id(),
        http = ?handle.http_addr(),
        peers = ?handle.node().peers(),
        "node is running"
    );

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = ?err, "failed to install ctrl-c handler");
    }
    handle.shutdown().await;

    Ok(())
}
