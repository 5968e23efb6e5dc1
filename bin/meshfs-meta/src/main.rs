//! meshfs Metadata Server
//!
//! Runs the back channel to the configured storage nodes: the outbound send
//! queue, the status heartbeat and node liveness tracking.

use anyhow::{Context, Result};
use clap::Parser;
use meshfs_common::Config;
use meshfs_common::config::NodeConfig;
use meshfs_meta::back_channel::BackChannel;
use meshfs_meta::heartbeat::Heartbeat;
use meshfs_meta::node::NodeDirectory;
use meshfs_meta::transport::TcpTransport;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "meshfs-meta")]
#[command(about = "meshfs Metadata Server")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/meshfs/meta.toml")]
    config: PathBuf,

    /// Storage node to add (name=host:port)
    #[arg(long)]
    node: Vec<String>,

    /// Number of send workers (overrides sendq.worker_threads)
    #[arg(long)]
    workers: Option<usize>,

    /// Heartbeat interval in milliseconds
    #[arg(long)]
    heartbeat_ms: Option<u64>,

    /// Log level (overrides logging.level)
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn apply(&self, config: &mut Config) -> Result<()> {
        for entry in &self.node {
            let (name, address) = entry
                .split_once('=')
                .with_context(|| format!("invalid --node {entry}, expected name=host:port"))?;
            config.nodes.push(NodeConfig {
                name: name.to_string(),
                address: address.to_string(),
                id: None,
            });
        }
        if let Some(workers) = self.workers {
            config.sendq.worker_threads = workers;
            config.sendq.job_queue_length = workers * 10;
        }
        if let Some(ms) = self.heartbeat_ms {
            config.back_channel.heartbeat_interval_ms = ms;
        }
        if let Some(level) = &self.log_level {
            config.logging.level.clone_from(level);
        }
        config.validate()?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    args.apply(&mut config)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting meshfs Metadata Server");

    let nodes = Arc::new(NodeDirectory::from_config(&config.nodes)?);
    for id in nodes.ids() {
        if let Some(node) = nodes.get(&id) {
            info!("storage node {} at {} ({})", node.name, node.address, id);
        }
    }

    let transport = Arc::new(TcpTransport::new(Duration::from_millis(
        config.back_channel.request_timeout_ms,
    )));
    let back_channel = Arc::new(BackChannel::start(&config, nodes, transport)?);
    let heartbeat = Heartbeat::spawn(
        Arc::clone(&back_channel),
        Duration::from_millis(config.back_channel.heartbeat_interval_ms),
    );

    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");

    heartbeat.stop().await;
    back_channel.shutdown().await;

    let stats = back_channel.stats();
    info!(
        "sent {} requests, {} aborted, {} refused as unreachable",
        stats.dispatched, stats.aborted, stats.unreachable
    );
    info!("Metadata Server shut down gracefully");

    Ok(())
}
