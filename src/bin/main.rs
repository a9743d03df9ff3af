use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use txcoord_core::NodeConfig;
use txcoord_rpc::CoordinatorNode;

#[derive(Parser)]
#[command(name = "txcoord")]
#[command(about = "Two-phase commit transaction coordinator node", long_about = None)]
struct Args {
    /// TOML config file; TXCOORD__* environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Shard this node hosts
    #[arg(long)]
    shard_id: Option<String>,

    /// Admin endpoint address, e.g. 127.0.0.1:27100
    #[arg(long)]
    listen: Option<String>,

    /// Directory for durable coordinator documents
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Peer shard as NAME=URL; repeatable
    #[arg(long = "shard", value_parser = parse_shard)]
    shards: Vec<(String, String)>,
}

fn parse_shard(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, url)) if !name.is_empty() && !url.is_empty() => {
            Ok((name.to_string(), url.to_string()))
        }
        _ => Err(format!("expected NAME=URL, got '{}'", raw)),
    }
}

fn load_config(args: Args) -> Result<NodeConfig> {
    let mut config = NodeConfig::load(args.config.as_deref()).context("loading node config")?;
    if let Some(shard_id) = args.shard_id {
        config.shard_id = shard_id;
    }
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = Some(data_dir);
    }
    config.shards.extend(args.shards);
    config.validate().context("validating node config")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config(Args::parse())?;
    info!("Starting transaction coordinator for shard {}", config.shard_id);

    let node = CoordinatorNode::build(config).context("building coordinator node")?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown requested, stepping down");
    };

    node.run(shutdown).await.context("running coordinator node")?;
    Ok(())
}
