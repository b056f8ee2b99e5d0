//! relaychatd: one cluster node. Reads the cluster's topology, finds its
//! own entry in it, and runs the bootstrap sequence in [`node`].

mod config;
mod dispatcher;
mod node;

use anyhow::Context;
use clap::Parser;
use config::ClusterConfig;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// relaychat cluster node daemon.
#[derive(Debug, Parser)]
#[command(name = "relaychatd", version, about = "Runs one node of a replicated relaychat cluster")]
struct Cli {
    /// This node's name, as it appears in the cluster config file.
    #[arg(long)]
    node: String,

    /// Path to the cluster config JSON file (shared by every node).
    #[arg(long, default_value = "cluster_config.json")]
    config: PathBuf,

    /// Directory holding this node's message log and account file.
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,

    /// Optional file to mirror logs into, in addition to stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_logging(log_file: Option<&std::path::Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    let registry = tracing_subscriber::registry().with(filter).with(stderr_layer);

    if let Some(path) = log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        let file_layer = fmt::layer().with_ansi(false).with_writer(Mutex::new(file));
        registry.with(file_layer).init();
    } else {
        registry.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref())?;

    let cluster = ClusterConfig::load(&cli.config).with_context(|| format!("loading cluster config {}", cli.config.display()))?;
    let entry = cluster.node(&cli.node)?.clone();
    let peers = cluster.peers_of(&cli.node);

    tracing::info!(node = %cli.node, peers = peers.len(), "starting relaychatd");
    node::run(entry, peers, &cli.data_dir).await
}
