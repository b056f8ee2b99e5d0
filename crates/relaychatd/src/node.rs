//! Node bootstrap sequence (spec §4.I).
//!
//! Mirrors the order the original `server.py` boots a node — replay log,
//! bring up the inbound peer RPC surface, build the outbound sync client,
//! give sibling nodes a moment to have done the same before asking them
//! for data, reconcile with the cluster, snapshot the reconciled state
//! back to disk, then start taking client connections. Doing client
//! acceptance last means a client can never observe a node that hasn't
//! finished reconciling with its peers yet.

use crate::config::NodeEntry;
use crate::dispatcher::{self, SessionContext};
use anyhow::Context;
use relaychat_core::accounts::AccountRegistry;
use relaychat_core::presence::Presence;
use relaychat_core::store::Store;
use relaychat_core::sync::{serve as serve_rpc, SyncClient};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

/// How long a freshly-started node waits before asking peers for data,
/// giving a cluster that's restarting all at once a chance for every
/// node's RPC listener to be up. Matches the original system's fixed
/// startup delay.
const STARTUP_GRACE_PERIOD: Duration = Duration::from_secs(3);

pub async fn run(node: NodeEntry, peers: Vec<(String, SocketAddr)>, data_dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(data_dir).with_context(|| format!("creating data directory {}", data_dir.display()))?;

    let log_path = data_dir.join(format!("{}.json", node.name));
    let accounts_path = data_dir.join(format!("{}.accounts.json", node.name));

    info!(node = %node.name, log = %log_path.display(), "replaying message log");
    let store = Arc::new(Store::open(&log_path).context("opening message log")?);
    let accounts = Arc::new(AccountRegistry::open(&accounts_path).context("opening account registry")?);

    info!(addr = %node.rpc_addr, "starting peer RPC listener");
    let rpc_store = Arc::clone(&store);
    let rpc_addr = node.rpc_addr;
    tokio::spawn(async move {
        if let Err(e) = serve_rpc(rpc_addr, rpc_store).await {
            tracing::error!(error = %e, "peer RPC listener exited");
        }
    });

    let sync_client = Arc::new(SyncClient::new(peers));
    info!(peers = sync_client.peer_count(), "waiting out startup grace period before reconciling");
    tokio::time::sleep(STARTUP_GRACE_PERIOD).await;

    sync_client.startup_reconcile(&store).await;
    info!("startup reconciliation complete, compacting log");
    store.compact().context("compacting message log after reconcile")?;

    let presence = Arc::new(Presence::new());
    let ctx = Arc::new(SessionContext { store, accounts, sync_client, presence });

    info!(addr = %node.client_addr, "accepting client connections");
    let listener = TcpListener::bind(node.client_addr)
        .await
        .with_context(|| format!("binding client listener on {}", node.client_addr))?;

    loop {
        let (socket, peer_addr) = listener.accept().await.context("accepting client connection")?;
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            dispatcher::run_session(socket, peer_addr, ctx).await;
        });
    }
}
